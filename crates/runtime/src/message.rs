//! Message records: routing headers and the suite that carries them.
//!
//! A message is routed by masked key matching, not by object references:
//! an [`Invoice`] names a receiver key plus a mask, and any subscriber
//! whose key satisfies `(key & mask) == receiver` gets the call. That
//! keeps senders fully decoupled from receiver lifetimes.
//!
//! A [`Suite`] bundles the routing records with an optional type-erased
//! parameter. Receivers recover the parameter by presenting the matching
//! [`TypeToken`]; there is no downcast chain through trait hierarchies.

use std::any::Any;

use serde::{Deserialize, Serialize};
use tarn_core::token::TypeToken;

/// Identifier used by all message routing records.
pub type Key = u32;

/// Delivery address header: who sent, which addresses receive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    sender_address: Key,
    receiver_address: Key,
    receiver_mask: Key,
}

impl Tag {
    pub const fn new(sender_address: Key, receiver_address: Key, receiver_mask: Key) -> Self {
        Self {
            sender_address,
            receiver_address,
            receiver_mask,
        }
    }

    pub fn sender_address(&self) -> Key {
        self.sender_address
    }

    pub fn receiver_address(&self) -> Key {
        self.receiver_address
    }

    pub fn receiver_mask(&self) -> Key {
        self.receiver_mask
    }

    /// Whether `address` is covered by the receiver address and mask.
    pub fn agree_receiver_address(&self, address: Key) -> bool {
        (address & self.receiver_mask) == self.receiver_address
    }
}

/// Which method a message invokes, and where it sits in a sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    method: Key,
    sequence: Key,
}

impl Call {
    pub const fn new(method: Key, sequence: Key) -> Self {
        Self { method, sequence }
    }

    pub fn method(&self) -> Key {
        self.method
    }

    pub fn sequence(&self) -> Key {
        self.sequence
    }
}

/// Routing header of an RPC message.
///
/// The zone and dispatcher fields select which zones/dispatchers relay
/// the message; a zero mask matches everything carrying key zero, which
/// is the "relay anywhere" default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    sender_key: Key,
    zone_key: Key,
    zone_mask: Key,
    dispatcher_key: Key,
    dispatcher_mask: Key,
    receiver_key: Key,
    receiver_mask: Key,
    function_key: Key,
}

impl Invoice {
    pub const fn new(
        sender_key: Key,
        receiver_key: Key,
        receiver_mask: Key,
        function_key: Key,
    ) -> Self {
        Self {
            sender_key,
            zone_key: 0,
            zone_mask: 0,
            dispatcher_key: 0,
            dispatcher_mask: 0,
            receiver_key,
            receiver_mask,
            function_key,
        }
    }

    /// Restrict which zones relay this message.
    pub const fn with_zone(mut self, zone_key: Key, zone_mask: Key) -> Self {
        self.zone_key = zone_key;
        self.zone_mask = zone_mask;
        self
    }

    /// Restrict which dispatchers relay this message.
    pub const fn with_dispatcher(mut self, dispatcher_key: Key, dispatcher_mask: Key) -> Self {
        self.dispatcher_key = dispatcher_key;
        self.dispatcher_mask = dispatcher_mask;
        self
    }

    pub fn sender_key(&self) -> Key {
        self.sender_key
    }

    pub fn receiver_key(&self) -> Key {
        self.receiver_key
    }

    pub fn receiver_mask(&self) -> Key {
        self.receiver_mask
    }

    pub fn function_key(&self) -> Key {
        self.function_key
    }

    /// Whether a receiver with `key` matches this invoice.
    pub fn verify_receiver_key(&self, key: Key) -> bool {
        Self::verify_key(key, self.receiver_key, self.receiver_mask)
    }

    /// Whether a zone with `key` should relay this invoice.
    pub fn verify_zone_key(&self, key: Key) -> bool {
        Self::verify_key(key, self.zone_key, self.zone_mask)
    }

    /// Whether a dispatcher with `key` should relay this invoice.
    pub fn verify_dispatcher_key(&self, key: Key) -> bool {
        Self::verify_key(key, self.dispatcher_key, self.dispatcher_mask)
    }

    fn verify_key(key: Key, target_key: Key, target_mask: Key) -> bool {
        (key & target_mask) == target_key
    }
}

/// Monomorphic encoder stored beside a serializable parameter so an
/// already-erased value can still be flattened for transport.
type ParameterEncode = fn(&(dyn Any + Send + Sync)) -> Option<Vec<u8>>;

struct Parameter {
    token: TypeToken,
    value: Box<dyn Any + Send + Sync>,
    encode: Option<ParameterEncode>,
}

/// A complete message: tag, call, invoice, and an optional erased
/// parameter.
pub struct Suite {
    tag: Tag,
    call: Call,
    invoice: Invoice,
    parameter: Option<Parameter>,
}

impl Suite {
    /// A parameterless message.
    pub fn new(invoice: Invoice) -> Self {
        Self {
            tag: Tag::default(),
            call: Call::default(),
            invoice,
            parameter: None,
        }
    }

    /// A message carrying `parameter`. The parameter is erased; receivers
    /// recover it with [`Suite::parameter`] and the matching type.
    pub fn with_parameter<P: Send + Sync + 'static>(invoice: Invoice, parameter: P) -> Self {
        Self {
            tag: Tag::default(),
            call: Call::default(),
            invoice,
            parameter: Some(Parameter {
                token: TypeToken::of::<P>(),
                value: Box::new(parameter),
                encode: None,
            }),
        }
    }

    /// Like [`Suite::with_parameter`], for parameters that can also be
    /// flattened to bytes for transport across zones.
    pub fn with_portable_parameter<P>(invoice: Invoice, parameter: P) -> Self
    where
        P: Serialize + Send + Sync + 'static,
    {
        fn encode<P: Serialize + 'static>(value: &(dyn Any + Send + Sync)) -> Option<Vec<u8>> {
            let parameter = value.downcast_ref::<P>()?;
            bincode::serialize(parameter).ok()
        }
        Self {
            tag: Tag::default(),
            call: Call::default(),
            invoice,
            parameter: Some(Parameter {
                token: TypeToken::of::<P>(),
                value: Box::new(parameter),
                encode: Some(encode::<P>),
            }),
        }
    }

    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tag = tag;
        self
    }

    pub fn with_call(mut self, call: Call) -> Self {
        self.call = call;
        self
    }

    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    pub fn call(&self) -> &Call {
        &self.call
    }

    pub fn invoice(&self) -> &Invoice {
        &self.invoice
    }

    /// Token of the carried parameter; the nil token when there is none.
    pub fn parameter_token(&self) -> TypeToken {
        self.parameter
            .as_ref()
            .map(|parameter| parameter.token)
            .unwrap_or_else(TypeToken::nil)
    }

    /// The parameter, when one is carried and `T` matches its token.
    pub fn parameter<T: 'static>(&self) -> Option<&T> {
        let parameter = self.parameter.as_ref()?;
        if parameter.token != TypeToken::of::<T>() {
            return None;
        }
        parameter.value.downcast_ref::<T>()
    }

    /// Untyped pointer to the parameter, gated by a token match.
    pub fn parameter_data(&self, token: &TypeToken) -> Option<*const ()> {
        let parameter = self.parameter.as_ref()?;
        if parameter.token != *token {
            return None;
        }
        Some(&*parameter.value as *const (dyn Any + Send + Sync) as *const ())
    }

    /// Flatten to transportable bytes.
    ///
    /// Parameterless suites always flatten; a suite carrying a parameter
    /// flattens only when it was built with
    /// [`Suite::with_portable_parameter`].
    pub fn flatten(&self) -> Option<Vec<u8>> {
        let parameter = match &self.parameter {
            None => None,
            Some(parameter) => Some((parameter.encode?)(&*parameter.value)?),
        };
        let flat = FlatSuite {
            tag: self.tag,
            call: self.call,
            invoice: self.invoice,
            parameter,
        };
        bincode::serialize(&flat).ok()
    }
}

impl std::fmt::Debug for Suite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Suite")
            .field("invoice", &self.invoice)
            .field("has_parameter", &self.parameter.is_some())
            .finish()
    }
}

/// The wire form of a flattened suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatSuite {
    pub tag: Tag,
    pub call: Call,
    pub invoice: Invoice,
    /// Encoded parameter bytes; decoding is the receiving host's concern.
    pub parameter: Option<Vec<u8>>,
}

impl FlatSuite {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}
