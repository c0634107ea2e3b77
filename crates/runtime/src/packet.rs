//! Packets: suites queued for delivery.
//!
//! A packet is a suite plus its reach. `Zonal` packets stay inside the
//! zone that posted them; `External` packets may additionally be
//! flattened and carried to other zones by a host transport. The two are
//! one enum, so delivery code matches on reach instead of downcasting
//! through a class hierarchy.

use tarn_core::token::TypeToken;

use crate::message::Suite;

/// A queued message and how far it may travel.
#[derive(Debug)]
pub enum Packet {
    /// Confined to the zone it was posted in.
    Zonal(Suite),
    /// Eligible to cross zones through a host transport.
    External(Suite),
}

impl Packet {
    pub fn zonal(suite: Suite) -> Self {
        Packet::Zonal(suite)
    }

    pub fn external(suite: Suite) -> Self {
        Packet::External(suite)
    }

    /// The carried suite, whatever the reach.
    pub fn suite(&self) -> &Suite {
        match self {
            Packet::Zonal(suite) | Packet::External(suite) => suite,
        }
    }

    /// The suite only when this packet may leave the zone.
    pub fn external_suite(&self) -> Option<&Suite> {
        match self {
            Packet::Zonal(_) => None,
            Packet::External(suite) => Some(suite),
        }
    }

    /// Typed view of the suite's parameter; `None` on a token mismatch
    /// or when no parameter is carried.
    pub fn parameter<T: 'static>(&self) -> Option<&T> {
        self.suite().parameter::<T>()
    }

    /// Untyped view of the parameter, gated by a token match.
    pub fn parameter_data(&self, token: &TypeToken) -> Option<*const ()> {
        self.suite().parameter_data(token)
    }

    /// Flatten for cross-zone transport. Zonal packets never flatten.
    pub fn flatten(&self) -> Option<Vec<u8>> {
        self.external_suite()?.flatten()
    }
}
