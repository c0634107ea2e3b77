//! tarn runtime: a toolkit for data-driven game and simulation systems.
//!
//! Four subsystems share one set of design principles: stable keys,
//! sorted intrusive indexes, generation-free compaction:
//!
//! - [`reservoir`]: a bit-packed store of typed state values with
//!   per-state transition tracking
//! - [`binarc`]: a read-only, zero-copy tagged-word archive with a
//!   hash-indexed map ([`binarc_build`] writes them)
//! - [`flyweight`]: interned strings in slab chunks with atomic
//!   reference counting
//! - [`dispatcher`] / [`listener`]: per-thread RPC dispatch with
//!   weak-handle subscriptions and inter-thread packet trading
//!
//! The [`table`], [`builder`], and [`operation`] modules glue parsed
//! content tables to the reservoir: builders seed initial state, and
//! operation records compare and mutate it at runtime.

pub mod binarc;
pub mod binarc_build;
pub mod builder;
pub mod dispatcher;
pub mod flyweight;
pub mod listener;
pub mod message;
pub mod operation;
pub mod packet;
pub mod reservoir;
pub mod table;

// Re-export the types nearly every consumer touches.
pub use binarc::{Archive, ArchiveBytes, ArchiveError, Cursor, Kind, MapKey};
pub use builder::StatusBuilder;
pub use dispatcher::{Dispatcher, Zone};
pub use flyweight::FlyweightFactory;
pub use listener::Listener;
pub use message::{Call, FlatSuite, Invoice, Suite, Tag};
pub use operation::{Assignment, Comparison};
pub use packet::Packet;
pub use reservoir::Reservoir;

// Core value types, re-exported so hosts need only this crate.
pub use tarn_core::value::{StateKind, StateValue, Variety};
