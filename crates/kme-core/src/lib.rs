//! # KME Core
//!
//! Key types, key pool and key store for a QKD key management entity.
//!
//! This crate holds everything about keys that does not touch the network.
//! Replication to peer nodes goes through the [`KeySync`] trait so the same
//! store runs behind the HTTP broadcaster in production and behind
//! [`MockSync`] in tests.
//!
//! ## Key Types
//!
//! - [`Key`]: An immutable key record whose material is wiped on drop
//! - [`KeyPool`]: Capacity-bounded, insertion-ordered key container
//! - [`KeyStore`]: Lock-guarded pool with association tracking, reservation
//!   and one-time-use retirement
//! - [`ReceiverCheck`]: Outcome of comparing a receiver hint with the
//!   association recorded for a key

pub mod error;
pub mod identity;
pub mod key;
pub mod pool;
pub mod store;
pub mod sync;
pub mod verify;
pub mod mock_sync;

// Re-export main types
pub use error::*;
pub use identity::*;
pub use key::*;
pub use pool::*;
pub use store::*;
pub use sync::*;
pub use verify::*;
pub use mock_sync::*;
