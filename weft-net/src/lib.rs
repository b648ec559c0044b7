//! Weft Net
//!
//! The datagram fabric the control plane runs on: pub/sub topics and
//! request/reply endpoints addressed by URL, plus optional
//! authenticated encryption for inter-host channels.
//!
//! The in-process [`MessageBus`] is the reference transport; it keeps
//! the store and health-checker decoupled from any particular socket
//! library.

pub mod bus;
pub mod error;
pub mod seal;

pub use bus::{BusRequest, MessageBus};
pub use error::NetError;
pub use seal::{open, seal, Keypair};
