//! Weft Health
//!
//! A stateful ping scheduler layered on the store's view of the
//! topology. Adjacency and prefix announcements select the ping
//! targets; reachability is verified with a two-message PING/ACK
//! protocol over UDPv6, and loss shows up as a growing gap between
//! sequence numbers sent and acknowledged.

pub mod checker;
pub mod error;
pub mod handle;

pub use checker::{
    HealthCheckOption, HealthChecker, HealthCheckerConfig, DEFAULT_PING_INTERVAL,
    DEFAULT_UDP_PING_PORT,
};
pub use error::HealthError;
pub use handle::HealthCheckerHandle;
