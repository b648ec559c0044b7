//! Error types for the weft-health crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HealthError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] weft_net::NetError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("health checker is shut down")]
    Shutdown,
}
