//! Error types for the weft-store crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] weft_net::NetError),

    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("peer replied with error: {0}")]
    Remote(String),

    #[error("store is shut down")]
    Shutdown,
}
