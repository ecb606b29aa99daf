use crate::codec::SelectionPolicy;

/// Errors surfaced to the caller of the public encoder operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No compatible encoder found for {mime} with policy {policy:?}")]
    NoCompatibleCodec {
        mime: String,
        policy: SelectionPolicy,
    },
    #[error("Encoder already started")]
    AlreadyStarted,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Failed to spawn encoder thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Failed to create metrics: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by a [`Codec`](crate::Codec) implementation.
///
/// Inside the buffer pump these are logged and the next iteration retries;
/// they only reach the caller while a codec is being opened or started.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The operation is not valid in the codec's current state, typically
    /// because the codec was already stopped or released.
    #[error("Illegal codec state: {0}")]
    IllegalState(&'static str),
    #[error("Invalid buffer index {0}")]
    InvalidIndex(usize),
    #[error("Payload of {size} bytes does not fit a {capacity} byte buffer")]
    BufferOverflow { size: usize, capacity: usize },
    #[error("Codec rejected the configuration: {0}")]
    Configure(String),
    #[error("Hardware error {code}: {message}")]
    Hardware { code: i32, message: String },
}
