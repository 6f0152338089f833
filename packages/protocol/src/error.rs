use thiserror::Error;

/// Faults in the framed transport itself. All of these are fatal to the
/// connection — a malformed-but-well-framed message is a [`MessageError`]
/// instead, which the caller may choose to log and ignore.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {size} bytes exceeds max-frame-bytes of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("zlib decompression failed: {0}")]
    Decompress(String),

    #[error("zlib compression failed: {0}")]
    Compress(String),

    #[error("connection closed")]
    Closed,
}

/// A well-framed, successfully decompressed message that nonetheless failed
/// to decode as JSON, or whose `name` discriminator wasn't recognized. Never
/// closes the connection by itself (§4.3).
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown message name: {0}")]
    UnknownName(String),
}
