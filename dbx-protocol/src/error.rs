use thiserror::Error;

/// Errors raised while decoding or framing wire data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Truncated block at offset {offset}: need {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Request prefix too short: {0} bytes")]
    ShortPrefix(usize),

    #[error("Unknown command code: {0}")]
    UnknownCommand(u8),

    #[error("Invalid item header: {0}")]
    InvalidItemHeader(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
