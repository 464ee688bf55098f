use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid magic: expected 0x5652, got {0:#06x}")]
    InvalidMagic(u16),

    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("Unknown error code: {0}")]
    UnknownErrorCode(u8),

    #[error("Frame truncated while reading {0}")]
    Truncated(&'static str),

    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Field {field} is {len} bytes, longer than {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Field {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("Frame has {0} trailing bytes")]
    TrailingBytes(usize),
}
