pub mod handshake;
pub mod message;

pub use handshake::{FilterHandshake, HandshakeCodec};
pub use message::{DataCodec, DataMessage, NoticeCodec, NoticeMessage, RequestCodec, RequestMessage};

#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid discriminant byte: {0}")]
    InvalidDiscriminant(u8),

    #[error("path bytes are not valid utf-8")]
    InvalidPath(#[from] std::string::FromUtf8Error),
}

pub type Result<T> = std::result::Result<T, WireError>;
