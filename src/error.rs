use cipher::InvalidLength;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Unable to parse binary data: {0}")]
    BinaryParser(#[from] binrw::Error),
    #[error("Unable to parse string: {0}")]
    StringParser(#[from] core::str::Utf8Error),
    #[error("Invalid NCA: {0}")]
    InvalidNca(String),
    #[error("Corrupt NCA: {0}")]
    CorruptNca(String),
    #[error("Missing key: {0}")]
    MissingKey(String),
    #[error("Unsupported NCA: {0}")]
    UnsupportedNca(String),
    #[error("Invalid CNMT: {0}")]
    InvalidCnmt(String),
    #[error("Invalid ticket: {0}")]
    InvalidTicket(String),
    #[error("Invalid NACP: {0}")]
    InvalidNacp(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Sink unavailable: {0}")]
    SinkUnavailable(String),
    #[error("Sink IO error: {0}")]
    SinkIoError(String),
    #[error("File too large for filesystem: {0} bytes")]
    FileTooLargeForFilesystem(u64),
    #[error("Transfer cancelled")]
    Cancelled,
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Encryption error: {0}")]
    CryptoError(String),
    #[error("Title key error: {0}")]
    TitleKeyError(#[from] crate::keys::title_keys::KeyError),
}

impl From<InvalidLength> for Error {
    fn from(_: InvalidLength) -> Self {
        Error::CryptoError("Invalid key length".to_string())
    }
}
