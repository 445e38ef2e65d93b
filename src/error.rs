use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to encode message: {0}")]
    Encoding(String),
    #[error("Failed to parse message: {0}")]
    Parse(#[from] mailparse::MailParseError),
    #[error("Failed to parse message body: {0}")]
    BodyParse(String),
    #[error("Failed to decode part {index}: {reason}")]
    DecodePart { index: usize, reason: String },
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Server rejected command: {0}")]
    Rejected(String),
    #[error(transparent)]
    Transport(#[from] io::Error),
    #[error("No account configured for key {0}")]
    AccountNotFound(String),
    #[error("Authentication failed: {0}")]
    Authentication(String),
    #[error("SMTP delivery failed: {message}")]
    Smtp { message: String, permanent: bool },
    #[error("Invalid mail address: {0}")]
    InvalidAddress(String),
    #[error("Message {0} is no longer in the mailbox")]
    MessageGone(String),
    #[error("Attachment store error: {0}")]
    Store(String),
}

impl Error {
    /// Whether retrying the same operation later can possibly succeed.
    pub fn is_permanent(&self) -> bool {
        match self {
            Error::Encoding(_)
            | Error::AccountNotFound(_)
            | Error::InvalidAddress(_)
            | Error::Store(_) => true,
            Error::Smtp { permanent, .. } => *permanent,
            _ => false,
        }
    }
}

impl From<native_tls::Error> for Error {
    fn from(err: native_tls::Error) -> Self {
        Error::Transport(io::Error::new(io::ErrorKind::Other, err))
    }
}
