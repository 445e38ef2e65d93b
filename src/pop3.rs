//! A POP3 client: one mailbox session over a (possibly TLS) stream.

pub mod client;
pub mod response;
pub mod stream;

pub use client::{Client, MailboxClient, Retrieval, SessionState};
pub use response::{parse_response, Response};
pub use stream::MailStream;
