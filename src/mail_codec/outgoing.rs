use std::io::Write;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};
use crate::mail_codec::encoded_word::{encode_if_needed, encode_word};
use crate::mail_codec::{Attachment, ContentPart};

const BASE64_LINE_LENGTH: usize = 76;
const BOUNDARY_ENTROPY: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub name: String,
    pub address: String,
}

/// A message being assembled for delivery.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    sender: Option<Sender>,
    recipients: Vec<String>,
    subject: String,
    contents: Vec<ContentPart>,
    attachments: Vec<Attachment>,
}

impl OutgoingMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sender(&mut self, name: &str, address: &str) -> Result<()> {
        let address = validate_address(address)?;
        self.sender = Some(Sender { name: name.trim().to_string(), address });
        Ok(())
    }

    pub fn add_recipient(&mut self, address: &str) -> Result<()> {
        let address = validate_address(address)?;
        self.recipients.push(address);
        Ok(())
    }

    pub fn set_subject(&mut self, subject: &str) {
        self.subject = subject.to_string();
    }

    pub fn add_content(&mut self, content: ContentPart) {
        self.contents.push(content);
    }

    pub fn attach(&mut self, attachment: Attachment) {
        self.attachments.push(attachment);
    }

    pub fn sender(&self) -> Option<&Sender> {
        self.sender.as_ref()
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn contents(&self) -> &[ContentPart] {
        &self.contents
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    /// Renders the message as a CRLF-delimited MIME document.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| Error::Encoding("message has no sender".to_string()))?;
        if self.recipients.is_empty() {
            return Err(Error::Encoding("message has no recipients".to_string()));
        }

        let mut out = Vec::new();
        write!(out, "From: {}\r\n", format_mailbox(&sender.name, &sender.address)).map_err(write_failed)?;
        write!(out, "To: {}\r\n", self.recipients.join(", ")).map_err(write_failed)?;
        write!(out, "Subject: {}\r\n", encode_if_needed(&self.subject)).map_err(write_failed)?;
        write!(out, "MIME-Version: 1.0\r\n").map_err(write_failed)?;

        if self.attachments.is_empty() {
            self.write_alternative(&mut out)?;
        } else {
            self.write_mixed(&mut out)?;
        }

        Ok(out)
    }

    fn write_mixed(&self, out: &mut Vec<u8>) -> Result<()> {
        let boundary = boundary()?;
        write!(out, "Content-Type: multipart/mixed; boundary=\"{}\"\r\n\r\n", boundary)
            .map_err(write_failed)?;

        write!(out, "--{}\r\n", boundary).map_err(write_failed)?;
        self.write_alternative(out)?;

        for attachment in &self.attachments {
            write!(out, "\r\n--{}\r\n", boundary).map_err(write_failed)?;
            write_attachment(out, attachment)?;
        }

        write!(out, "\r\n--{}--\r\n", boundary).map_err(write_failed)
    }

    fn write_alternative(&self, out: &mut Vec<u8>) -> Result<()> {
        let boundary = boundary()?;
        write!(out, "Content-Type: multipart/alternative; boundary=\"{}\"\r\n\r\n", boundary)
            .map_err(write_failed)?;

        for content in &self.contents {
            write!(out, "--{}\r\n", boundary).map_err(write_failed)?;
            write_content(out, content)?;
            out.extend_from_slice(b"\r\n");
        }

        write!(out, "--{}--\r\n", boundary).map_err(write_failed)
    }
}

pub fn encode_message(message: &OutgoingMessage) -> Result<Vec<u8>> {
    message.encode()
}

fn write_content(out: &mut Vec<u8>, content: &ContentPart) -> Result<()> {
    if content.html {
        write!(
            out,
            "Content-Type: text/html; charset=UTF-8\r\nContent-Transfer-Encoding: quoted-printable\r\n\r\n"
        )
        .map_err(write_failed)?;
        out.extend_from_slice(&quoted_printable::encode(&content.data));
        // Trailing soft line break: the CRLF before the next delimiter is not payload.
        out.push(b'=');
    } else {
        write!(
            out,
            "Content-Type: text/plain; charset=UTF-8\r\nContent-Transfer-Encoding: base64\r\n\r\n"
        )
        .map_err(write_failed)?;
        write_base64(out, &content.data)?;
    }
    Ok(())
}

fn write_attachment(out: &mut Vec<u8>, attachment: &Attachment) -> Result<()> {
    let mime_type = mime_guess::from_path(&attachment.name).first_or_octet_stream();
    write!(
        out,
        "Content-Type: {}\r\nContent-Transfer-Encoding: base64\r\nContent-Disposition: attachment; filename=\"{}\"\r\n\r\n",
        mime_type.essence_str(),
        encode_word(&attachment.name)
    )
    .map_err(write_failed)?;
    write_base64(out, &attachment.data)
}

fn write_base64(out: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    let encoded = BASE64.encode(data);
    let lines: Vec<&[u8]> = encoded.as_bytes().chunks(BASE64_LINE_LENGTH).collect();
    out.write_all(&lines.join(&b"\r\n"[..])).map_err(write_failed)
}

fn boundary() -> Result<String> {
    let mut buf = [0u8; BOUNDARY_ENTROPY];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| Error::Encoding(format!("cannot generate boundary: {}", e)))?;
    Ok(hex::encode(buf))
}

fn validate_address(address: &str) -> Result<String> {
    let address = address.trim();
    address
        .parse::<lettre::Address>()
        .map(|_| address.to_string())
        .map_err(|_| Error::InvalidAddress(address.to_string()))
}

fn format_mailbox(name: &str, address: &str) -> String {
    if name.is_empty() {
        format!("<{}>", address)
    } else if !name.is_ascii() {
        format!("{} <{}>", encode_word(name), address)
    } else if name.chars().all(|c| c.is_ascii_alphanumeric() || " !#$%&'*+-/=?^_`{|}~".contains(c)) {
        format!("{} <{}>", name, address)
    } else {
        let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{}\" <{}>", escaped, address)
    }
}

fn write_failed(err: std::io::Error) -> Error {
    Error::Encoding(format!("cannot write message part: {}", err))
}
