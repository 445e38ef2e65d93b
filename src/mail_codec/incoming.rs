use chrono::{DateTime, TimeZone, Utc};
use log::{debug, warn};
use mailparse::{parse_mail, MailAddr, MailHeaderMap, ParsedMail};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::{Error, Result};
use crate::mail_codec::encoded_word::{decode_header, transcode};
use crate::mail_codec::{Attachment, ContentPart};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Address {
    pub name: String,
    pub address: String,
}

/// A message pulled from a mailbox. Headers are decoded eagerly, the body
/// only when `parse_body` is called.
#[derive(Debug)]
pub struct IncomingMessage {
    sender: Address,
    recipients: Vec<Address>,
    subject: String,
    message_id: String,
    date: DateTime<Utc>,
    contents: Vec<ContentPart>,
    attachments: Vec<Attachment>,
    part_errors: Vec<Error>,
    body_parsed: bool,
    raw: Vec<u8>,
}

/// Reads one dot-terminated message from `reader` and decodes its headers.
pub async fn decode_message<R>(reader: &mut R) -> Result<IncomingMessage>
where
    R: AsyncBufRead + Unpin,
{
    let raw = read_dot_block(reader).await?;
    IncomingMessage::from_bytes(raw)
}

impl IncomingMessage {
    pub fn from_bytes(raw: Vec<u8>) -> Result<Self> {
        let parsed = parse_mail(&raw)?;

        let sender = parsed
            .headers
            .get_first_header("From")
            .map(|header| parse_sender(&String::from_utf8_lossy(header.get_value_raw())))
            .unwrap_or_default();
        let recipients = parsed
            .headers
            .get_all_headers("To")
            .into_iter()
            .flat_map(|header| parse_recipients(&String::from_utf8_lossy(header.get_value_raw())))
            .collect();
        let subject = parsed
            .headers
            .get_first_header("Subject")
            .map(|header| decode_or_raw(&String::from_utf8_lossy(header.get_value_raw())))
            .unwrap_or_default();
        let message_id = parsed
            .headers
            .get_first_value("Message-ID")
            .map(|id| id.trim().trim_start_matches('<').trim_end_matches('>').to_string())
            .unwrap_or_default();
        let date = parsed
            .headers
            .get_first_value("Date")
            .and_then(|date| mailparse::dateparse(&date).ok())
            .and_then(|timestamp| Utc.timestamp_opt(timestamp, 0).single())
            .unwrap_or_else(Utc::now);

        Ok(IncomingMessage {
            sender,
            recipients,
            subject,
            message_id,
            date,
            contents: Vec::new(),
            attachments: Vec::new(),
            part_errors: Vec::new(),
            body_parsed: false,
            raw,
        })
    }

    pub fn sender(&self) -> &Address {
        &self.sender
    }

    pub fn recipients(&self) -> &[Address] {
        &self.recipients
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.date
    }

    pub fn contents(&self) -> &[ContentPart] {
        &self.contents
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    /// Failures of individual parts skipped during `parse_body`.
    pub fn part_errors(&self) -> &[Error] {
        &self.part_errors
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Extracts contents and attachments. Only the first call does any work.
    ///
    /// A body that is not multipart yields no contents. A part that cannot
    /// be decoded is recorded in `part_errors` and its siblings are still
    /// extracted.
    pub fn parse_body(&mut self) -> Result<()> {
        if self.body_parsed {
            return Ok(());
        }

        let mut body = BodyParts::default();
        {
            let parsed = parse_mail(&self.raw)?;
            check_content_type(&parsed)?;

            if parsed.ctype.mimetype.starts_with("multipart/") {
                body.collect(&parsed);
            } else {
                debug!(
                    "Message {} has a {} body, no contents extracted",
                    self.message_id, parsed.ctype.mimetype
                );
            }
        }

        for err in &body.errors {
            warn!("Skipping part of message {}: {}", self.message_id, err);
        }
        self.contents = body.contents;
        self.attachments = body.attachments;
        self.part_errors = body.errors;
        self.body_parsed = true;

        Ok(())
    }
}

#[derive(Default)]
struct BodyParts {
    contents: Vec<ContentPart>,
    attachments: Vec<Attachment>,
    errors: Vec<Error>,
    visited: usize,
}

impl BodyParts {
    fn collect(&mut self, multipart: &ParsedMail) {
        for part in &multipart.subparts {
            self.visited += 1;
            let index = self.visited;
            if let Err(err) = self.decode_part(part, index) {
                self.errors.push(err);
            }
        }
    }

    fn decode_part(&mut self, part: &ParsedMail, index: usize) -> Result<()> {
        if let Some(name) = file_name(part) {
            let data = transfer_decode(part, index)?;
            self.attachments.push(Attachment { name, data });
            return Ok(());
        }

        check_content_type(part)?;
        let mimetype = part.ctype.mimetype.as_str();
        if mimetype.starts_with("multipart/") {
            self.collect(part);
            return Ok(());
        }

        let html = mimetype == "text/html";
        let data = transfer_decode(part, index)?;
        let data = if html || is_utf8(&part.ctype.charset) {
            data
        } else {
            transcode(&part.ctype.charset, &data)
                .map_err(|err| Error::DecodePart { index, reason: err.to_string() })?
                .into_bytes()
        };
        self.contents.push(ContentPart { html, data });

        Ok(())
    }
}

fn transfer_decode(part: &ParsedMail, index: usize) -> Result<Vec<u8>> {
    part.get_body_raw()
        .map_err(|err| Error::DecodePart { index, reason: err.to_string() })
}

fn file_name(part: &ParsedMail) -> Option<String> {
    let disposition = part.get_content_disposition();
    disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .map(|name| decode_or_raw(name))
        .filter(|name| !name.is_empty())
}

fn check_content_type(part: &ParsedMail) -> Result<()> {
    let declared = match part.headers.get_first_value("Content-Type") {
        Some(declared) => declared,
        None => return Ok(()),
    };
    let mimetype = &part.ctype.mimetype;
    let valid_type = mimetype
        .split_once('/')
        .map_or(false, |(kind, sub)| !kind.is_empty() && !sub.is_empty());
    if !valid_type {
        return Err(Error::BodyParse(format!("invalid Content-Type {:?}", declared)));
    }
    if mimetype.starts_with("multipart/") && !part.ctype.params.contains_key("boundary") {
        return Err(Error::BodyParse(format!("{} without boundary", mimetype)));
    }
    Ok(())
}

fn is_utf8(charset: &str) -> bool {
    matches!(
        charset.trim().to_ascii_lowercase().as_str(),
        "utf-8" | "utf8" | "us-ascii" | "ascii" | ""
    )
}

fn decode_or_raw(value: &str) -> String {
    match decode_header(value) {
        Ok(decoded) => decoded.trim().to_string(),
        Err(err) => {
            warn!("Cannot decode header value {:?}: {}", value, err);
            value.trim().to_string()
        }
    }
}

fn parse_sender(raw: &str) -> Address {
    let unfolded = raw.replace("\r\n", "").replace('\n', "");
    let single = mailparse::addrparse(&unfolded)
        .ok()
        .and_then(|list| {
            list.iter().find_map(|addr| match addr {
                MailAddr::Single(info) => Some(info.clone()),
                MailAddr::Group(group) => group.addrs.first().cloned(),
            })
        })
        .filter(|info| info.addr.contains('@'));

    match single {
        Some(info) => Address {
            name: info.display_name.map(|name| decode_or_raw(&name)).unwrap_or_default(),
            address: info.addr,
        },
        None => {
            let fallback = decode_or_raw(&unfolded);
            Address { name: fallback.clone(), address: fallback }
        }
    }
}

fn parse_recipients(raw: &str) -> Vec<Address> {
    let unfolded = raw.replace("\r\n", "").replace('\n', "");
    let Ok(list) = mailparse::addrparse(&unfolded) else {
        warn!("Cannot parse recipient list {:?}", unfolded);
        return Vec::new();
    };
    list.iter()
        .flat_map(|addr| match addr {
            MailAddr::Single(info) => vec![info.clone()],
            MailAddr::Group(group) => group.addrs.clone(),
        })
        .map(|info| Address {
            name: info.display_name.map(|name| decode_or_raw(&name)).unwrap_or_default(),
            address: info.addr,
        })
        .collect()
}

// Collects lines up to a lone `.`, undoing dot-stuffing.
async fn read_dot_block<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut out = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Err(Error::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before end of message",
            )));
        }
        let content = line
            .strip_suffix(b"\n")
            .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
            .unwrap_or(&line[..]);
        if content == b"." {
            break;
        }
        let content = content.strip_prefix(b".").unwrap_or(content);
        out.extend_from_slice(content);
        out.extend_from_slice(b"\r\n");
    }
    Ok(out)
}
