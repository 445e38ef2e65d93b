//! RFC 2047 encoded-words and charset conversion.
//!
//! Header values such as `=?ISO-8859-2?Q?Za=BF=F3=B3=E6?=` are decoded here
//! rather than through the parser's own header decoding so that a failing
//! header can be reported (and the caller can fall back to the raw text)
//! instead of being silently replaced.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use encoding_rs::Encoding;
use thiserror::Error;

const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WordError {
    #[error("unknown charset {0}")]
    UnknownCharset(String),
    #[error("text is not valid {0}")]
    InvalidText(String),
    #[error("malformed encoded-word {0}")]
    Malformed(String),
}

/// Decodes every encoded-word in a (possibly folded) header value.
pub fn decode_header(value: &str) -> Result<String, WordError> {
    let unfolded = unfold(value);
    let mut out = String::with_capacity(unfolded.len());
    let mut rest = unfolded.as_str();
    let mut previous_word = false;

    while let Some(start) = rest.find("=?") {
        let (literal, tail) = rest.split_at(start);
        match split_word(tail) {
            Some((word, remainder)) => {
                // Whitespace between two adjacent encoded-words is not part of the text.
                if !(previous_word && literal.chars().all(char::is_whitespace)) {
                    out.push_str(literal);
                }
                out.push_str(&decode_word(word)?);
                previous_word = true;
                rest = remainder;
            }
            None => {
                out.push_str(literal);
                out.push_str("=?");
                rest = &tail[2..];
                previous_word = false;
            }
        }
    }
    out.push_str(rest);

    Ok(out)
}

/// Encodes a value as a single UTF-8 base64 encoded-word.
pub fn encode_word(value: &str) -> String {
    format!("=?UTF-8?B?{}?=", STANDARD.encode(value.as_bytes()))
}

/// Encodes a header value only if it cannot be sent as-is.
pub fn encode_if_needed(value: &str) -> String {
    if value.is_ascii() && !value.contains("=?") && !value.contains(|c: char| c == '\r' || c == '\n') {
        value.to_string()
    } else {
        encode_word(value)
    }
}

/// Converts text in the named charset to UTF-8.
pub fn transcode(charset: &str, bytes: &[u8]) -> Result<String, WordError> {
    let label = charset.trim().trim_matches('"').to_ascii_lowercase();
    // RFC 2231 allows a language suffix: charset*language
    let label = label.split('*').next().unwrap_or_default();

    match label {
        "" | "utf-8" | "utf8" | "us-ascii" | "ascii" => String::from_utf8(bytes.to_vec())
            .map_err(|_| WordError::InvalidText(label.to_string())),
        _ => {
            let encoding = Encoding::for_label_no_replacement(label.as_bytes())
                .ok_or_else(|| WordError::UnknownCharset(label.to_string()))?;
            encoding
                .decode_without_bom_handling_and_without_replacement(bytes)
                .map(|text| text.into_owned())
                .ok_or_else(|| WordError::InvalidText(label.to_string()))
        }
    }
}

fn unfold(value: &str) -> String {
    value.replace("\r\n", "").replace('\n', "")
}

// Splits `=?charset?e?text?=` off the front of `input`.
fn split_word(input: &str) -> Option<(&str, &str)> {
    let body = input.strip_prefix("=?")?;
    let charset_end = body.find('?')?;
    let after_charset = &body[charset_end + 1..];
    let mut chars = after_charset.chars();
    let encoding = chars.next()?;
    if !matches!(encoding, 'b' | 'B' | 'q' | 'Q') || chars.next()? != '?' {
        return None;
    }
    let text_start = charset_end + 3;
    let text_len = body[text_start..].find("?=")?;
    let end = 2 + text_start + text_len + 2;
    let word = &input[..end];

    if charset_end == 0 || word.chars().any(char::is_whitespace) {
        return None;
    }
    Some((word, &input[end..]))
}

fn decode_word(word: &str) -> Result<String, WordError> {
    let inner = &word[2..word.len() - 2];
    let mut pieces = inner.splitn(3, '?');
    let (charset, encoding, text) = match (pieces.next(), pieces.next(), pieces.next()) {
        (Some(charset), Some(encoding), Some(text)) => (charset, encoding, text),
        _ => return Err(WordError::Malformed(word.to_string())),
    };

    let bytes = match encoding {
        "b" | "B" => LENIENT_BASE64
            .decode(text)
            .map_err(|_| WordError::Malformed(word.to_string()))?,
        _ => q_decode(text).ok_or_else(|| WordError::Malformed(word.to_string()))?,
    };

    transcode(charset, &bytes)
}

fn q_decode(text: &str) -> Option<Vec<u8>> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut ix = 0;
    while ix < bytes.len() {
        match bytes[ix] {
            b'_' => out.push(b' '),
            b'=' => {
                let hex = bytes.get(ix + 1..ix + 3)?;
                if !hex.iter().all(u8::is_ascii_hexdigit) {
                    return None;
                }
                out.push(u8::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok()?);
                ix += 2;
            }
            byte => out.push(byte),
        }
        ix += 1;
    }
    Some(out)
}
