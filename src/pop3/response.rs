use crate::error::{Error, Result};

pub const OK: &str = "+OK";
pub const ERROR: &str = "-ERR";

/// A classified status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok(String),
    Err(String),
}

/// Classifies a status line by its `+OK` / `-ERR` prefix.
pub fn parse_response(line: &str) -> Result<Response> {
    let line = line.trim();
    let upper = line.to_ascii_uppercase();

    if let Some(text) = status_text(line, &upper, OK) {
        return Ok(Response::Ok(text));
    }
    if let Some(text) = status_text(line, &upper, ERROR) {
        return Ok(Response::Err(text));
    }

    Err(Error::Protocol(format!("cannot classify response {:?}", line)))
}

// The status word has to stand alone: "+OKAY" is not "+OK".
fn status_text(line: &str, upper: &str, status: &str) -> Option<String> {
    let rest = upper.strip_prefix(status)?;
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some(line[status.len()..].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success() {
        assert_eq!(parse_response("+OK 2 messages").unwrap(), Response::Ok("2 messages".to_string()));
        assert_eq!(parse_response("+OK\r\n").unwrap(), Response::Ok(String::new()));
        assert_eq!(parse_response("+ok ready").unwrap(), Response::Ok("ready".to_string()));
    }

    #[test]
    fn test_failure() {
        assert_eq!(
            parse_response("-ERR no such message").unwrap(),
            Response::Err("no such message".to_string())
        );
    }

    #[test]
    fn test_protocol_violation() {
        assert!(matches!(parse_response("* OK IMAP4rev1"), Err(Error::Protocol(_))));
        assert!(matches!(parse_response(""), Err(Error::Protocol(_))));
        assert!(matches!(parse_response("+OKAY then"), Err(Error::Protocol(_))));
        assert!(matches!(parse_response("-ERRx"), Err(Error::Protocol(_))));
        assert_eq!(parse_response("-ERR\tbusy").unwrap(), Response::Err("busy".to_string()));
    }
}
