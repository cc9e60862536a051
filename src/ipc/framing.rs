//! Request headers and reply-header parsing.
//!
//! Every request starts with a `!`-prefixed header line; every reply starts
//! with either `!R <n>` (n result values follow) or `!E <message>`.
//!
//! # Wire Format
//!
//! ```text
//! !N <id> <spec>\n                  new object
//! !L <id> <path>\n                  load object from file
//! !D <id>\n                         delete object
//! !Z \n                             delete all objects
//! !F <name> <argc> <args...>\n      call function
//! !M <id> <name> <argc> <args...>\n call method
//! !Q                                quit
//! !P \n                             ping
//!
//! !R <n> <result1> ...              success
//! !E "message"                      failure
//! ```
//!
//! Blanks and `#` comments in front of a reply header are skipped.

use crate::codec::Decoded;
use crate::error::{ClientError, Result};
use crate::scan::{Scan, Scanner};

/// A request, minus its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    New { id: u32, spec: &'a str },
    Load { id: u32, path: &'a str },
    Delete { id: u32 },
    DeleteAll,
    Function { name: &'a str, argc: usize },
    Method { id: u32, name: &'a str, argc: usize },
    Quit,
    Ping,
}

impl Request<'_> {
    /// Header text. For function and method calls the line is left open:
    /// the encoded arguments and the final newline follow it.
    pub fn header(&self) -> String {
        match self {
            Request::New { id, spec } => format!("!N {} {}\n", id, spec),
            Request::Load { id, path } => format!("!L {} {}\n", id, quote_path(path)),
            Request::Delete { id } => format!("!D {}\n", id),
            Request::DeleteAll => "!Z \n".to_string(),
            Request::Function { name, argc } => format!("!F {} {} ", name, argc),
            Request::Method { id, name, argc } => format!("!M {} {} {} ", id, name, argc),
            Request::Quit => "!Q".to_string(),
            Request::Ping => "!P \n".to_string(),
        }
    }

    /// Whether encoded arguments follow the header.
    pub fn carries_args(&self) -> bool {
        matches!(self, Request::Function { .. } | Request::Method { .. })
    }

    /// Whether the request may share substructures with earlier traffic, in
    /// which case the serializer's copies map is cleared first.
    pub fn clears_maps(&self) -> bool {
        matches!(
            self,
            Request::New { .. }
                | Request::Load { .. }
                | Request::Function { .. }
                | Request::Method { .. }
        )
    }
}

/// Quotes a path that would otherwise be split by the server's tokenizer.
fn quote_path(path: &str) -> String {
    if path.is_empty() || path.chars().any(|c| c.is_whitespace() || c == '"') {
        let escaped = path.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{}\"", escaped)
    } else {
        path.to_string()
    }
}

/// Rejects function/method names that would corrupt the header line.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c == '!') {
        return Err(ClientError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// A parsed reply header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyHeader {
    /// `!R <n>`: n encoded values follow.
    Results(usize),
    /// `!E <message>`.
    Error(String),
}

/// A reply that violates the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramingError {
    pub message: String,
    /// Bytes to discard so the offending input is not read again.
    pub consumed: usize,
}

/// Parses a reply header from the front of `input`.
///
/// Nothing is consumed unless a complete header (or a definite violation) is
/// found, which makes the surrounding read loop safe to cancel between
/// reads.
pub fn parse_reply_header(
    input: &[u8],
    eof: bool,
) -> std::result::Result<Decoded<ReplyHeader>, FramingError> {
    let mut scanner = Scanner::new(input, eof);
    let result = parse_header(&mut scanner);
    match result {
        Ok(header) => Ok(Decoded::Complete(header, scanner.pos())),
        Err(Scan::Incomplete) => Ok(Decoded::Incomplete),
        Err(Scan::Invalid(message)) => Err(FramingError {
            message,
            consumed: scanner.pos().max(1).min(input.len()),
        }),
    }
}

fn parse_header(scanner: &mut Scanner<'_>) -> std::result::Result<ReplyHeader, Scan> {
    scanner.skip_blanks_and_comments()?;
    let marker = scanner.bump()?;
    if marker != b'!' {
        return Err(Scan::Invalid(format!(
            "Replies from the server are expected to start with '!' but read {:?}",
            marker as char
        )));
    }
    match scanner.bump()? {
        b'R' => {
            scanner.skip_blanks_and_comments()?;
            let count = scanner.integer::<usize>()?;
            Ok(ReplyHeader::Results(count))
        }
        b'E' => {
            scanner.skip_spaces();
            let message = if scanner.peek()? == b'"' {
                scanner.quoted_string()?
            } else {
                scanner.rest_of_line()?
            };
            Ok(ReplyHeader::Error(message))
        }
        other => Err(Scan::Invalid(format!(
            "Expected !R or !E but read !{}",
            other as char
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_headers() {
        assert_eq!(
            Request::New { id: 1, spec: "Learner()" }.header(),
            "!N 1 Learner()\n"
        );
        assert_eq!(Request::Delete { id: 3 }.header(), "!D 3\n");
        assert_eq!(Request::DeleteAll.header(), "!Z \n");
        assert_eq!(Request::Ping.header(), "!P \n");
        assert_eq!(Request::Quit.header(), "!Q");
        assert_eq!(
            Request::Function { name: "binary", argc: 0 }.header(),
            "!F binary 0 "
        );
        assert_eq!(
            Request::Method { id: 5, name: "foo", argc: 1 }.header(),
            "!M 5 foo 1 "
        );
    }

    #[test]
    fn test_load_quotes_paths_with_blanks() {
        assert_eq!(
            Request::Load { id: 2, path: "/data/model.psave" }.header(),
            "!L 2 /data/model.psave\n"
        );
        assert_eq!(
            Request::Load { id: 2, path: "/my data/m.psave" }.header(),
            "!L 2 \"/my data/m.psave\"\n"
        );
    }

    #[test]
    fn test_clear_maps_pre_hook_applies_to_sharing_commands() {
        assert!(Request::New { id: 1, spec: "" }.clears_maps());
        assert!(Request::Load { id: 1, path: "" }.clears_maps());
        assert!(Request::Function { name: "f", argc: 0 }.clears_maps());
        assert!(Request::Method { id: 1, name: "f", argc: 0 }.clears_maps());
        assert!(!Request::Delete { id: 1 }.clears_maps());
        assert!(!Request::DeleteAll.clears_maps());
        assert!(!Request::Ping.clears_maps());
        assert!(!Request::Quit.clears_maps());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("getOption").is_ok());
        assert!(matches!(
            validate_name("two words"),
            Err(ClientError::InvalidName(_))
        ));
        assert!(validate_name("").is_err());
        assert!(validate_name("bang!").is_err());
    }

    #[test]
    fn test_parse_result_header() {
        assert_eq!(
            parse_reply_header(b"\n!R 2 7 8", false),
            Ok(Decoded::Complete(ReplyHeader::Results(2), 5))
        );
        assert_eq!(parse_reply_header(b"!R 1", false), Ok(Decoded::Incomplete));
        assert_eq!(parse_reply_header(b"", false), Ok(Decoded::Incomplete));
    }

    #[test]
    fn test_parse_error_header() {
        assert_eq!(
            parse_reply_header(b"!E \"Invalid function name foo\"\n", false),
            Ok(Decoded::Complete(
                ReplyHeader::Error("Invalid function name foo".to_string()),
                30
            ))
        );
        assert_eq!(
            parse_reply_header(b"!E Unknown exception\n", false),
            Ok(Decoded::Complete(
                ReplyHeader::Error("Unknown exception".to_string()),
                21
            ))
        );
    }

    #[test]
    fn test_parse_rejects_unknown_command_byte() {
        let err = parse_reply_header(b"!X 1\n", false).unwrap_err();
        assert_eq!(err.message, "Expected !R or !E but read !X");
        assert_eq!(err.consumed, 2);
    }

    #[test]
    fn test_parse_rejects_missing_marker() {
        let err = parse_reply_header(b"R 0\n", false).unwrap_err();
        assert!(err.message.contains("expected to start with '!'"));
        assert_eq!(err.consumed, 1);
    }
}
