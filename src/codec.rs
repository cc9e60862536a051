//! Value encoding on the wire.
//!
//! The protocol engine never looks inside call arguments or results: it hands
//! them to a [`ValueCodec`]. Codecs are sans-IO. `decode` is offered the
//! bytes buffered so far and either returns a complete value with the number
//! of bytes it used, or asks for more input.
//!
//! [`TextCodec`] is the built-in ASCII encoding:
//!
//! ```text
//! *0;                 none
//! true  false         bool
//! 42  -7              int
//! 2.5  1e-3  nan      float
//! "a \"quoted\" str"  string
//! [ 1, "two", 3.0 ]   list
//! *3 -> [ 1, 2 ]      define shared entry 3 (and yield the value)
//! *3;                 refer back to entry 3
//! # comment           ignored up to end of line
//! ```

use std::collections::HashMap;

use thiserror::Error;

use crate::scan::{Scan, ScanResult, Scanner};
use crate::value::Value;

/// Outcome of an incremental decode.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    /// A complete item and the number of input bytes it spans.
    Complete(T, usize),
    /// The buffered input ends before the item does.
    Incomplete,
}

/// Encoding or decoding failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("Malformed value: {0}")]
    Malformed(String),
}

/// Encodes and decodes typed values for the wire.
pub trait ValueCodec: Send {
    /// Appends the encoding of `value` to `out`.
    fn encode(&mut self, value: &Value, out: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Decodes one value from the front of `input`. `eof` is true once the
    /// peer has closed the stream and no more bytes will follow.
    fn decode(&mut self, input: &[u8], eof: bool) -> Result<Decoded<Value>, CodecError>;

    /// Forgets shared substructures remembered from earlier values.
    fn clear_maps(&mut self);

    /// Called after the server has been switched to (or from) binary mode.
    fn set_binary(&mut self, _enabled: bool) {}
}

/// ASCII value codec with support for shared references.
#[derive(Debug, Default)]
pub struct TextCodec {
    copies: HashMap<u32, Value>,
    binary: bool,
}

impl TextCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the server side has been asked to use binary mode.
    pub fn binary(&self) -> bool {
        self.binary
    }

    /// Number of shared entries currently remembered.
    pub fn copies_len(&self) -> usize {
        self.copies.len()
    }
}

impl ValueCodec for TextCodec {
    fn encode(&mut self, value: &Value, out: &mut Vec<u8>) -> Result<(), CodecError> {
        encode_text(value, out)
    }

    fn decode(&mut self, input: &[u8], eof: bool) -> Result<Decoded<Value>, CodecError> {
        let mut parser = TextParser {
            scanner: Scanner::new(input, eof),
            copies: &self.copies,
            staged: Vec::new(),
        };
        match parser.value() {
            Ok(value) => {
                let consumed = parser.scanner.pos();
                // Definitions only take effect once the whole value is read.
                let staged = parser.staged;
                self.copies.extend(staged);
                Ok(Decoded::Complete(value, consumed))
            }
            Err(Scan::Incomplete) => Ok(Decoded::Incomplete),
            Err(Scan::Invalid(msg)) => Err(CodecError::Malformed(msg)),
        }
    }

    fn clear_maps(&mut self) {
        self.copies.clear();
    }

    fn set_binary(&mut self, enabled: bool) {
        self.binary = enabled;
    }
}

fn encode_text(value: &Value, out: &mut Vec<u8>) -> Result<(), CodecError> {
    match value {
        Value::None => out.extend_from_slice(b"*0;"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Int(i) => out.extend_from_slice(i.to_string().as_bytes()),
        Value::Float(x) => {
            let text = if x.is_nan() {
                "nan".to_string()
            } else if x.is_infinite() {
                let sign = if *x > 0.0 { "" } else { "-" };
                format!("{}inf", sign)
            } else {
                // Debug keeps a '.' or exponent, so the value reads back as a float.
                format!("{:?}", x)
            };
            out.extend_from_slice(text.as_bytes());
        }
        Value::Str(s) => {
            out.push(b'"');
            for ch in s.chars() {
                match ch {
                    '"' => out.extend_from_slice(b"\\\""),
                    '\\' => out.extend_from_slice(b"\\\\"),
                    '\n' => out.extend_from_slice(b"\\n"),
                    '\t' => out.extend_from_slice(b"\\t"),
                    '\r' => out.extend_from_slice(b"\\r"),
                    _ => {
                        let mut buf = [0u8; 4];
                        out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                    }
                }
            }
            out.push(b'"');
        }
        Value::List(items) => {
            out.extend_from_slice(b"[ ");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.extend_from_slice(b", ");
                }
                encode_text(item, out)?;
            }
            out.extend_from_slice(b" ]");
        }
    }
    Ok(())
}

struct TextParser<'a, 'm> {
    scanner: Scanner<'a>,
    copies: &'m HashMap<u32, Value>,
    staged: Vec<(u32, Value)>,
}

impl TextParser<'_, '_> {
    fn value(&mut self) -> ScanResult<Value> {
        self.scanner.skip_blanks_and_comments()?;
        match self.scanner.peek()? {
            b'"' => self.scanner.quoted_string().map(Value::Str),
            b'[' => self.list(),
            b'*' => self.reference(),
            _ => self.atom(),
        }
    }

    fn list(&mut self) -> ScanResult<Value> {
        self.scanner.bump()?;
        let mut items = Vec::new();
        loop {
            self.scanner.skip_blanks_and_comments()?;
            match self.scanner.peek()? {
                b']' => {
                    self.scanner.bump()?;
                    return Ok(Value::List(items));
                }
                b',' => {
                    self.scanner.bump()?;
                }
                _ => items.push(self.value()?),
            }
        }
    }

    fn reference(&mut self) -> ScanResult<Value> {
        self.scanner.bump()?;
        let index: u32 = self.scanner.integer()?;
        self.scanner.skip_spaces();
        match self.scanner.peek()? {
            b';' => {
                self.scanner.bump()?;
                self.lookup(index)
            }
            b'-' if self.scanner.peek_at(1)? == b'>' => {
                self.scanner.bump()?;
                self.scanner.bump()?;
                let value = self.value()?;
                if index != 0 {
                    self.staged.push((index, value.clone()));
                }
                Ok(value)
            }
            _ => self.lookup(index),
        }
    }

    fn lookup(&self, index: u32) -> ScanResult<Value> {
        if index == 0 {
            return Ok(Value::None);
        }
        self.staged
            .iter()
            .rev()
            .find(|(k, _)| *k == index)
            .map(|(_, v)| v)
            .or_else(|| self.copies.get(&index))
            .cloned()
            .ok_or_else(|| Scan::Invalid(format!("reference to undefined *{}", index)))
    }

    fn atom(&mut self) -> ScanResult<Value> {
        let token = self.scanner.token()?;
        let value = match token {
            "true" | "True" => Value::Bool(true),
            "false" | "False" => Value::Bool(false),
            "None" => Value::None,
            "nan" | "NaN" => Value::Float(f64::NAN),
            "inf" | "+inf" => Value::Float(f64::INFINITY),
            "-inf" => Value::Float(f64::NEG_INFINITY),
            _ => {
                if let Ok(i) = token.parse::<i64>() {
                    Value::Int(i)
                } else if let Ok(x) = token.parse::<f64>() {
                    Value::Float(x)
                } else {
                    return Err(Scan::Invalid(format!("unrecognized token {:?}", token)));
                }
            }
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn encode(value: &Value) -> String {
        let mut out = Vec::new();
        TextCodec::new().encode(value, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn decode_all(input: &str) -> Value {
        match TextCodec::new().decode(input.as_bytes(), true).unwrap() {
            Decoded::Complete(value, _) => value,
            Decoded::Incomplete => panic!("closed input reported incomplete"),
        }
    }

    #[test]
    fn test_encode_scalars() {
        assert_eq!(encode(&Value::Int(3)), "3");
        assert_eq!(encode(&Value::Float(1.0)), "1.0");
        assert_eq!(encode(&Value::Bool(true)), "true");
        assert_eq!(encode(&Value::None), "*0;");
        assert_eq!(encode(&Value::Float(f64::NEG_INFINITY)), "-inf");
        assert_eq!(encode(&Value::from("say \"hi\"\n")), r#""say \"hi\"\n""#);
    }

    #[test]
    fn test_encode_list() {
        let value = Value::List(vec![Value::Int(1), Value::from("a"), Value::List(vec![])]);
        assert_eq!(encode(&value), r#"[ 1, "a", [  ] ]"#);
    }

    #[test]
    fn test_decode_reports_consumed_length() {
        let mut codec = TextCodec::new();
        let decoded = codec.decode(b"  42 \"next\"", false).unwrap();
        assert_eq!(decoded, Decoded::Complete(Value::Int(42), 4));
    }

    #[test]
    fn test_decode_incomplete_until_terminated() {
        let mut codec = TextCodec::new();
        assert_eq!(codec.decode(b"[ 1, 2", false).unwrap(), Decoded::Incomplete);
        assert_eq!(codec.decode(b"3.5", false).unwrap(), Decoded::Incomplete);
        assert_eq!(
            codec.decode(b"3.5\n", false).unwrap(),
            Decoded::Complete(Value::Float(3.5), 3)
        );
    }

    #[test]
    fn test_decode_lists_and_comments() {
        let value = decode_all("# results\n[ 1 2.5, \"x\" [ true ] ]");
        assert_eq!(
            value,
            Value::List(vec![
                Value::Int(1),
                Value::Float(2.5),
                Value::from("x"),
                Value::List(vec![Value::Bool(true)]),
            ])
        );
    }

    #[test]
    fn test_shared_references_survive_until_cleared() {
        let mut codec = TextCodec::new();
        let first = codec.decode(b"*1 -> [ 1, 2 ] ", false).unwrap();
        assert_eq!(first, Decoded::Complete(Value::from(vec![1, 2]), 14));
        assert_eq!(codec.copies_len(), 1);

        let second = codec.decode(b"[ *1;, *1 ]", true).unwrap();
        let expected = Value::List(vec![Value::from(vec![1, 2]), Value::from(vec![1, 2])]);
        assert_eq!(second, Decoded::Complete(expected, 11));

        codec.clear_maps();
        assert!(matches!(
            codec.decode(b"*1;", true),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_incomplete_decode_does_not_commit_definitions() {
        let mut codec = TextCodec::new();
        assert_eq!(
            codec.decode(b"[ *2 -> 5, ", false).unwrap(),
            Decoded::Incomplete
        );
        assert_eq!(codec.copies_len(), 0);
    }

    #[test]
    fn test_null_pointer() {
        assert_eq!(decode_all("*0;"), Value::None);
        assert_eq!(decode_all("None"), Value::None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut codec = TextCodec::new();
        assert!(matches!(
            codec.decode(b"@oops ", false),
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(
            codec.decode(b"  ", true),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_set_binary_is_recorded() {
        let mut codec = TextCodec::new();
        assert!(!codec.binary());
        codec.set_binary(true);
        assert!(codec.binary());
    }
}
