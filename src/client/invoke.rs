//! Calls by name.
//!
//! The server decides which functions and methods exist, so the client does
//! not declare them: anything can be invoked by name and an unknown name
//! only shows up as a [`ClientError::Remote`](crate::error::ClientError)
//! at run time.

use std::future::Future;

use crate::error::{ClientError, Result};
use crate::value::Value;

/// Results of a call, shaped by how many values the server returned.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `!R 0`
    Nothing,
    /// `!R 1 <value>`
    Single(Value),
    /// `!R n <v1> ... <vn>` with n > 1, in order.
    Many(Vec<Value>),
}

impl Reply {
    pub fn len(&self) -> usize {
        match self {
            Reply::Nothing => 0,
            Reply::Single(_) => 1,
            Reply::Many(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Reply::Nothing)
    }

    /// The value of a single-result reply.
    pub fn single(&self) -> Option<&Value> {
        match self {
            Reply::Single(value) => Some(value),
            _ => None,
        }
    }

    /// Unwraps a single-result reply, failing for any other count.
    pub fn into_single(self) -> Result<Value> {
        match self {
            Reply::Single(value) => Ok(value),
            other => Err(ClientError::Protocol(format!(
                "Expected 1 return value, but read !R {}",
                other.len()
            ))),
        }
    }

    /// All returned values, in order.
    pub fn into_values(self) -> Vec<Value> {
        match self {
            Reply::Nothing => Vec::new(),
            Reply::Single(value) => vec![value],
            Reply::Many(values) => values,
        }
    }
}

impl From<Vec<Value>> for Reply {
    fn from(mut values: Vec<Value>) -> Self {
        match values.len() {
            0 => Reply::Nothing,
            1 => Reply::Single(values.remove(0)),
            _ => Reply::Many(values),
        }
    }
}

/// Something that can run a remote call given only its name.
///
/// [`Connection`](super::Connection) implements it with remote *functions*,
/// [`RemoteObject`](super::RemoteObject) with *methods* of its object.
pub trait Invoke {
    fn invoke(&self, name: &str, args: &[Value]) -> impl Future<Output = Result<Reply>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_reply_shape_follows_count() {
        assert_eq!(Reply::from(vec![]), Reply::Nothing);
        assert_eq!(Reply::from(vec![Value::Int(1)]), Reply::Single(Value::Int(1)));
        assert_eq!(
            Reply::from(vec![Value::Int(1), Value::Int(2)]),
            Reply::Many(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn test_into_single() {
        assert_eq!(Reply::Single(Value::Bool(true)).into_single().unwrap(), Value::Bool(true));
        assert!(matches!(
            Reply::Nothing.into_single(),
            Err(ClientError::Protocol(_))
        ));
    }

    #[test]
    fn test_into_values_preserves_order() {
        let reply = Reply::from(vec![Value::from("a"), Value::from("b"), Value::from("c")]);
        assert_eq!(reply.len(), 3);
        assert_eq!(
            reply.into_values(),
            vec![Value::from("a"), Value::from("b"), Value::from("c")]
        );
    }
}
