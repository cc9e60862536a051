//! Wire layer between the client and a remote computation server.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐   stdin/stdout pipes, TCP or   ┌─────────────────────┐
//! │   Connection    │        Unix socket             │   remote server     │
//! │   (PStream)     │  ◄────────────────────────────►│   (e.g. `plearn     │
//! └─────────────────┘   `!` headers + encoded values │    server`)         │
//!                                                    └─────────────────────┘
//! ```
//!
//! - `transport` opens the byte stream (spawned child, socket, or any
//!   in-memory stream).
//! - `stream` buffers it and exposes the serializer operations on top of a
//!   [`ValueCodec`](crate::codec::ValueCodec).
//! - `framing` renders request headers and parses reply headers.
//!
//! # Protocol
//!
//! Requests and replies strictly alternate; there is no request id:
//!
//! ```text
//! → !M 5 foo 1 3\n
//! ← !R 1 42
//! ```

mod framing;
mod stream;
mod transport;

pub use framing::{parse_reply_header, validate_name, FramingError, ReplyHeader, Request};
pub use stream::{BoxedReader, BoxedWriter, PStream};
pub use transport::{Endpoint, Transport};
