//! Buffered duplex stream speaking the server's serialization.
//!
//! `PStream` wraps the two halves of a transport together with a
//! [`ValueCodec`]. Output is accumulated in memory and sent on [`flush`];
//! input is read in chunks into an owned buffer and only consumed once a
//! complete item has been decoded from it. Every read operation is therefore
//! cancel-safe: if its future is dropped (for instance by a timeout), no
//! received byte is lost.
//!
//! [`flush`]: PStream::flush

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{Decoded, ValueCodec};
use crate::error::{ClientError, Result};
use crate::ipc::framing::{parse_reply_header, ReplyHeader};
use crate::scan::{Scan, Scanner};
use crate::value::Value;

/// Read side of a transport.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write side of a transport.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Size of a single read from the transport.
const READ_CHUNK: usize = 8 * 1024;

pub struct PStream {
    reader: BoxedReader,
    /// `None` once the write side has been shut down.
    writer: Option<BoxedWriter>,
    input: Vec<u8>,
    /// Start of the unconsumed part of `input`.
    start: usize,
    eof: bool,
    /// Set after a malformed value: skip input up to the next `!` that
    /// starts a line before reading another reply header.
    resync: bool,
    /// Whether the last byte skipped while resyncing was a newline.
    resync_at_line_start: bool,
    output: Vec<u8>,
    codec: Box<dyn ValueCodec>,
}

impl PStream {
    pub fn new(reader: BoxedReader, writer: BoxedWriter, codec: Box<dyn ValueCodec>) -> Self {
        Self {
            reader,
            writer: Some(writer),
            input: Vec::new(),
            start: 0,
            eof: false,
            resync: false,
            resync_at_line_start: false,
            output: Vec::new(),
            codec,
        }
    }

    // ---------------------------------------------------------------------
    // Output
    // ---------------------------------------------------------------------

    /// Queues raw text.
    pub fn write(&mut self, text: &str) {
        self.output.extend_from_slice(text.as_bytes());
    }

    /// Queues the encoding of a value.
    pub fn write_typed(&mut self, value: &Value) -> Result<()> {
        self.codec.encode(value, &mut self.output)?;
        Ok(())
    }

    /// Drops queued output that was never flushed.
    pub fn discard_output(&mut self) {
        self.output.clear();
    }

    /// Sends all queued output and flushes the transport.
    pub async fn flush(&mut self) -> Result<()> {
        let output = std::mem::take(&mut self.output);
        let writer = self.writer.as_mut().ok_or_else(|| {
            ClientError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write side of the connection is closed",
            ))
        })?;
        writer.write_all(&output).await.map_err(ClientError::Io)?;
        writer.flush().await.map_err(ClientError::Io)?;
        Ok(())
    }

    /// Shuts down the write side, so the server reads end-of-file.
    pub async fn shutdown_write(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("Shutting down write side failed: {}", e);
            }
        }
    }

    /// Drops the write side without flushing; usable outside async code.
    pub fn drop_writer(&mut self) {
        self.writer = None;
    }

    // ---------------------------------------------------------------------
    // Input
    // ---------------------------------------------------------------------

    fn buffered(&self) -> &[u8] {
        &self.input[self.start..]
    }

    fn consume(&mut self, n: usize) {
        self.start += n;
        if self.start >= self.input.len() {
            self.input.clear();
            self.start = 0;
        }
    }

    /// Skips the rest of a reply whose values could not be decoded, up to
    /// the `!` that starts the next line. Cancel-safe.
    async fn skip_to_next_header(&mut self) -> Result<()> {
        while self.resync {
            let mut at_line_start = self.resync_at_line_start;
            let mut found = false;
            let mut skipped = 0;
            for &byte in self.buffered() {
                if byte == b'!' && at_line_start {
                    found = true;
                    break;
                }
                at_line_start = byte == b'\n';
                skipped += 1;
            }
            self.resync_at_line_start = at_line_start;
            self.consume(skipped);
            if found {
                self.resync = false;
                break;
            }
            if self.eof {
                return Err(Self::closed_by_peer());
            }
            self.fill().await?;
        }
        Ok(())
    }

    /// Reads one more chunk from the transport. Cancel-safe.
    async fn fill(&mut self) -> Result<()> {
        if self.start > 0 {
            self.input.drain(..self.start);
            self.start = 0;
        }
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.reader.read(&mut chunk).await.map_err(ClientError::Io)?;
        if n == 0 {
            self.eof = true;
        } else {
            self.input.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    fn closed_by_peer() -> ClientError {
        ClientError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Connection closed by server",
        ))
    }

    /// Runs an incremental parser over the buffered input, reading more as
    /// long as it asks for it.
    async fn read_with<T>(
        &mut self,
        mut parse: impl FnMut(&mut dyn ValueCodec, &[u8], bool) -> Result<Decoded<T>>,
    ) -> Result<T> {
        loop {
            if self.eof && self.buffered().iter().all(u8::is_ascii_whitespace) {
                return Err(Self::closed_by_peer());
            }
            match parse(self.codec.as_mut(), &self.input[self.start..], self.eof)? {
                Decoded::Complete(value, consumed) => {
                    self.consume(consumed);
                    return Ok(value);
                }
                Decoded::Incomplete if self.eof => return Err(Self::closed_by_peer()),
                Decoded::Incomplete => self.fill().await?,
            }
        }
    }

    /// Reads a single byte.
    pub async fn get(&mut self) -> Result<u8> {
        self.read_with(|_, input, eof| scan(input, eof, |s| s.bump()))
            .await
    }

    /// Skips whitespace and `#` comments.
    pub async fn skip_blanks_and_comments(&mut self) -> Result<()> {
        loop {
            let mut scanner = Scanner::new(self.buffered(), self.eof);
            let done = scanner.skip_blanks_and_comments();
            let skipped = scanner.pos();
            self.consume(skipped);
            match done {
                Ok(()) if !self.buffered().is_empty() || self.eof => return Ok(()),
                Ok(()) | Err(Scan::Incomplete) => self.fill().await?,
                Err(Scan::Invalid(msg)) => return Err(ClientError::Protocol(msg)),
            }
        }
    }

    /// Reads an integer token.
    pub async fn read_int(&mut self) -> Result<i64> {
        self.read_with(|_, input, eof| {
            scan(input, eof, |s| {
                s.skip_blanks_and_comments()?;
                s.integer()
            })
        })
        .await
    }

    /// Reads a quoted string, or a bare token.
    pub async fn read_string(&mut self) -> Result<String> {
        self.read_with(|_, input, eof| {
            scan(input, eof, |s| {
                s.skip_blanks_and_comments()?;
                if s.peek()? == b'"' {
                    s.quoted_string()
                } else {
                    s.token().map(str::to_string)
                }
            })
        })
        .await
    }

    /// Reads one encoded value.
    ///
    /// A value the codec cannot decode leaves the input in an unknown state:
    /// the rest of that reply is skipped before the next reply header is
    /// read, up to the next `!` at the start of a line.
    pub async fn binread(&mut self) -> Result<Value> {
        let result = self
            .read_with(|codec, input, eof| Ok(codec.decode(input, eof)?))
            .await;
        if let Err(ClientError::Protocol(_)) = &result {
            self.resync = true;
            self.resync_at_line_start = false;
        }
        result
    }

    /// Reads a reply header. Cancel-safe.
    pub async fn read_reply_header(&mut self) -> Result<ReplyHeader> {
        self.skip_to_next_header().await?;
        loop {
            if self.eof && self.buffered().iter().all(u8::is_ascii_whitespace) {
                return Err(Self::closed_by_peer());
            }
            match parse_reply_header(self.buffered(), self.eof) {
                Ok(Decoded::Complete(header, consumed)) => {
                    self.consume(consumed);
                    return Ok(header);
                }
                Ok(Decoded::Incomplete) if self.eof => return Err(Self::closed_by_peer()),
                Ok(Decoded::Incomplete) => self.fill().await?,
                Err(e) => {
                    self.consume(e.consumed);
                    return Err(ClientError::Protocol(e.message));
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Codec state
    // ---------------------------------------------------------------------

    /// Forgets shared substructures on the codec side.
    pub fn clear_maps(&mut self) {
        self.codec.clear_maps();
    }

    pub fn set_binary(&mut self, enabled: bool) {
        self.codec.set_binary(enabled);
    }
}

/// Adapts a scanner-based parse to the `Decoded` protocol.
fn scan<T>(
    input: &[u8],
    eof: bool,
    parse: impl FnOnce(&mut Scanner<'_>) -> Result<T, Scan>,
) -> Result<Decoded<T>> {
    let mut scanner = Scanner::new(input, eof);
    match parse(&mut scanner) {
        Ok(value) => Ok(Decoded::Complete(value, scanner.pos())),
        Err(Scan::Incomplete) => Ok(Decoded::Incomplete),
        Err(Scan::Invalid(msg)) => Err(ClientError::Protocol(msg)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TextCodec;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::time::timeout;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Returns the client-side stream and the server's halves.
    fn stream_pair() -> (PStream, ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
        let (client, server) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let stream = PStream::new(
            Box::new(client_read),
            Box::new(client_write),
            Box::new(TextCodec::new()),
        );
        (stream, server_read, server_write)
    }

    #[tokio::test]
    async fn test_write_and_flush() {
        let (mut stream, mut server_read, _server_write) = stream_pair();

        stream.write("!F add 2 ");
        stream.write_typed(&Value::Int(1)).unwrap();
        stream.write(" ");
        stream.write_typed(&Value::from("two")).unwrap();
        stream.write("\n");
        stream.flush().await.expect("flush failed");

        let mut buf = vec![0u8; 17];
        timeout(TEST_TIMEOUT, server_read.read_exact(&mut buf))
            .await
            .expect("Test timed out")
            .expect("read failed");
        assert_eq!(buf, b"!F add 2 1 \"two\"\n");
    }

    #[tokio::test]
    async fn test_reads_values_split_across_chunks() {
        let (mut stream, _server_read, mut server_write) = stream_pair();

        let writer = tokio::spawn(async move {
            server_write.write_all(b"!R 2 [ 1, ").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            server_write.write_all(b"2 ] \"done\"\n").await.unwrap();
            server_write
        });

        let header = timeout(TEST_TIMEOUT, stream.read_reply_header())
            .await
            .expect("Test timed out")
            .expect("header failed");
        assert_eq!(header, ReplyHeader::Results(2));

        let first = timeout(TEST_TIMEOUT, stream.binread())
            .await
            .expect("Test timed out")
            .expect("binread failed");
        assert_eq!(first, Value::from(vec![1, 2]));

        let second = stream.binread().await.expect("binread failed");
        assert_eq!(second, Value::from("done"));

        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_header_wait_is_cancel_safe() {
        let (mut stream, _server_read, mut server_write) = stream_pair();

        server_write.write_all(b"!R").await.unwrap();
        let first = timeout(Duration::from_millis(50), stream.read_reply_header()).await;
        assert!(first.is_err(), "header should still be incomplete");

        server_write.write_all(b" 0\n").await.unwrap();
        let header = timeout(TEST_TIMEOUT, stream.read_reply_header())
            .await
            .expect("Test timed out")
            .expect("header failed");
        assert_eq!(header, ReplyHeader::Results(0));
    }

    #[tokio::test]
    async fn test_protocol_violation_consumes_offending_bytes() {
        let (mut stream, _server_read, mut server_write) = stream_pair();

        server_write.write_all(b"!X\n!R 0\n").await.unwrap();
        let err = stream.read_reply_header().await.unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));

        let header = timeout(TEST_TIMEOUT, stream.read_reply_header())
            .await
            .expect("Test timed out")
            .expect("header failed");
        assert_eq!(header, ReplyHeader::Results(0));
    }

    #[tokio::test]
    async fn test_malformed_value_skips_rest_of_reply() {
        let (mut stream, _server_read, mut server_write) = stream_pair();

        server_write.write_all(b"!R 3 @bad ").await.unwrap();
        let header = timeout(TEST_TIMEOUT, stream.read_reply_header())
            .await
            .expect("Test timed out")
            .expect("header failed");
        assert_eq!(header, ReplyHeader::Results(3));

        let err = timeout(TEST_TIMEOUT, stream.binread())
            .await
            .expect("Test timed out")
            .unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));

        // The remaining values arrive only after the failure.
        server_write
            .write_all(b"5 \"!not a header\"\n!R 1 7\n")
            .await
            .unwrap();
        let header = timeout(TEST_TIMEOUT, stream.read_reply_header())
            .await
            .expect("Test timed out")
            .expect("header failed");
        assert_eq!(header, ReplyHeader::Results(1));
        assert_eq!(stream.binread().await.unwrap(), Value::Int(7));
    }

    #[tokio::test]
    async fn test_malformed_value_with_next_reply_buffered() {
        let (mut stream, _server_read, mut server_write) = stream_pair();

        server_write
            .write_all(b"!R 2 @bad 5\n!R 1 \"ok\"\n")
            .await
            .unwrap();
        assert_eq!(
            stream.read_reply_header().await.unwrap(),
            ReplyHeader::Results(2)
        );
        assert!(matches!(
            stream.binread().await,
            Err(ClientError::Protocol(_))
        ));
        assert_eq!(
            timeout(TEST_TIMEOUT, stream.read_reply_header())
                .await
                .expect("Test timed out")
                .unwrap(),
            ReplyHeader::Results(1)
        );
        assert_eq!(stream.binread().await.unwrap(), Value::from("ok"));
    }

    #[tokio::test]
    async fn test_eof_is_reported_as_closed_connection() {
        let (mut stream, _server_read, mut server_write) = stream_pair();
        server_write.shutdown().await.unwrap();

        let err = timeout(TEST_TIMEOUT, stream.read_reply_header())
            .await
            .expect("Test timed out")
            .unwrap_err();
        match err {
            ClientError::Io(e) => {
                assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);
                assert!(e.to_string().contains("closed"));
            }
            other => panic!("Expected Io, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_primitive_reads() {
        let (mut stream, _server_read, mut server_write) = stream_pair();

        server_write
            .write_all(b"# comment\n  42 \"a b\" word x")
            .await
            .unwrap();
        server_write.shutdown().await.unwrap();

        stream.skip_blanks_and_comments().await.unwrap();
        assert_eq!(stream.read_int().await.unwrap(), 42);
        assert_eq!(stream.read_string().await.unwrap(), "a b");
        assert_eq!(stream.read_string().await.unwrap(), "word");
        stream.skip_blanks_and_comments().await.unwrap();
        assert_eq!(stream.get().await.unwrap(), b'x');
    }

    #[tokio::test]
    async fn test_flush_after_write_shutdown_fails() {
        let (mut stream, _server_read, _server_write) = stream_pair();
        stream.shutdown_write().await;
        stream.write("!P \n");
        assert!(matches!(stream.flush().await, Err(ClientError::Io(_))));
    }
}
