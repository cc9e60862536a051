//! Incremental byte scanner shared by the value codec and reply framing.
//!
//! A `Scanner` looks at a borrowed slice of buffered input and never consumes
//! anything itself: callers read `pos()` once a parse completes and only then
//! drop those bytes from their buffer. Running out of input before a token is
//! terminated yields [`Scan::Incomplete`] (unless the peer has closed the
//! stream), so a parse can simply be retried after more bytes arrive.

/// Why a scan stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Scan {
    /// More input is needed to decide.
    Incomplete,
    /// The input can never form a valid item.
    Invalid(String),
}

pub(crate) type ScanResult<T> = Result<T, Scan>;

pub(crate) struct Scanner<'a> {
    input: &'a [u8],
    pos: usize,
    eof: bool,
}

impl<'a> Scanner<'a> {
    pub(crate) fn new(input: &'a [u8], eof: bool) -> Self {
        Self { input, pos: 0, eof }
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    fn end_of_input<T>(&self) -> ScanResult<T> {
        if self.eof {
            Err(Scan::Invalid("unexpected end of input".to_string()))
        } else {
            Err(Scan::Incomplete)
        }
    }

    pub(crate) fn peek(&self) -> ScanResult<u8> {
        self.peek_at(0)
    }

    pub(crate) fn peek_at(&self, offset: usize) -> ScanResult<u8> {
        match self.input.get(self.pos + offset) {
            Some(&b) => Ok(b),
            None => self.end_of_input(),
        }
    }

    pub(crate) fn bump(&mut self) -> ScanResult<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    /// Skips spaces and tabs only, stopping at line ends.
    pub(crate) fn skip_spaces(&mut self) {
        while let Some(b' ' | b'\t') = self.input.get(self.pos) {
            self.pos += 1;
        }
    }

    /// Skips whitespace and `#` comments (which run to the end of the line).
    pub(crate) fn skip_blanks_and_comments(&mut self) -> ScanResult<()> {
        loop {
            match self.input.get(self.pos) {
                Some(b) if b.is_ascii_whitespace() => self.pos += 1,
                Some(b'#') => match self.input[self.pos..].iter().position(|&b| b == b'\n') {
                    Some(offset) => self.pos += offset + 1,
                    None if self.eof => self.pos = self.input.len(),
                    None => return Err(Scan::Incomplete),
                },
                _ => return Ok(()),
            }
        }
    }

    /// Reads a bare token (`[A-Za-z0-9_+\-.]+`). The token must be followed by
    /// a delimiter or the end of a closed stream.
    pub(crate) fn token(&mut self) -> ScanResult<&'a str> {
        let start = self.pos;
        let rest = &self.input[start..];
        let len = rest
            .iter()
            .position(|&b| !is_token_byte(b))
            .unwrap_or(rest.len());
        if start + len == self.input.len() && !self.eof {
            return Err(Scan::Incomplete);
        }
        if len == 0 {
            return match self.input.get(start) {
                Some(&b) => Err(Scan::Invalid(format!(
                    "unexpected character {:?}",
                    b as char
                ))),
                None => self.end_of_input(),
            };
        }
        self.pos += len;
        // Token bytes are ASCII by construction.
        std::str::from_utf8(&rest[..len]).map_err(|e| Scan::Invalid(e.to_string()))
    }

    /// Reads an integer token.
    pub(crate) fn integer<T: std::str::FromStr>(&mut self) -> ScanResult<T> {
        let token = self.token()?;
        token
            .parse()
            .map_err(|_| Scan::Invalid(format!("expected an integer but read {:?}", token)))
    }

    /// Reads a double-quoted string with backslash escapes. The scanner must
    /// be positioned on the opening quote.
    pub(crate) fn quoted_string(&mut self) -> ScanResult<String> {
        if self.bump()? != b'"' {
            return Err(Scan::Invalid("expected '\"'".to_string()));
        }
        let mut bytes = Vec::new();
        loop {
            match self.bump()? {
                b'"' => break,
                b'\\' => bytes.push(match self.bump()? {
                    b'n' => b'\n',
                    b't' => b'\t',
                    b'r' => b'\r',
                    other => other,
                }),
                other => bytes.push(other),
            }
        }
        String::from_utf8(bytes).map_err(|e| Scan::Invalid(format!("string is not UTF-8: {}", e)))
    }

    /// Reads the rest of the current line, without its terminator.
    pub(crate) fn rest_of_line(&mut self) -> ScanResult<String> {
        let rest = &self.input[self.pos..];
        let (len, consumed) = match rest.iter().position(|&b| b == b'\n') {
            Some(offset) => (offset, offset + 1),
            None if self.eof => (rest.len(), rest.len()),
            None => return Err(Scan::Incomplete),
        };
        self.pos += consumed;
        Ok(String::from_utf8_lossy(&rest[..len]).trim_end().to_string())
    }
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'+' | b'-' | b'.')
}
