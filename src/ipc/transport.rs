//! Byte transports to a server process.
//!
//! A [`Transport`] is a read half, a write half and, when the server was
//! launched by us, the child process that has to be reaped on close.

use std::fmt;
#[cfg(unix)]
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::info;
use url::Url;

use crate::error::{ClientError, Result};
use crate::ipc::stream::{BoxedReader, BoxedWriter};

/// Where to find a server that is already listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `tcp://host:port` or plain `host:port`.
    Tcp { host: String, port: u16 },
    /// `unix:///path/to/socket`.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl FromStr for Endpoint {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ClientError::InvalidEndpoint(s.to_string());

        if !s.contains("://") {
            let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
            let host = host.trim_start_matches('[').trim_end_matches(']');
            let port = port.parse().map_err(|_| invalid())?;
            if host.is_empty() {
                return Err(invalid());
            }
            return Ok(Endpoint::Tcp {
                host: host.to_string(),
                port,
            });
        }

        let url = Url::parse(s).map_err(|_| invalid())?;
        match url.scheme() {
            "tcp" => {
                let host = url.host_str().ok_or_else(invalid)?;
                let host = host.trim_start_matches('[').trim_end_matches(']');
                let port = url.port().ok_or_else(invalid)?;
                Ok(Endpoint::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            #[cfg(unix)]
            "unix" => {
                if url.path().is_empty() {
                    return Err(invalid());
                }
                Ok(Endpoint::Unix(PathBuf::from(url.path())))
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// A duplex byte stream to the server.
pub struct Transport {
    reader: BoxedReader,
    writer: BoxedWriter,
    child: Option<Child>,
    peer: String,
}

impl Transport {
    /// Launches the server through the platform shell and talks to it over
    /// its stdin/stdout. The server's stderr is inherited.
    pub fn spawn(command: &str) -> Result<Self> {
        info!("Launching server: command = {}", command);

        let mut child = shell_command(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(ClientError::ConnectionFailed)?;

        let missing = |what: &str| {
            ClientError::ConnectionFailed(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to get {} handle for server process", what),
            ))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;

        Ok(Self {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
            peer: format!("process `{}`", command),
        })
    }

    /// Opens a stream socket to a listening server.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        info!("Connecting to server at {}", endpoint);

        match endpoint {
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(ClientError::ConnectionFailed)?;
                // Headers are small and every request is followed by a wait.
                stream.set_nodelay(true).map_err(ClientError::ConnectionFailed)?;
                let (read_half, write_half) = stream.into_split();
                Ok(Self {
                    reader: Box::new(read_half),
                    writer: Box::new(write_half),
                    child: None,
                    peer: endpoint.to_string(),
                })
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(ClientError::ConnectionFailed)?;
                let (read_half, write_half) = stream.into_split();
                Ok(Self {
                    reader: Box::new(read_half),
                    writer: Box::new(write_half),
                    child: None,
                    peer: endpoint.to_string(),
                })
            }
        }
    }

    /// Wraps an arbitrary pair of streams.
    pub fn from_io<R, W>(reader: R, writer: W, peer: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
            peer: peer.into(),
        }
    }

    /// Human-readable description of the other end.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Whether the server is a child process owned by this transport.
    pub fn owns_process(&self) -> bool {
        self.child.is_some()
    }

    pub(crate) fn into_parts(self) -> (BoxedReader, BoxedWriter, Option<Child>, String) {
        (self.reader, self.writer, self.child, self.peer)
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("peer", &self.peer)
            .field("owns_process", &self.owns_process())
            .finish()
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            "localhost:15000".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp {
                host: "localhost".to_string(),
                port: 15000
            }
        );
        assert_eq!(
            "[::1]:9000".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp {
                host: "::1".to_string(),
                port: 9000
            }
        );
    }

    #[test]
    fn test_parse_tcp_url() {
        let endpoint: Endpoint = "tcp://compute-node:4242".parse().unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Tcp {
                host: "compute-node".to_string(),
                port: 4242
            }
        );
        assert_eq!(endpoint.to_string(), "tcp://compute-node:4242");
    }

    #[cfg(unix)]
    #[test]
    fn test_parse_unix_url() {
        let endpoint: Endpoint = "unix:///tmp/plearn.sock".parse().unwrap();
        assert_eq!(endpoint, Endpoint::Unix(PathBuf::from("/tmp/plearn.sock")));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["localhost", "localhost:port", ":80", "tcp://nohost", "http://a:1"] {
            assert!(
                matches!(bad.parse::<Endpoint>(), Err(ClientError::InvalidEndpoint(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to find a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        };
        let err = Transport::connect(&endpoint).await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionFailed(_)));
    }

    #[test]
    fn test_from_io_has_no_process() {
        let (a, b) = tokio::io::duplex(64);
        let transport = Transport::from_io(a, b, "in-memory");
        assert_eq!(transport.peer(), "in-memory");
        assert!(!transport.owns_process());
    }
}
