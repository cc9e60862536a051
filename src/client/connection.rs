//! Connection to a remote server.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

use crate::client::invoke::{Invoke, Reply};
use crate::client::object::RemoteObject;
use crate::client::session::{ObjectOrigin, Session};
use crate::codec::{TextCodec, ValueCodec};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::ipc::{Endpoint, Transport};
use crate::value::Value;

/// Client connection to a remote computation server.
///
/// The connection owns the transport, the serializer and the table of remote
/// objects it created. Calls are serialized: at most one request is in
/// flight, and each call waits for its complete reply.
///
/// # Connection Lifecycle
///
/// - `launch()` / `connect()` / `with_transport()` - open and handshake
/// - `new_object()` / `load()` - create remote objects
/// - `call_function()` / `RemoteObject::call()` - run remote code
/// - `close()` - send `!Q` and reap a launched server
///
/// # Example
///
/// ```ignore
/// use plremote::{ClientConfig, Connection, Value};
///
/// let conn = Connection::launch("plearn server", &ClientConfig::default()).await?;
/// let learner = conn.new_object("KNNRegressor(k=3)").await?;
/// let out = learner.call("computeOutput", &[Value::from(vec![0.5, 1.0])]).await?;
/// conn.close().await;
/// ```
pub struct Connection {
    session: Arc<Mutex<Session>>,
    ping_timeout: Duration,
    peer: String,
}

impl Connection {
    /// Launches `command` through the shell and talks to it over its
    /// stdin/stdout.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ConnectionFailed` if the process cannot be
    /// spawned or does not answer the initial ping.
    pub async fn launch(command: &str, config: &ClientConfig) -> Result<Self> {
        let transport = Transport::spawn(command)?;
        Self::with_transport(transport, config).await
    }

    /// Connects to a server that is already listening on `endpoint`.
    pub async fn connect(endpoint: &Endpoint, config: &ClientConfig) -> Result<Self> {
        let transport = Transport::connect(endpoint).await?;
        Self::with_transport(transport, config).await
    }

    /// Connects, retrying `config.connect_attempts` times with exponential
    /// backoff.
    pub async fn connect_with_retry(endpoint: &Endpoint, config: &ClientConfig) -> Result<Self> {
        let max_attempts = config.connect_attempts.max(1);
        let mut attempt = 1;

        loop {
            match Self::connect(endpoint, config).await {
                Ok(conn) => return Ok(conn),
                Err(e) if attempt < max_attempts => {
                    // Exponential backoff: 100ms, 200ms, 400ms, ...
                    let delay = Duration::from_millis(100 * (1u64 << (attempt - 1).min(16)));
                    warn!(
                        "Connection attempt {}/{} to {} failed: {}; retrying in {:?}",
                        attempt, max_attempts, endpoint, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs the protocol over an already opened transport, using the
    /// built-in [`TextCodec`].
    pub async fn with_transport(transport: Transport, config: &ClientConfig) -> Result<Self> {
        Self::with_codec(transport, Box::new(TextCodec::new()), config).await
    }

    /// Runs the protocol over `transport` with a custom value codec.
    pub async fn with_codec(
        transport: Transport,
        codec: Box<dyn ValueCodec>,
        config: &ClientConfig,
    ) -> Result<Self> {
        let peer = transport.peer().to_string();
        let mut session = Session::new(transport, codec);
        session.set_clear_maps(config.clear_maps);
        session.set_log_traffic(config.log_traffic);

        let conn = Self {
            session: Arc::new(Mutex::new(session)),
            ping_timeout: config.ping_timeout(),
            peer,
        };
        conn.handshake(config).await?;
        info!("Connected to {}", conn.peer);
        Ok(conn)
    }

    async fn handshake(&self, config: &ClientConfig) -> Result<()> {
        if !self.is_alive().await {
            return Err(ClientError::ConnectionFailed(io::Error::new(
                io::ErrorKind::TimedOut,
                "ping did not respond",
            )));
        }
        if config.binary_mode {
            self.call_function("binary", &[]).await?;
            self.session.lock().await.set_binary(true);
        }
        if config.implicit_storage {
            self.call_function("implicit_storage", &[Value::Bool(true)])
                .await?;
        }
        Ok(())
    }

    /// Description of the server end (command line or endpoint).
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Bound on the liveness probe.
    pub fn ping_timeout(&self) -> Duration {
        self.ping_timeout
    }

    /// Changes the probe deadline.
    pub fn set_ping_timeout(&mut self, ping_timeout: Duration) {
        self.ping_timeout = ping_timeout;
    }

    /// Toggles clearing the serializer's copies map before each call.
    pub async fn set_clear_maps(&self, enabled: bool) {
        self.session.lock().await.set_clear_maps(enabled);
    }

    /// Toggles debug logging of every request and reply.
    pub async fn set_log_traffic(&self, enabled: bool) {
        self.session.lock().await.set_log_traffic(enabled);
    }

    /// Ids and origins of the live remote objects, sorted by id.
    pub async fn objects(&self) -> Vec<(u32, ObjectOrigin)> {
        self.session.lock().await.objects()
    }

    pub async fn is_closed(&self) -> bool {
        self.session.lock().await.is_closed()
    }

    fn proxy(&self, id: u32) -> RemoteObject {
        RemoteObject::new(Arc::downgrade(&self.session), id)
    }

    // =========================================================================
    // Objects
    // =========================================================================

    /// Creates a remote object from its specification (`!N`).
    pub async fn new_object(&self, spec: &str) -> Result<RemoteObject> {
        let id = self.session.lock().await.new_object(spec).await?;
        Ok(self.proxy(id))
    }

    /// Loads a remote object from a file on the server side (`!L`).
    pub async fn load(&self, path: impl Into<PathBuf>) -> Result<RemoteObject> {
        let id = self.session.lock().await.load(path.into()).await?;
        Ok(self.proxy(id))
    }

    /// Proxy for an object created earlier on this connection.
    pub async fn object(&self, id: u32) -> Result<RemoteObject> {
        if self.session.lock().await.has_object(id) {
            Ok(self.proxy(id))
        } else {
            Err(ClientError::NotFound(id))
        }
    }

    /// Deletes one remote object (`!D`).
    pub async fn delete(&self, id: u32) -> Result<()> {
        self.session.lock().await.delete(id).await
    }

    /// Deletes every remote object (`!Z`).
    pub async fn delete_all(&self) -> Result<()> {
        self.session.lock().await.delete_all().await
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Calls a remote function (`!F`).
    pub async fn call_function(&self, name: &str, args: &[Value]) -> Result<Reply> {
        let values = self
            .session
            .lock()
            .await
            .call_function(name, args, None)
            .await?;
        Ok(Reply::from(values))
    }

    /// Calls a remote function that must return exactly `expected` values.
    pub async fn call_function_expecting(
        &self,
        name: &str,
        args: &[Value],
        expected: usize,
    ) -> Result<Vec<Value>> {
        self.session
            .lock()
            .await
            .call_function(name, args, Some(expected))
            .await
    }

    /// Calls a method on remote object `id` (`!M`).
    pub async fn call_method(&self, id: u32, name: &str, args: &[Value]) -> Result<Reply> {
        let values = self
            .session
            .lock()
            .await
            .call_method(id, name, args, None)
            .await?;
        Ok(Reply::from(values))
    }

    /// Calls a method that must return exactly `expected` values.
    pub async fn call_method_expecting(
        &self,
        id: u32,
        name: &str,
        args: &[Value],
        expected: usize,
    ) -> Result<Vec<Value>> {
        self.session
            .lock()
            .await
            .call_method(id, name, args, Some(expected))
            .await
    }

    async fn call_single(&self, name: &str, args: &[Value]) -> Result<Value> {
        self.call_function(name, args).await?.into_single()
    }

    // =========================================================================
    // Server functions
    // =========================================================================

    /// Names of the remote functions.
    pub async fn list_functions(&self) -> Result<Value> {
        self.call_single("listFunctions", &[]).await
    }

    pub async fn list_function_prototypes(&self) -> Result<Value> {
        self.call_single("listFunctionPrototypes", &[]).await
    }

    pub async fn help_function(&self, function: &str) -> Result<Value> {
        self.call_single("helpFunction", &[Value::from(function)])
            .await
    }

    pub async fn list_methods(&self, class: &str) -> Result<Value> {
        self.call_single("listMethods", &[Value::from(class)]).await
    }

    pub async fn list_method_prototypes(&self, class: &str) -> Result<Value> {
        self.call_single("listMethodPrototypes", &[Value::from(class)])
            .await
    }

    pub async fn help_method(&self, class: &str, method: &str) -> Result<Value> {
        self.call_single("helpMethod", &[Value::from(class), Value::from(method)])
            .await
    }

    /// Changes the server's working directory.
    pub async fn change_directory(&self, path: &str) -> Result<()> {
        self.call_function_expecting("cd", &[Value::from(path)], 0)
            .await?;
        Ok(())
    }

    /// Revision string the server was built from.
    pub async fn repository_revision(&self) -> Result<String> {
        let value = self.call_single("pl_repository_revision", &[]).await?;
        String::try_from(value).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Pings the server and reports whether `!R 0` came back in time.
    ///
    /// Never fails: a timeout, a transport error, or a closed connection all
    /// give `false`. The whole probe, including waiting for the connection
    /// lock, runs under one deadline.
    pub async fn is_alive(&self) -> bool {
        let deadline = Instant::now() + self.ping_timeout;

        let mut session = match timeout_at(deadline, self.session.lock()).await {
            Ok(session) => session,
            Err(_) => {
                warn!("Ping skipped: connection to {} is busy", self.peer);
                return false;
            }
        };
        if session.is_closed() {
            return false;
        }

        match timeout_at(deadline, session.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Ping to {} failed: {}", self.peer, e);
                false
            }
            Err(_) => {
                warn!(
                    "Ping to {} did not respond within {:?}",
                    self.peer, self.ping_timeout
                );
                false
            }
        }
    }

    /// Sends `!Q`, closes the stream and waits for a launched server to
    /// exit. Errors are logged and swallowed; closing twice is a no-op.
    pub async fn close(&self) {
        self.session.lock().await.close().await;
    }
}

impl Invoke for Connection {
    /// Remote function call by name.
    async fn invoke(&self, name: &str, args: &[Value]) -> Result<Reply> {
        self.call_function(name, args).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("ping_timeout", &self.ping_timeout)
            .finish()
    }
}
