//! Protocol engine shared by a connection and its remote objects.
//!
//! A `Session` is always used under the connection's mutex, which is what
//! keeps requests and replies strictly alternating on the transport.
//!
//! Per call: write header, write arguments, flush, wait for `!R n` or
//! `!E msg`, read n values.

use std::collections::HashMap;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use tokio::process::Child;
use tracing::{debug, error, info, warn};

use crate::client::ids::IdAllocator;
use crate::codec::ValueCodec;
use crate::error::{ClientError, Result};
use crate::ipc::{PStream, ReplyHeader, Request, Transport};
use crate::value::Value;

/// How a remote object came to exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectOrigin {
    /// Built from an object specification with `!N`.
    Spec(String),
    /// Loaded from a file with `!L`.
    File(PathBuf),
}

pub(crate) struct Session {
    stream: PStream,
    child: Option<Child>,
    peer: String,
    objects: HashMap<u32, ObjectOrigin>,
    ids: IdAllocator,
    clear_maps: bool,
    log_traffic: bool,
    /// Pings whose `!R 0` has not been read yet (the probe gave up waiting).
    unanswered_pings: usize,
    closed: bool,
}

impl Session {
    pub(crate) fn new(transport: Transport, codec: Box<dyn ValueCodec>) -> Self {
        let (reader, writer, child, peer) = transport.into_parts();
        Self {
            stream: PStream::new(reader, writer, codec),
            child,
            peer,
            objects: HashMap::new(),
            ids: IdAllocator::new(),
            clear_maps: true,
            log_traffic: false,
            unanswered_pings: 0,
            closed: false,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn set_clear_maps(&mut self, enabled: bool) {
        self.clear_maps = enabled;
    }

    pub(crate) fn set_log_traffic(&mut self, enabled: bool) {
        self.log_traffic = enabled;
    }

    pub(crate) fn set_binary(&mut self, enabled: bool) {
        self.stream.set_binary(enabled);
    }

    pub(crate) fn has_object(&self, id: u32) -> bool {
        self.objects.contains_key(&id)
    }

    /// Registered objects, sorted by id.
    pub(crate) fn objects(&self) -> Vec<(u32, ObjectOrigin)> {
        let mut objects: Vec<_> = self
            .objects
            .iter()
            .map(|(id, origin)| (*id, origin.clone()))
            .collect();
        objects.sort_by_key(|(id, _)| *id);
        objects
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    // =========================================================================
    // Request / reply plumbing
    // =========================================================================

    /// Writes a request with its arguments and flushes it.
    pub(crate) async fn send(&mut self, request: &Request<'_>, args: &[Value]) -> Result<()> {
        if request.clears_maps() && self.clear_maps {
            self.stream.clear_maps();
        }

        let header = request.header();
        self.stream.write(&header);
        if self.log_traffic {
            debug!("SENDING: {}", header.trim_end());
        }

        if request.carries_args() {
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    self.stream.write(" ");
                }
                if let Err(e) = self.stream.write_typed(arg) {
                    self.stream.discard_output();
                    return Err(e);
                }
                if self.log_traffic {
                    debug!(" ARG_{}: {:?}", i, arg);
                }
            }
            self.stream.write("\n");
        }

        self.stream.flush().await
    }

    /// Reads and discards the replies of pings the liveness probe gave up on.
    /// Cancel-safe: the counter only drops once a reply has been read.
    async fn drain_pings(&mut self) -> Result<()> {
        while self.unanswered_pings > 0 {
            // A stale ping outcome belongs to no caller: log it and move on.
            match self.stream.read_reply_header().await? {
                ReplyHeader::Results(0) => {}
                ReplyHeader::Results(n) => {
                    self.read_results(n).await?;
                    warn!("Discarding late ping reply with {} values", n);
                }
                ReplyHeader::Error(msg) => warn!("Discarding late ping error: {}", msg),
            }
            self.unanswered_pings -= 1;
        }
        Ok(())
    }

    /// Waits for the next reply header and returns its result count.
    async fn read_result_count(&mut self) -> Result<usize> {
        self.drain_pings().await?;
        match self.stream.read_reply_header().await? {
            ReplyHeader::Results(n) => {
                if self.log_traffic {
                    debug!("RECEIVED RESULT COUNT: !R {}", n);
                }
                Ok(n)
            }
            ReplyHeader::Error(msg) => {
                error!("RECEIVED ERROR: {}", msg);
                Err(ClientError::Remote(msg))
            }
        }
    }

    async fn read_results(&mut self, n: usize) -> Result<Vec<Value>> {
        // `n` comes from the peer; do not trust it for the allocation.
        let mut results = Vec::with_capacity(n.min(64));
        for i in 0..n {
            let value = self.stream.binread().await?;
            if self.log_traffic {
                debug!(" RES_{}: {:?}", i, value);
            }
            results.push(value);
        }
        Ok(results)
    }

    /// Reads a reply that must carry exactly `expected` values.
    ///
    /// On a count mismatch the announced values are still read, so the next
    /// call starts on a reply boundary.
    async fn expect_results(&mut self, expected: usize) -> Result<Vec<Value>> {
        let n = self.read_result_count().await?;
        let results = self.read_results(n).await?;
        if n != expected {
            return Err(ClientError::Protocol(format!(
                "Expected {} return values, but read !R {}",
                expected, n
            )));
        }
        Ok(results)
    }

    /// Sends a request and returns whatever the server answers.
    async fn call(&mut self, request: Request<'_>, args: &[Value]) -> Result<Vec<Value>> {
        self.ensure_open()?;
        self.send(&request, args).await?;
        let n = self.read_result_count().await?;
        self.read_results(n).await
    }

    /// Sends a request and checks the number of values returned.
    async fn call_expecting(
        &mut self,
        request: Request<'_>,
        args: &[Value],
        expected: usize,
    ) -> Result<Vec<Value>> {
        self.ensure_open()?;
        self.send(&request, args).await?;
        self.expect_results(expected).await
    }

    // =========================================================================
    // Commands
    // =========================================================================

    pub(crate) async fn new_object(&mut self, spec: &str) -> Result<u32> {
        self.ensure_open()?;
        let id = self.ids.reserve();
        match self.call_expecting(Request::New { id, spec }, &[], 0).await {
            Ok(_) => {
                self.objects.insert(id, ObjectOrigin::Spec(spec.to_string()));
                Ok(id)
            }
            Err(e) => {
                let _ = self.ids.free(id);
                Err(e)
            }
        }
    }

    pub(crate) async fn load(&mut self, path: PathBuf) -> Result<u32> {
        self.ensure_open()?;
        let id = self.ids.reserve();
        let path_text = path.to_string_lossy().into_owned();
        match self
            .call_expecting(Request::Load { id, path: &path_text }, &[], 0)
            .await
        {
            Ok(_) => {
                self.objects.insert(id, ObjectOrigin::File(path));
                Ok(id)
            }
            Err(e) => {
                let _ = self.ids.free(id);
                Err(e)
            }
        }
    }

    pub(crate) async fn delete(&mut self, id: u32) -> Result<()> {
        self.ensure_open()?;
        if !self.objects.contains_key(&id) {
            return Err(ClientError::NotFound(id));
        }
        self.call_expecting(Request::Delete { id }, &[], 0).await?;
        self.objects.remove(&id);
        self.ids.free(id)
    }

    pub(crate) async fn delete_all(&mut self) -> Result<()> {
        self.call_expecting(Request::DeleteAll, &[], 0).await?;
        self.objects.clear();
        self.ids.clear();
        Ok(())
    }

    pub(crate) async fn call_function(
        &mut self,
        name: &str,
        args: &[Value],
        expected: Option<usize>,
    ) -> Result<Vec<Value>> {
        crate::ipc::validate_name(name)?;
        let request = Request::Function {
            name,
            argc: args.len(),
        };
        match expected {
            Some(k) => self.call_expecting(request, args, k).await,
            None => self.call(request, args).await,
        }
    }

    pub(crate) async fn call_method(
        &mut self,
        id: u32,
        name: &str,
        args: &[Value],
        expected: Option<usize>,
    ) -> Result<Vec<Value>> {
        crate::ipc::validate_name(name)?;
        self.ensure_open()?;
        if !self.objects.contains_key(&id) {
            return Err(ClientError::NotFound(id));
        }
        let request = Request::Method {
            id,
            name,
            argc: args.len(),
        };
        match expected {
            Some(k) => self.call_expecting(request, args, k).await,
            None => self.call(request, args).await,
        }
    }

    /// Sends a ping and waits for its `!R 0`.
    ///
    /// The ping counts as unanswered from the moment it is sent, so if this
    /// future is dropped while waiting, the late reply is drained before the
    /// next one is read.
    pub(crate) async fn ping(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.send(&Request::Ping, &[]).await?;
        self.unanswered_pings += 1;
        self.drain_pings().await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Sends `!Q`, closes the write side and waits for a child server to
    /// exit. Failures are logged, never returned. Idempotent.
    pub(crate) async fn close(&mut self) {
        if self.closed {
            return;
        }
        info!("Closing connection to {}", self.peer);

        self.stream.write(Request::Quit.header().as_str());
        if let Err(e) = self.stream.flush().await {
            warn!("Could not send quit to {}: {}", self.peer, e);
        }
        self.stream.shutdown_write().await;

        if let Some(mut child) = self.child.take() {
            info!("Waiting for server process to finish");
            match child.wait().await {
                Ok(status) => info!("Server process exited: {}", status),
                Err(e) => warn!("Error waiting for server process: {}", e),
            }
        }

        self.closed = true;
        info!("Closed.");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // No await here: dropping the write side gives the server EOF, which
        // makes it leave its command loop.
        self.stream.drop_writer();

        let Some(child) = self.child.as_mut() else {
            return;
        };

        for _ in 0..10 {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!("Server process exited: {}", status);
                    return;
                }
                Ok(None) => thread::sleep(Duration::from_millis(50)),
                Err(e) => {
                    warn!("Error waiting for server process: {}", e);
                    return;
                }
            }
        }

        warn!("Server process didn't exit after EOF, killing");
        if let Err(e) = child.start_kill() {
            warn!("Failed to kill server process: {}", e);
        }
    }
}
