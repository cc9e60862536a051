//! plremote: client for remote PLearn-style computation servers
//!
//! A host process drives a long-lived server through a line-oriented
//! request/response protocol carried over a pipe or socket:
//!
//! - `client` - connections, remote object proxies and id allocation
//! - `ipc` - transports, request framing and the buffered serializer stream
//! - `codec` - encoding of individual values (`ValueCodec`, `TextCodec`)
//! - `value` - the typed values exchanged with the server
//! - `config` - client configuration (file + environment)
//! - `error` - error kinds returned by every operation
//!
//! # Example
//!
//! ```ignore
//! use plremote::{ClientConfig, Connection, Invoke, Value};
//!
//! let config = ClientConfig::load()?;
//! let conn = Connection::launch(&config.command, &config).await?;
//!
//! let learner = conn.new_object("KNNRegressor(k=3)").await?;
//! let reply = learner.invoke("computeOutput", &[Value::from(vec![0.5, 1.0])]).await?;
//!
//! conn.close().await;
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod ipc;
mod scan;
pub mod value;

pub use client::{Connection, IdAllocator, Invoke, ObjectOrigin, RemoteObject, Reply};
pub use codec::{TextCodec, ValueCodec};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use ipc::{Endpoint, Transport};
pub use value::Value;
