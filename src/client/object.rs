//! Proxies for remote objects.

use std::sync::{Arc, Weak};

use tokio::sync::Mutex;

use crate::client::invoke::{Invoke, Reply};
use crate::client::session::Session;
use crate::error::{ClientError, Result};
use crate::value::Value;

/// Handle on an object living in the server.
///
/// A proxy does not keep its connection alive. Once the
/// [`Connection`](super::Connection) is dropped every call fails with
/// [`ClientError::Closed`].
#[derive(Debug, Clone)]
pub struct RemoteObject {
    session: Weak<Mutex<Session>>,
    id: u32,
}

impl RemoteObject {
    pub(crate) fn new(session: Weak<Mutex<Session>>, id: u32) -> Self {
        Self { session, id }
    }

    /// Id of the object on the server.
    pub fn id(&self) -> u32 {
        self.id
    }

    fn session(&self) -> Result<Arc<Mutex<Session>>> {
        self.session.upgrade().ok_or(ClientError::Closed)
    }

    /// Calls method `name` on the object.
    pub async fn call(&self, name: &str, args: &[Value]) -> Result<Reply> {
        let session = self.session()?;
        let values = session
            .lock()
            .await
            .call_method(self.id, name, args, None)
            .await?;
        Ok(Reply::from(values))
    }

    /// Calls method `name`, which must return exactly `expected` values.
    pub async fn call_expecting(
        &self,
        name: &str,
        args: &[Value],
        expected: usize,
    ) -> Result<Vec<Value>> {
        let session = self.session()?;
        let mut session = session.lock().await;
        session.call_method(self.id, name, args, Some(expected)).await
    }

    /// Textual representation of the object, from its `getObject` method.
    pub async fn get_object(&self) -> Result<Value> {
        let mut values = self.call_expecting("getObject", &[], 1).await?;
        values
            .pop()
            .ok_or_else(|| ClientError::Protocol("getObject returned no value".to_string()))
    }

    /// Deletes the object on the server and frees its id.
    pub async fn delete(self) -> Result<()> {
        let session = self.session()?;
        let mut session = session.lock().await;
        session.delete(self.id).await
    }
}

impl Invoke for RemoteObject {
    /// Remote method call by name.
    async fn invoke(&self, name: &str, args: &[Value]) -> Result<Reply> {
        self.call(name, args).await
    }
}
