//! Client side of the remote server protocol.
//!
//! A [`Connection`] owns the conversation with one server; the
//! [`RemoteObject`]s it hands out are cheap handles that forward method
//! calls to it. Object ids come from an [`IdAllocator`] so that the server
//! can keep its objects in a compact table.

mod connection;
mod ids;
mod invoke;
mod object;
mod session;

pub use connection::Connection;
pub use ids::IdAllocator;
pub use invoke::{Invoke, Reply};
pub use object::RemoteObject;
pub use session::ObjectOrigin;
