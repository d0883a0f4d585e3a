/// Listener contract and the default TCP/TLS/Unix listener
pub mod listener;

/// Per-connection socket state
pub mod socket;

/// Detachable socket handle
pub mod socket_ref;

/// Registry of active sockets
pub(crate) mod sockets_list;

/// Stream contract and transport implementations
pub mod stream;

pub use listener::{Listener, NetListener};
pub use socket::{CloseReason, Socket};
pub use socket_ref::SocketRef;
pub use stream::{Stream, TlsStream};
