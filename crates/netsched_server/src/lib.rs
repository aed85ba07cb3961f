//! NetSched server: queue directory, TCP command surface, UDP notifier,
//! and the background maintenance threads around the queue engine.

pub mod directory;
pub mod handler;
pub mod notifier;
pub mod server;

pub use directory::QueueDirectory;
pub use handler::{Action, ConnectionHandler, ServerIdentity};
pub use server::Server;
