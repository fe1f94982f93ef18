//! yinyod - Yinyo run orchestrator daemon
//!
//! Library components for the daemon process: the HTTP API server, the
//! command layer, and the adapters for the blob store, key-value store,
//! event stream and job dispatcher.

pub mod app;
pub mod authz;
pub mod blobstore;
pub mod dispatcher;
pub mod keyvaluestore;
pub mod metered;
pub mod server;
pub mod stream;

pub use app::{App, CommandError};
pub use server::{AppState, ServerConfig};
