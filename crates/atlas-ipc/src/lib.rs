//! Atlas IPC Protocol and Client/Server
//!
//! This crate defines the wire protocol spoken by the crawl daemon and
//! provides the Unix socket client and server implementations. The engine
//! only ever consumes the client side; the server lives here so daemon
//! implementations and tests share one framing.

mod client;
mod error;
mod protocol;
mod server;

pub use client::IpcClient;
pub use error::IpcError;
pub use protocol::*;
pub use server::{IpcServer, RequestHandler};
