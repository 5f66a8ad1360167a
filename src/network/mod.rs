//! Control-channel networking: wire protocol, server, per-connection
//! handling, and the client half.

pub mod client;
pub mod connection;
pub mod protocol;
pub mod server;

pub use client::BrokerClient;
pub use connection::ConnectionHandler;
pub use server::{ControlServer, ServerConfig};
