//! Persistent-connection TCP client runtime.
//!
//! `tether` keeps one long-lived socket to a server, writes application packets over it
//! from a single writer thread, and correlates the server's asynchronous responses with the
//! requests that caused them. Network failures are detected and reported, and an optional
//! reconnection manager restores the socket with exponential backoff.
//!
//! The wire format is pluggable through [`PacketFactory`]; [`BincodePacketFactory`] is the
//! bundled implementation.
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod packet;
pub mod queue;
pub mod server;
pub mod timer;

mod listeners;
mod sync;

pub use cli::{Command, prompt};
pub use client::Client;
pub use config::{ConfigError, Configuration};
pub use connection::{
    Connection, ConnectionError, ConnectionListener, ConnectionState, PacketListener,
    reconnect::{PreReconnect, ReconnectionManager},
};
pub use packet::{BincodePacketFactory, CodecError, Packet, PacketFactory};
pub use queue::{
    AttachInfo, QueueError, RequestContext, RequestError, RequestFlags, RequestQueue,
    ResponseHandler,
};
pub use server::EchoServer;
