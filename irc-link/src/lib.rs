//! IRC connection SDK
//!
//! A client-side connection manager for IRC servers: plaintext or TLS
//! sockets, line framing, concurrent send/receive loops, keep-alive replies
//! and reconnect signalling.
//!
//! # Modules
//!
//! - [`client`] - Connection lifecycle, public handle and configuration
//! - [`transport`] - Default ports, DNS, TCP and TLS setup
//! - [`irc`] - IRC message parsing/formatting
//! - [`history`] - Trait for consumers that persist chat lines

pub mod client;
pub mod history;
pub mod irc;
mod reader;
pub mod session;
pub mod transport;
mod writer;

pub use client::{Client, ClientConfig, ClientHandle, Disconnect, SendError, State};
pub use irc::{Message, ParseError};
pub use session::Reconnect;
pub use transport::ConnectionError;
