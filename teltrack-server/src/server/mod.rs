//! TCP server for the terminal protocol.

pub mod listener;
pub mod session;

pub use listener::{Server, ServerConfig, SessionConfig};
