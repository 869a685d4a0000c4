//! Client-facing networking: listeners, acceptors, and connections.

pub mod acceptor;
pub mod connection;

pub use acceptor::{Acceptor, Listeners};
