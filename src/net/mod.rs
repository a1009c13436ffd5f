//! Network front: bound listener, TLS material, connection relay.

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::Connection;
pub use listener::{run_accept_loop, Listener};
