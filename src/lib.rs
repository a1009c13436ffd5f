//! flagwall: a TLS-capable intercepting TCP proxy that relays
//! client/backend traffic, scrubs flag-shaped secrets from responses,
//! tracks compromised sessions, and records the decrypted exchange as
//! synthetic pcap traces.

pub mod capture;
pub mod config;
pub mod console;
pub mod error;
pub mod filter;
pub mod history;
pub mod http;
pub mod net;
pub mod state;

pub use config::Config;
pub use error::{ProxyError, Result};
pub use filter::{FilterContext, SessionCache};
pub use state::AppState;
