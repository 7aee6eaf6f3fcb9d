//! Powerplant
//!
//! A WebSocket proof-of-work mining service for Nostr events:
//! - Clients send an event template and a target difficulty
//! - The server searches for a nonce tag that gives the event id enough
//!   leading zero bits (NIP-13)
//! - One job per connection; a new request supersedes the running one

pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod types;
pub mod utils;
pub mod worker;

pub use config::{Args, Config};
pub use coordinator::{MiningCoordinator, PowLimits};
pub use error::{Error, Result};
pub use protocol::Response;
pub use server::MiningServer;
pub use types::*;

/// Application information
pub const APP_NAME: &str = "powerplant";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
