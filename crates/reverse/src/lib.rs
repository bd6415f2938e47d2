//! Reverse broker tunnel client.
//!
//! Maintains a single outbound TLS connection to a broker and multiplexes
//! request/response frames over it, so a remote broker can push requests
//! into agents behind NAT or firewalls. The crate is transport only: it
//! hands request descriptors to the embedding application over a channel
//! and writes the application's responses back as framed chunks, with no
//! back-reference into the HTTP layer.

pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod state;

pub use backoff::Backoff;
pub use config::Config;
pub use connection::{TunnelKernel, TunnelRequest};
pub use error::TunnelError;
pub use frame::{Command, Frame};
pub use state::TunnelState;
