//! Beach Relay forwards opaque RPC frames between WebSocket peers.
//!
//! Peers hold a socket on `/ws?peerId=...`. A binary frame on that socket is a
//! call addressed to another peer; a text frame is a reply to a call the peer
//! received. The relay picks one live connection of the target, writes the
//! request to it, and hands the matching reply back to the caller. Callers
//! without a socket use `POST /call`.

pub mod cli;
pub mod client_ip;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod frame;
pub mod policy;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod telemetry;

pub use config::RelayConfig;
pub use error::RelayError;
pub use frame::{CallRequest, CallResponse, CallStatus};
pub use router::Relay;
pub use server::{build_router, serve, serve_on, AppState};
