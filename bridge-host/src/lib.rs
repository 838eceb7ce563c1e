//! # signbridge-host
//!
//! Bridge between web callers and the local signing agent.
//!
//! This crate implements the host that:
//! - Tracks one session per caller, keyed by the caller's domain
//! - Opens agent channels per session or shares one per domain
//! - Correlates concurrent agent responses by request id
//! - Gates signing behind preauthorization, remembered trust or a prompt
//! - Forwards commands to paired devices that hold the certificate
//!
//! ## Architecture
//!
//! ```text
//! caller ──┐                                   ┌── local agent (stdio)
//!          │  frontend (JSON lines)            │
//!          ├──────────────►┌────────────────┐──┤
//! caller ──┘               │  BridgeHost    │  └── paired device (relay)
//!                          │  router / gate │
//!                          │  pool / stores │
//!                          └────────────────┘
//! ```
//!
//! ## Agent protocol
//!
//! Messages to the agent are JSON objects framed with a 4-byte
//! little-endian length. Each carries a `requestId`; the agent echoes it
//! in `{requestId, success, response | exception}`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agent;
pub mod authorization;
pub mod blocklist;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frontend;
pub mod pool;
pub mod router;
pub mod server;
pub mod session;
pub mod store;

pub use config::Config;
pub use error::{HostError, Result};
pub use server::BridgeHost;
