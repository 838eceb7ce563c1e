//! # signbridge-core
//!
//! Pure logic for signbridge (no I/O, instant tests).
//!
//! This crate implements the state machines, tables and algorithms of the
//! bridge without any channel, network or disk I/O.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure**: they take input and produce
//! output without side effects. Timestamps are passed in by the caller, so
//! retry and timeout decisions are deterministic in tests.
//!
//! The actual I/O is performed by `signbridge-relay` and `signbridge-host`,
//! which interpret the decisions made here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod blocklist;
pub mod correlator;
pub mod credit;
pub mod listing;
pub mod queue;
pub mod roster;
pub mod state;

pub use batch::{rounds, DEFAULT_BATCH_CHUNK};
pub use blocklist::{BlockList, Restriction};
pub use correlator::{CorrelationError, Correlator};
pub use credit::CreditLedger;
pub use listing::{index_by_thumbprint, thumbprint_of, ListingMerge};
pub use queue::{PendingQueue, PendingRequest, QueueError, RetryPolicy, Verdict};
pub use roster::{plan as plan_roster, RosterPlan};
pub use state::{Action, ConnectMode, Event, RelayEvent, RelayState};
