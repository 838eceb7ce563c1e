//! # signbridge-types
//!
//! Wire format types for the signbridge signing bridge.
//!
//! This crate provides the foundational types used across all signbridge crates:
//! - [`RequestId`], [`ClientId`], [`SessionId`], [`Thumbprint`], [`Domain`] - Identity types
//! - [`AgentRequest`] / [`AgentResponse`] - Local-agent protocol
//! - [`RelayEnvelope`] - Relay wire wrapper
//! - [`DeviceRecord`] - Paired device state
//! - [`BridgeError`] / [`ExceptionModel`] - Error taxonomy and reply shape

#![warn(missing_docs)]
#![warn(clippy::all)]

mod agent;
mod device;
mod envelope;
mod error;
mod ids;

pub use agent::{
    AgentRequest, AgentResponse, AuthorizationRequest, AuthorizationResponse, CertificateSummary,
    ClientReply, ClientRequest,
};
pub use device::{DeviceRecord, ResyncLevel};
pub use envelope::{EnvelopeKind, RelayEnvelope, ENVELOPE_FORMAT};
pub use error::{BridgeError, ExceptionModel, BRIDGE_ORIGIN};
pub use ids::{ClientId, Domain, RequestId, SessionId, Thumbprint, LOCALHOST_DOMAIN, POPUP_DOMAIN};
