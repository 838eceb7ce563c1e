//! # signbridge-relay
//!
//! Encrypted relay sessions to paired signing devices.
//!
//! A paired phone or tablet holding certificates is reached through a cloud
//! relay. Every session carries one request at a time; the relay confirms
//! delivery with a receipt and the device answers with an encrypted response.
//!
//! ## Features
//!
//! - **Pairing**: secp256k1 ECDH, SHA-256 of the shared secret as the key
//! - **Envelope encryption**: AES-256-CBC, HMAC-SHA-256 over the ciphertext
//! - **Single-flight queue**: retries until receipted, then waits for the response
//! - **Transport Abstraction**: Pluggable relay transport (hub socket and mock)
//! - **Pure State Machine**: Uses signbridge-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use signbridge_relay::{DeviceSyncConfig, DeviceSyncManager};
//!
//! let manager = DeviceSyncManager::new(DeviceSyncConfig::default(), store, transports);
//! let ticket = manager.start_pairing().await?;
//! manager.await_pending_device(&ticket.session_id, true).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod crypto;
pub mod devices;
pub mod transport;

pub use client::{RelayClient, RelayClientConfig, RelayError};
pub use crypto::{CryptoError, EphemeralKeyPair, SymmetricKey, IV_SIZE, KEY_SIZE, MAC_SIZE};
pub use devices::{
    DeviceError, DeviceStore, DeviceSyncConfig, DeviceSyncManager, PairingTicket, SyncProgress,
};
pub use transport::{
    HubRelayTransport, HubTransportConfig, HubTransportFactory, MockRelayTransport,
    MockTransportFactory, PostOutcome, RelayTransport, Responder, SessionTicket, TransportError,
    TransportEvent, TransportFactory,
};
