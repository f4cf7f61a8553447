//! Application layer use cases for the Edge Link client.
//!
//! The application layer sits between the domain types in `edge-core` and the
//! infrastructure (sockets, files).  Everything here depends on traits rather
//! than concrete implementations:
//!
//! - [`transport`] declares the seams to the secure-tunnel SDK.
//! - [`persistence`] declares the snapshot store behind the durable stores.
//!
//! # Sub-modules
//!
//! - **`device_registry`** – Durable record of paired devices, keyed by
//!   `(productId, deviceId)`, with write-or-nothing inserts.
//!
//! - **`bookmarks`** – User-curated shortcuts into the registry with their own
//!   lifecycle and an explicit `release`.
//!
//! - **`credentials`** – The client's private key.  Resetting it force-closes
//!   every session.
//!
//! - **`pair_device`** – The pairing engine: handshake, then registry write.
//!
//! - **`session_manager`** – Shared, reference-counted connections; the only
//!   place transport sessions are opened.  Runs on every `connect` and is the
//!   most concurrency-sensitive code in the crate.
//!
//! - **`device_overview`** – Read model merging registry, bookmarks, discovery
//!   and session state for display.

pub mod bookmarks;
pub mod credentials;
pub mod device_overview;
pub mod device_registry;
pub mod pair_device;
pub mod persistence;
pub mod session_manager;
pub mod transport;
