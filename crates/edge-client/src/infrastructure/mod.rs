//! Infrastructure layer for the client.
//!
//! Contains the adapters that touch the outside world: UDP discovery, the
//! reference TCP transport, TOML files, and the wiring that puts them
//! together with the application layer.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `edge_core`, but MUST NOT be imported by the `application` or domain
//! layers.

pub mod app_state;
pub mod network;
pub mod storage;
pub mod transport;
