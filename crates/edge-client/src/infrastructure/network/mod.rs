//! Network infrastructure for the client.
//!
//! # Sub-modules
//!
//! - **`discovery`** – Runs a [`DeviceScanner`](discovery::DeviceScanner) in
//!   the background, deduplicates what it hears, ages out silent devices, and
//!   publishes complete snapshots on a `watch` channel.
//!
//! - **`announce`** – The UDP scanner: listens for JSON announcement
//!   datagrams on the discovery port.  This is how devices are found without
//!   manual IP configuration.
//!
//! - **`fixed`** – A scanner fed by the caller, for tests and offline runs.

pub mod announce;
pub mod discovery;
pub mod fixed;
