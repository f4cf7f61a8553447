//! Transport adapters implementing the application's transport seams.
//!
//! # Sub-modules
//!
//! - **`tcp`** – Reference transport speaking JSON lines over TCP.  Used by
//!   the `edge-link` binary to talk to a device simulator on a trusted LAN.
//!
//! - **`mock`** – Scripted in-memory device fleet.  Used by the integration
//!   tests; keeps counters so tests can check how many sessions were opened.

pub mod mock;
pub mod tcp;
