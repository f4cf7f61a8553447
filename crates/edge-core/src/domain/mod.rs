//! Domain entities for Edge Link.
//!
//! Pure data with no I/O: device identity, the records built around it, and
//! the route strings that carry pairing bootstrap parameters between screens.
//! Everything here compiles and tests without a runtime or a network.

/// Device identity, discovery results, paired records, and bookmarks.
pub mod device;

/// Pairing and device-page route strings.
pub mod route;
