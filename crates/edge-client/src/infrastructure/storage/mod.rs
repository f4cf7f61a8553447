//! Storage infrastructure: configuration and snapshot files.
//!
//! - **`config`** reads and writes the TOML configuration file from the
//!   platform-appropriate directory and supplies defaults on first run.
//! - **`toml_file`** implements the application's `SnapshotStore` port with
//!   one TOML file per store, written atomically.

pub mod config;
pub mod toml_file;
