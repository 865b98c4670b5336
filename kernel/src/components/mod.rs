//! Kernel components
//!
//! Devices the kernel drives itself, selected at compile time through
//! cargo features (see `config.rs`):
//! - **console**: polled output for logging and panics

pub mod console;
