//! Utility functions for the demos
//!
//! Host-side device configuration and address parsing.

pub mod network;

pub use network::*;
