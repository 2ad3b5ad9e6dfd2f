//! System utilities
//!
//! Runtime backend detection and memory probing.

pub mod gpu;
pub mod resources;
