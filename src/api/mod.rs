//! API Module
//!
//! REST surface of the controller: mutation endpoints, admin operations
//! and diagnostics.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
