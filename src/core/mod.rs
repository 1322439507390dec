//! Core infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`error`] - Error types and gRPC status mapping

pub mod config;
pub mod error;
