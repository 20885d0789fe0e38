//! CNPJ Pipeline Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities and error handling for the CNPJ pipeline workspace.
//!
//! # Overview
//!
//! This crate provides functionality used across all workspace members:
//!
//! - **Error Handling**: the shared error and result types
//! - **Checksums**: file integrity verification utilities
//! - **Logging**: tracing configuration and initialization

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
