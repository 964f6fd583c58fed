//! fmd-common - Shared types and utilities
//!
//! This crate provides the identifiers, layout-id decoding, checksum-type
//! table, error definitions and configuration used across the replica
//! metadata engine.

pub mod checksum;
pub mod config;
pub mod error;
pub mod layout;
pub mod types;

pub use checksum::ChecksumType;
pub use config::FmdConfig;
pub use error::{Error, Result};
pub use layout::{LayoutErrors, LayoutFlag, LayoutId, LayoutType};
pub use types::*;
