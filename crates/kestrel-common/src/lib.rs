//! KestrelDB common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all KestrelDB storage crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::{MergePolicyConfig, SchedulerPolicy, StorageConfig};
pub use error::{KestrelError, Result};
pub use types::{LENGTH_PREFIX_SIZE, TypeId, TypeTrait};
