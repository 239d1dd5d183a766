//! # taskhub-core
//!
//! Core crate for TaskHub. Contains the job and task model, the broker and
//! queue-store traits, configuration schemas, worker events, and the unified
//! error system.
//!
//! This crate has **no** internal dependencies on other TaskHub crates.

pub mod config;
pub mod error;
pub mod events;
pub mod result;
pub mod traits;
pub mod types;

pub use error::AppError;
pub use result::AppResult;
