//! Common utilities and types shared across azkeep crates.
//!
//! This module provides the error taxonomy and the table data model used by
//! the storage layer and its callers.

pub mod entity;
pub mod error;

pub use entity::{EdmValue, Entity};
pub use error::{Error, Result};
