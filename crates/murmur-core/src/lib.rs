//! # murmur-core
//!
//! Core types, catalog model, and error handling for the Murmur soundscape mixer.

pub mod error;
pub mod types;

pub use error::{Error, HttpError, Result};
pub use types::*;
