//! Core types and traits for the clashgate workspace.
//!
//! This crate defines the shared abstractions used across all layers of the
//! proxy: the error type, the bearer [`Credential`], and the
//! [`CredentialSource`] seam that feeds the key pool.

pub mod credential;
pub mod error;
pub mod traits;

pub use credential::Credential;
pub use error::{GatewayError, Result};
pub use traits::{CredentialSource, StaticSource};
