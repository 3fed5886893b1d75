//! Shared error and value primitives for Basalt crates.
//!
//! Architecture role:
//! - provides the common [`BasaltError`] / [`Result`] contracts
//! - defines the [`ScalarValue`] constant representation shared by the
//!   relational plan IR and the native query IR
//!
//! Key modules:
//! - [`error`]
//! - [`value`]

pub mod error;
pub mod value;

pub use error::{BasaltError, Result};
pub use value::ScalarValue;
