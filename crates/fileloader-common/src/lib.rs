//! Fileloader Common Library
//!
//! Shared functionality used across the fileloader workspace members:
//!
//! - **Error Handling**: the `LoadError` taxonomy every pipeline phase
//!   reports through, with its notification routing (`ErrorKind`)
//! - **Logging**: tracing subscriber initialization driven by environment
//!   variables

pub mod error;
pub mod logging;

pub use error::{ErrorKind, LoadError, Result};
