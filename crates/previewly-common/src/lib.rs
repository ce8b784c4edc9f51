//! Previewly-Common: Shared types, IDs, and errors.
//!
//! - **Typed IDs**: [`SessionId`], a UUID wrapper used in URLs and JSON
//! - **Core Types**: session lifecycle states, index and byte ranges
//! - **Error Handling**: the [`Error`] taxonomy and [`Result`] alias
//!
//! # Examples
//!
//! ```
//! use previewly_common::{Error, IndexRange, Result, SessionId};
//!
//! let id = SessionId::new();
//! let window = IndexRange::new(6, 10);
//! assert!(window.contains(7));
//!
//! fn seek(target: u64, window: IndexRange) -> Result<u64> {
//!     if window.contains(target) {
//!         Ok(target)
//!     } else {
//!         Err(Error::SeekOutOfWindow { target, window: Some(window) })
//!     }
//! }
//! assert!(seek(4, window).is_err());
//! # let _ = id;
//! ```

pub mod error;
pub mod ids;
pub mod types;

pub use error::{Error, Result};
pub use ids::*;
pub use types::*;
