//! Client for the Salla admin REST API.
//!
//! Only the paginated listing endpoints are used: the mirror reads, it never
//! writes back to the platform.

mod client;
mod error;
mod listing;
mod types;

pub use client::{SallaApiClient, DEFAULT_TIMEOUT_SECS};
pub use error::{ApiRetryClass, Result, SallaApiError};
pub use listing::SallaListingSource;
pub use types::*;
