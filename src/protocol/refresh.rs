//! Refresh endpoint response types.
//!
//! # Wire Format
//!
//! `GET /api/track/{id}/refresh`:
//! ```json
//! { "url": "https://extract.example.net/tunnel?id=...", "stale": true }
//! ```
//!
//! `stale` is omitted when `false`. Failures carry an error message:
//! ```json
//! { "error": "Track not found" }
//! ```

use serde::{Deserialize, Serialize};
use url::Url;
use veil::Redact;

/// Successful refresh.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Redact)]
pub struct Response {
    #[redact]
    pub url: Url,

    /// Whether the URL is the last known one because re-resolution failed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stale: bool,
}

/// Failed refresh.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
