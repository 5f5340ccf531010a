//! Extraction service request and response types.
//!
//! # Wire Format
//!
//! Request:
//! ```json
//! {
//!     "url": "https://hosting.example.com/artist/track",
//!     "audioFormat": "best",
//!     "downloadMode": "audio",
//!     "disableMetadata": false
//! }
//! ```
//!
//! Success response (`status` is `tunnel` or `redirect`):
//! ```json
//! {
//!     "status": "tunnel",
//!     "url": "https://extract.example.net/tunnel?id=...",
//!     "filename": "track.mp3",
//!     "title": "Track",
//!     "artist": "Artist",
//!     "duration": 184.2,
//!     "thumbnail": "https://...",
//!     "fileMetadata": { "title": "Track", "artist": "Artist" }
//! }
//! ```
//!
//! Error response, sent with either a 2xx or a 4xx status:
//! ```json
//! {
//!     "status": "error",
//!     "error": { "code": "error.api.fetch.fail", "context": { ... } }
//! }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, NoneAsEmptyString};
use url::Url;
use veil::Redact;

/// Extraction request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub url: Url,
    pub audio_format: AudioFormat,
    pub download_mode: DownloadMode,
    pub disable_metadata: bool,
}

impl Request {
    /// Audio-only, best quality, with metadata.
    #[must_use]
    pub fn audio(url: Url) -> Self {
        Self {
            url,
            audio_format: AudioFormat::Best,
            download_mode: DownloadMode::Audio,
            disable_metadata: false,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Best,
    Mp3,
    Ogg,
    Wav,
    Opus,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    Auto,
    #[default]
    Audio,
    Mute,
}

/// Extraction response, discriminated by its `status` field.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Response {
    /// Proxied stream served by the extraction service itself.
    Tunnel(Media),

    /// Direct link to the hosting platform's media.
    Redirect(Media),

    Error { error: UpstreamError },

    /// Statuses that carry no single playable URL, like pickers.
    #[serde(other)]
    Unsupported,
}

/// Playable media and its metadata.
///
/// Artwork has several alternate names upstream; precedence is resolved
/// once when normalizing, not here.
#[serde_as]
#[derive(Clone, PartialEq, Deserialize, Redact)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    #[redact]
    pub url: Url,

    #[serde(default)]
    #[serde_as(as = "NoneAsEmptyString")]
    pub filename: Option<String>,

    #[serde(default)]
    #[serde_as(as = "NoneAsEmptyString")]
    pub title: Option<String>,

    #[serde(default)]
    #[serde_as(as = "NoneAsEmptyString")]
    pub artist: Option<String>,

    #[serde(default)]
    #[serde_as(as = "NoneAsEmptyString")]
    pub author: Option<String>,

    #[serde(default)]
    #[serde_as(as = "NoneAsEmptyString")]
    pub artwork: Option<String>,

    #[serde(default)]
    #[serde_as(as = "NoneAsEmptyString")]
    pub picture: Option<String>,

    #[serde(default)]
    #[serde_as(as = "NoneAsEmptyString")]
    pub thumbnail: Option<String>,

    #[serde(default)]
    #[serde_as(as = "NoneAsEmptyString")]
    pub cover: Option<String>,

    /// Seconds, possibly fractional.
    #[serde(default)]
    pub duration: Option<f64>,

    #[serde(default)]
    pub file_metadata: Option<FileMetadata>,
}

/// Tags the extraction service would embed into a downloaded file.
#[serde_as]
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct FileMetadata {
    #[serde(default)]
    #[serde_as(as = "NoneAsEmptyString")]
    pub title: Option<String>,

    #[serde(default)]
    #[serde_as(as = "NoneAsEmptyString")]
    pub artist: Option<String>,

    #[serde(default)]
    #[serde_as(as = "NoneAsEmptyString")]
    pub author: Option<String>,

    #[serde(default)]
    #[serde_as(as = "NoneAsEmptyString")]
    pub album: Option<String>,
}

/// Error reported by the extraction service.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct UpstreamError {
    pub code: String,

    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.context {
            Some(context) => write!(f, "{} ({context})", self.code),
            None => write!(f, "{}", self.code),
        }
    }
}
