//! Tracks as references to a third-party hosting platform.
//!
//! A [`Track`] never owns audio. It holds a durable `source_url` on the
//! hosting platform and the last known playable `stream_url`, which is
//! usually a short-lived tunnel. Only the resolution pipeline changes
//! `stream_url` and `cached_duration`.

use std::{fmt, str::FromStr, sync::OnceLock};

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use url::Url;
use veil::Redact;

use crate::error::Error;

/// Opaque, stable track identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TrackId(String);

impl TrackId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generates a fresh random identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl FromStr for TrackId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s.trim();
        // Identifiers end up in URL paths of the refresh endpoint.
        if id.is_empty() || id.contains(['/', '?', '#']) || id.chars().any(char::is_whitespace) {
            return Err(Error::invalid_argument(format!("invalid track id \"{s}\"")));
        }

        Ok(Self(id.to_owned()))
    }
}

impl TryFrom<String> for TrackId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TrackId> for String {
    fn from(id: TrackId) -> Self {
        id.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A track as persisted in the library.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Redact)]
pub struct Track {
    pub id: TrackId,

    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork: Option<Url>,

    /// Durable reference on the hosting platform. Legacy tracks have none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<Url>,

    /// Last known playable URL, possibly an expired tunnel.
    #[redact]
    pub stream_url: Url,

    /// Duration in whole seconds, corrected from extraction metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_duration: Option<u32>,
}

impl Track {
    /// Title without a trailing audio file extension, as upstream filenames
    /// often end up as titles.
    #[must_use]
    pub fn display_title(&self) -> &str {
        clean_title(&self.title)
    }
}

/// Strips a trailing `.mp3`, `.wav`, `.ogg`, `.flac`, `.m4a` or `.opus`.
#[must_use]
pub fn clean_title(title: &str) -> &str {
    static EXTENSION: OnceLock<Regex> = OnceLock::new();
    let extension = EXTENSION.get_or_init(|| {
        Regex::new(r"(?i)\.(mp3|wav|ogg|flac|m4a|opus)$").expect("invalid extension pattern")
    });

    match extension.find(title) {
        Some(m) => &title[..m.start()],
        None => title,
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.artist {
            Some(artist) => write!(f, "{}: \"{} - {}\"", self.id, artist, self.display_title()),
            None => write!(f, "{}: \"{}\"", self.id, self.display_title()),
        }
    }
}
