//! Self-healing of expired tunnels.
//!
//! Tunnels die silently. The only sign is that the decoder refuses the
//! source, which surfaces as [`MediaErrorCode::SourceNotSupported`]. Such a
//! failure earns exactly one recovery attempt per track and episode: the
//! [`Healer`] marks the track before the attempt and only a fresh, explicit
//! play clears the mark again.
//!
//! Mapping decode failures to "expired" is a heuristic and lives in
//! [`classify`] alone.

use std::{collections::HashSet, fmt};

use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::track::TrackId;

/// Media error codes, numbered like the HTML media element's.
#[derive(Copy, Clone, Debug, Hash, Serialize_repr, Deserialize_repr, PartialEq, Eq)]
#[repr(u8)]
pub enum MediaErrorCode {
    /// Fetching was aborted on request.
    Aborted = 1,

    /// The network failed while fetching.
    Network = 2,

    /// The source was fetched but could not be decoded.
    Decode = 3,

    /// The source is not usable at all, which is what an expired tunnel
    /// looks like.
    SourceNotSupported = 4,
}

impl fmt::Display for MediaErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Aborted => write!(f, "aborted"),
            Self::Network => write!(f, "network error"),
            Self::Decode => write!(f, "decode error"),
            Self::SourceNotSupported => write!(f, "source not supported"),
        }
    }
}

/// What a decode failure means.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Diagnosis {
    /// The URL most likely expired; re-resolving may help.
    Expired,

    /// Re-resolving would not help.
    Fatal,
}

#[must_use]
pub fn classify(code: MediaErrorCode) -> Diagnosis {
    match code {
        MediaErrorCode::SourceNotSupported => Diagnosis::Expired,
        MediaErrorCode::Aborted | MediaErrorCode::Network | MediaErrorCode::Decode => {
            Diagnosis::Fatal
        }
    }
}

/// What to do about a decode failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Decision {
    /// Invalidate, re-resolve and re-attach.
    Recover,

    /// Stay errored.
    GiveUp,
}

/// Tracks which tracks already had their recovery attempt this episode.
#[derive(Clone, Debug, Default)]
pub struct Healer {
    failed_once: HashSet<TrackId>,
}

impl Healer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decides on a decode failure of `id`. Deciding to recover marks the
    /// track, so the next failure in this episode gives up.
    pub fn decide(&mut self, id: &TrackId, code: MediaErrorCode) -> Decision {
        match classify(code) {
            Diagnosis::Fatal => {
                debug!("{id}: {code} is not recoverable");
                Decision::GiveUp
            }
            Diagnosis::Expired if self.try_begin(id) => {
                info!("{id}: stream url likely expired, re-resolving once");
                Decision::Recover
            }
            Diagnosis::Expired => {
                warn!("{id}: stream url failed again after recovery, giving up");
                Decision::GiveUp
            }
        }
    }

    /// Marks `id` and returns whether it was unmarked before.
    fn try_begin(&mut self, id: &TrackId) -> bool {
        self.failed_once.insert(id.clone())
    }

    /// Uses up the recovery attempt of `id` without making one.
    pub fn mark(&mut self, id: &TrackId) {
        self.failed_once.insert(id.clone());
    }

    /// Starts a new episode for `id`.
    pub fn clear(&mut self, id: &TrackId) {
        self.failed_once.remove(id);
    }
}
