//! Re-resolution of tracks.
//!
//! [`Refresh`] answers "what URL should I play for this track right now".
//! It has two implementations:
//!
//! * [`Refresher`] runs in-process next to the track store: it re-resolves
//!   the durable source URL, corrects the stored duration along the way, and
//!   degrades to the last known URL when extraction fails.
//! * [`RemoteRefresher`] asks a refresh endpoint served by
//!   [`server`](crate::server) over HTTP.
//!
//! Only unknown tracks are errors. Everything else yields some URL, possibly
//! marked as `stale`.
//!
//! [`import`] is the other entry point into the resolution pipeline: it
//! turns a freshly submitted source link into a new track.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{
    header::{HeaderValue, CACHE_CONTROL, PRAGMA},
    StatusCode,
};
use url::Url;
use veil::Redact;

use crate::{
    config::Config,
    error::{Error, Result},
    extractor::Extract,
    http,
    protocol::{self, refresh},
    store::TrackStore,
    track::{Track, TrackId},
};

/// URL to play for a track.
#[derive(Clone, PartialEq, Eq, Redact)]
pub struct Refreshed {
    #[redact]
    pub url: Url,

    /// Set when `url` is the last known URL because re-resolution failed.
    pub stale: bool,
}

impl From<refresh::Response> for Refreshed {
    fn from(response: refresh::Response) -> Self {
        Self {
            url: response.url,
            stale: response.stale,
        }
    }
}

impl From<Refreshed> for refresh::Response {
    fn from(refreshed: Refreshed) -> Self {
        Self {
            url: refreshed.url,
            stale: refreshed.stale,
        }
    }
}

/// Anything that can produce a playable URL for a track.
#[async_trait]
pub trait Refresh: Send + Sync {
    /// # Errors
    ///
    /// Returns `NotFound` for unknown tracks. Remote implementations also
    /// return transport errors.
    async fn refresh(&self, id: &TrackId) -> Result<Refreshed>;
}

/// In-process refresh against a track store.
#[derive(Clone)]
pub struct Refresher {
    extractor: Arc<dyn Extract>,
    store: Arc<dyn TrackStore>,
}

impl Refresher {
    pub fn new(extractor: Arc<dyn Extract>, store: Arc<dyn TrackStore>) -> Self {
        Self { extractor, store }
    }

    /// Corrects the stored duration in the background if extraction reported
    /// a different one. The refresh does not wait for the write, and a
    /// failed write is only logged.
    fn correct_duration(&self, track: &Track, duration: Option<u32>) {
        let Some(duration) = duration else {
            return;
        };
        if track.cached_duration == Some(duration) {
            return;
        }

        debug!(
            "correcting duration of {} from {:?} to {duration}s",
            track.id, track.cached_duration
        );
        let store = Arc::clone(&self.store);
        let id = track.id.clone();
        tokio::spawn(async move {
            if let Err(e) = store.update_duration(&id, duration).await {
                warn!("failed to update duration of {id}: {e}");
            }
        });
    }
}

#[async_trait]
impl Refresh for Refresher {
    async fn refresh(&self, id: &TrackId) -> Result<Refreshed> {
        let track = self
            .store
            .track(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("track {id} not found")))?;

        // Legacy tracks only ever had a direct URL.
        let Some(source_url) = &track.source_url else {
            trace!("{id} has no source url, serving stream url");
            return Ok(Refreshed {
                url: track.stream_url,
                stale: false,
            });
        };

        match self.extractor.resolve(source_url).await {
            Ok(extracted) => {
                self.correct_duration(&track, extracted.duration);
                Ok(Refreshed {
                    url: extracted.url,
                    stale: false,
                })
            }
            Err(e) => {
                warn!("failed to re-resolve {id}, serving last known url: {e}");
                Ok(Refreshed {
                    url: track.stream_url,
                    stale: true,
                })
            }
        }
    }
}

/// Refresh client for a remote refresh endpoint.
pub struct RemoteRefresher {
    client: http::Client,
    base_url: Url,
}

impl RemoteRefresher {
    /// Headroom on top of the endpoint's own extraction ceiling, so the
    /// endpoint gets to answer with a stale URL before we give up.
    const TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

    /// Creates a client for the endpoint at `config.refresh_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: &Config) -> Result<Self> {
        let timeout = config.extraction_timeout + Self::TIMEOUT_MARGIN;
        Ok(Self {
            client: http::Client::new(config, timeout)?,
            base_url: config.refresh_url.clone(),
        })
    }

    fn url(&self, id: &TrackId) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::invalid_argument(format!("{} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(["api", "track", id.as_str(), "refresh"]);
        Ok(url)
    }
}

#[async_trait]
impl Refresh for RemoteRefresher {
    async fn refresh(&self, id: &TrackId) -> Result<Refreshed> {
        let request = self
            .client
            .get(self.url(id)?)
            // A cached answer would defeat the purpose.
            .header(
                CACHE_CONTROL,
                HeaderValue::from_static("no-cache, no-store, must-revalidate"),
            )
            .header(PRAGMA, HeaderValue::from_static("no-cache"));

        let response = self.client.execute(request).await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            let response = protocol::json::<refresh::Response>(&body, "refresh")?;
            if response.stale {
                debug!("refresh endpoint served a stale url for {id}");
            }
            return Ok(response.into());
        }

        let message = serde_json::from_str::<refresh::ErrorBody>(&body)
            .map_or_else(|_| status.to_string(), |body| body.error);
        match status {
            StatusCode::NOT_FOUND => Err(Error::not_found(format!("{id}: {message}"))),
            _ => Err(Error::unavailable(format!(
                "refresh endpoint answered {status}: {message}"
            ))),
        }
    }
}

/// Resolves a submitted source link once and adds it to `store` as a new
/// track.
///
/// # Errors
///
/// Returns `Unavailable` with the normalized extraction error if the link
/// cannot be resolved, or an error if the track cannot be stored.
pub async fn import(
    extractor: &dyn Extract,
    store: &dyn TrackStore,
    source_url: Url,
) -> Result<Track> {
    let extracted = extractor
        .resolve(&source_url)
        .await
        .map_err(Error::unavailable)?;

    let track = Track {
        id: TrackId::random(),
        title: extracted.title_or_default(),
        artist: Some(extracted.artist_or_default()),
        artwork: extracted.artwork,
        source_url: Some(source_url),
        stream_url: extracted.url,
        cached_duration: extracted.duration,
    };
    store.insert(track.clone()).await?;

    Ok(track)
}
