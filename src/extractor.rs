//! Extraction client.
//!
//! Turns a durable source URL into a currently playable tunnel URL by asking
//! the extraction service, and normalizes the service's many response shapes
//! into one [`Resolution`]:
//!
//! * `Ok(`[`Extracted`]`)` with the URL and whatever metadata was offered
//! * `Err(`[`ExtractionError`]`)` tagged with a stable [`ErrorCode`], so
//!   callers branch on codes and never on prose
//!
//! The client never retries and never writes to a store. Retry policy belongs
//! to its callers: the refresh endpoint falls back to the last known URL and
//! the self-healing controller makes at most one attempt per episode.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;
use veil::Redact;

use crate::{
    config::Config,
    error::{ErrorKind, Result},
    http,
    protocol::{
        self,
        extraction::{Media, Request, Response, UpstreamError},
    },
};

/// Outcome of one extraction call.
pub type Resolution = std::result::Result<Extracted, ExtractionError>;

/// Normalized successful extraction.
#[derive(Clone, PartialEq, Eq, Redact)]
pub struct Extracted {
    #[redact]
    pub url: Url,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub artwork: Option<Url>,
    pub filename: Option<String>,

    /// Whole seconds.
    pub duration: Option<u32>,
}

impl Extracted {
    /// Title for a new track: the title, else the filename.
    #[must_use]
    pub fn title_or_default(&self) -> String {
        self.title
            .clone()
            .or_else(|| self.filename.clone())
            .unwrap_or_else(|| String::from("Untitled Track"))
    }

    #[must_use]
    pub fn artist_or_default(&self) -> String {
        self.artist
            .clone()
            .unwrap_or_else(|| String::from("Unknown Artist"))
    }
}

impl From<Media> for Extracted {
    /// Resolves overlapping upstream fields with a fixed precedence:
    /// * title: `title`, `fileMetadata.title`
    /// * artist: `artist`, `fileMetadata.artist`, `author`, `fileMetadata.author`
    /// * artwork: `artwork`, `picture`, `thumbnail`, `cover` (first valid URL)
    fn from(media: Media) -> Self {
        let metadata = media.file_metadata.unwrap_or_default();

        let title = media.title.or(metadata.title);
        let artist = media
            .artist
            .or(metadata.artist)
            .or(media.author)
            .or(metadata.author);
        let artwork = [media.artwork, media.picture, media.thumbnail, media.cover]
            .into_iter()
            .flatten()
            .find_map(|candidate| Url::parse(&candidate).ok());

        Self {
            url: media.url,
            title,
            artist,
            artwork,
            filename: media.filename,
            duration: media.duration.and_then(whole_seconds),
        }
    }
}

/// Truncates a duration in seconds, dropping values that cannot be one.
#[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn whole_seconds(seconds: f64) -> Option<u32> {
    if seconds.is_finite() && seconds >= 0.0 && seconds <= f64::from(u32::MAX) {
        Some(seconds.floor() as u32)
    } else {
        None
    }
}

/// Stable classification of extraction failures.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The service could not be reached.
    Connection,

    /// The service did not answer within the client's ceiling.
    Timeout,

    /// The answer was not a response we understand.
    MalformedResponse,

    /// The service is up but cannot reach its processing workers.
    ProcessingUnavailable,

    /// A non-success HTTP status without an error body.
    HttpStatus(u16),

    /// An error code reported by the service itself.
    Upstream(String),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection_refused"),
            Self::Timeout => write!(f, "timeout"),
            Self::MalformedResponse => write!(f, "malformed_response"),
            Self::ProcessingUnavailable => write!(f, "processing_instance_unavailable"),
            Self::HttpStatus(status) => write!(f, "http_status.{status}"),
            Self::Upstream(code) => write!(f, "{code}"),
        }
    }
}

/// Failed extraction.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("extraction failed with {code}: {detail}")]
pub struct ExtractionError {
    pub code: ErrorCode,
    pub detail: String,
}

impl ExtractionError {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

impl From<UpstreamError> for ExtractionError {
    fn from(error: UpstreamError) -> Self {
        let detail = error.to_string();

        // Some deployments lose their processing workers and report it under
        // different codes, or only in the context message.
        let processing = error.code.contains("processing")
            || error
                .context
                .as_ref()
                .is_some_and(|context| context.to_string().contains("processing instance"));

        let code = if processing {
            ErrorCode::ProcessingUnavailable
        } else {
            ErrorCode::Upstream(error.code)
        };

        Self { code, detail }
    }
}

impl From<crate::error::Error> for ExtractionError {
    /// Transport failures: timeouts are reported as such, anything else
    /// means the service could not be talked to.
    fn from(e: crate::error::Error) -> Self {
        let code = match e.kind {
            ErrorKind::DeadlineExceeded => ErrorCode::Timeout,
            _ => ErrorCode::Connection,
        };
        Self::new(code, e.to_string())
    }
}

/// Anything that can resolve a source URL.
#[async_trait]
pub trait Extract: Send + Sync {
    /// Resolves `source_url` into a playable URL. Never retries.
    async fn resolve(&self, source_url: &Url) -> Resolution;
}

/// Extraction service client over HTTP.
pub struct Extractor {
    client: http::Client,
    endpoint: Url,
}

impl Extractor {
    /// Creates a client for the service at `config.extraction_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: &Config) -> Result<Self> {
        let client = http::Client::new(config, config.extraction_timeout)?;

        // The service answers on its root path; make sure joins do not drop
        // a path prefix of the configured endpoint.
        let mut endpoint = config.extraction_url.clone();
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        debug!("extraction endpoint: {endpoint}");

        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl Extract for Extractor {
    async fn resolve(&self, source_url: &Url) -> Resolution {
        debug!("resolving {source_url}");

        let request = self
            .client
            .post_json(self.endpoint.clone(), &Request::audio(source_url.clone()));
        let response = self.client.execute(request).await.map_err(|e| {
            warn!("extraction service unreachable: {e}");
            ExtractionError::from(e)
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExtractionError::from(crate::error::Error::from(e)))?;

        // Error bodies come with 2xx and 4xx statuses alike. Server errors
        // are parsed opportunistically, as gateways in front of the service
        // answer those with HTML.
        let parsed = if status.is_server_error() {
            serde_json::from_str::<Response>(&body).map_err(|_| {
                ExtractionError::new(
                    ErrorCode::HttpStatus(status.as_u16()),
                    format!("extraction service answered {status}"),
                )
            })?
        } else {
            protocol::json::<Response>(&body, "extraction").map_err(|e| {
                if status.is_success() {
                    ExtractionError::new(ErrorCode::MalformedResponse, e.to_string())
                } else {
                    ExtractionError::new(
                        ErrorCode::HttpStatus(status.as_u16()),
                        format!("extraction service answered {status}: {e}"),
                    )
                }
            })?
        };

        match parsed {
            Response::Tunnel(media) | Response::Redirect(media) => {
                let extracted = Extracted::from(media);
                debug!(
                    "resolved {source_url} (duration: {})",
                    extracted
                        .duration
                        .map_or_else(|| "unknown".to_owned(), |secs| format!("{secs}s"))
                );
                Ok(extracted)
            }
            Response::Error { error } => {
                let error = ExtractionError::from(error);
                warn!("extraction of {source_url} failed: {error}");
                Err(error)
            }
            Response::Unsupported => Err(ExtractionError::new(
                ErrorCode::MalformedResponse,
                "response carries no single playable url",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::{json, Value};

    use super::*;
    use crate::protocol::extraction::FileMetadata;

    fn media(url: &str) -> Media {
        Media {
            url: Url::parse(url).unwrap(),
            filename: None,
            title: None,
            artist: None,
            author: None,
            artwork: None,
            picture: None,
            thumbnail: None,
            cover: None,
            duration: None,
            file_metadata: None,
        }
    }

    #[test]
    fn normalization_follows_precedence() {
        let mut m = media("https://tunnel.example.net/abc");
        m.author = Some("Uploader".to_owned());
        m.file_metadata = Some(FileMetadata {
            title: Some("Tagged Title".to_owned()),
            artist: Some("Tagged Artist".to_owned()),
            ..FileMetadata::default()
        });
        m.picture = Some("not a url".to_owned());
        m.thumbnail = Some("https://img.example.net/thumb.jpg".to_owned());
        m.cover = Some("https://img.example.net/cover.jpg".to_owned());
        m.duration = Some(184.9);

        let extracted = Extracted::from(m);
        assert_eq!(extracted.title.as_deref(), Some("Tagged Title"));
        assert_eq!(extracted.artist.as_deref(), Some("Tagged Artist"));
        assert_eq!(
            extracted.artwork.as_ref().map(Url::as_str),
            Some("https://img.example.net/thumb.jpg")
        );
        assert_eq!(extracted.duration, Some(184));
    }

    #[test]
    fn author_is_the_artist_of_last_resort() {
        let mut m = media("https://tunnel.example.net/abc");
        m.author = Some("Uploader".to_owned());
        m.filename = Some("upload.mp3".to_owned());
        let extracted = Extracted::from(m);
        assert_eq!(extracted.artist_or_default(), "Uploader");
        assert_eq!(extracted.title_or_default(), "upload.mp3");

        let extracted = Extracted::from(media("https://tunnel.example.net/abc"));
        assert_eq!(extracted.artist_or_default(), "Unknown Artist");
        assert_eq!(extracted.title_or_default(), "Untitled Track");
    }

    #[test]
    fn nonsensical_durations_are_dropped() {
        assert_eq!(whole_seconds(f64::NAN), None);
        assert_eq!(whole_seconds(f64::INFINITY), None);
        assert_eq!(whole_seconds(-1.0), None);
        assert_eq!(whole_seconds(0.4), Some(0));
    }

    #[test]
    fn processing_errors_get_their_own_code() {
        let error = ExtractionError::from(UpstreamError {
            code: "error.api.processing".to_owned(),
            context: None,
        });
        assert_eq!(error.code, ErrorCode::ProcessingUnavailable);

        let error = ExtractionError::from(UpstreamError {
            code: "error.api.unreachable".to_owned(),
            context: Some(json!("cannot connect to processing instance")),
        });
        assert_eq!(error.code, ErrorCode::ProcessingUnavailable);

        let error = ExtractionError::from(UpstreamError {
            code: "error.api.fetch.fail".to_owned(),
            context: None,
        });
        assert_eq!(
            error.code,
            ErrorCode::Upstream("error.api.fetch.fail".to_owned())
        );
    }

    /// Serves `router` on an ephemeral port and returns its base URL.
    async fn serve(router: Router) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    fn extractor(endpoint: Url, timeout: Duration) -> Extractor {
        let config = Config {
            extraction_url: endpoint,
            extraction_timeout: timeout,
            ..Config::default()
        };
        Extractor::new(&config).unwrap()
    }

    fn source() -> Url {
        Url::parse("https://hosting.example.com/artist/track").unwrap()
    }

    #[tokio::test]
    async fn tunnel_responses_resolve() {
        let router = Router::new().route(
            "/",
            post(|Json(request): Json<Value>| async move {
                assert_eq!(request["downloadMode"], "audio");
                assert_eq!(request["audioFormat"], "best");
                Json(json!({
                    "status": "tunnel",
                    "url": "https://tunnel.example.net/t1-abc",
                    "title": "Track",
                    "artist": "Artist",
                    "duration": 184,
                }))
            }),
        );
        let extractor = extractor(serve(router).await, Duration::from_secs(5));

        let extracted = extractor.resolve(&source()).await.unwrap();
        assert_eq!(extracted.url.as_str(), "https://tunnel.example.net/t1-abc");
        assert_eq!(extracted.duration, Some(184));
        assert_eq!(extracted.title.as_deref(), Some("Track"));
    }

    #[tokio::test]
    async fn upstream_errors_keep_their_code() {
        let router = Router::new().route(
            "/",
            post(|| async {
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "status": "error",
                        "error": { "code": "error.api.link.invalid" },
                    })),
                )
            }),
        );
        let extractor = extractor(serve(router).await, Duration::from_secs(5));

        let error = extractor.resolve(&source()).await.unwrap_err();
        assert_eq!(
            error.code,
            ErrorCode::Upstream("error.api.link.invalid".to_owned())
        );
    }

    #[tokio::test]
    async fn gateway_errors_are_http_status() {
        let router = Router::new().route(
            "/",
            post(|| async { (StatusCode::BAD_GATEWAY, "<html>bad gateway</html>") }),
        );
        let extractor = extractor(serve(router).await, Duration::from_secs(5));

        let error = extractor.resolve(&source()).await.unwrap_err();
        assert_eq!(error.code, ErrorCode::HttpStatus(502));
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let router = Router::new().route("/", post(|| async { "definitely not json" }));
        let extractor = extractor(serve(router).await, Duration::from_secs(5));

        let error = extractor.resolve(&source()).await.unwrap_err();
        assert_eq!(error.code, ErrorCode::MalformedResponse);
    }

    #[tokio::test]
    async fn slow_services_time_out() {
        let router = Router::new().route(
            "/",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({ "status": "tunnel", "url": "https://tunnel.example.net/late" }))
            }),
        );
        let extractor = extractor(serve(router).await, Duration::from_millis(200));

        let error = extractor.resolve(&source()).await.unwrap_err();
        assert_eq!(error.code, ErrorCode::Timeout);
    }

    #[tokio::test]
    async fn unreachable_services_are_connection_failures() {
        // Bind and drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        drop(listener);

        let endpoint = Url::parse(&format!("http://{addr}/")).unwrap();
        let extractor = extractor(endpoint, Duration::from_secs(5));

        let error = extractor.resolve(&source()).await.unwrap_err();
        assert_eq!(error.code, ErrorCode::Connection);
    }
}
