//! Audio output over HTTP streams.
//!
//! [`Output`] is the [`Pipeline`] the binary plays through. It streams the
//! attached URL with `stream-download` into temporary storage, decodes it
//! with `rodio` and plays it on one output sink.
//!
//! # Attach
//!
//! Every attach bumps a generation and gets its own cancellation token.
//! Loading runs in a background task:
//!
//! 1. Request the URL. HTTP 4xx means the tunnel is gone
//!    ([`MediaErrorCode::SourceNotSupported`]), failing to connect or other
//!    statuses are [`MediaErrorCode::Network`].
//! 2. Start the download and probe the format. Any failure to decode is
//!    [`MediaErrorCode::Decode`]: the tunnel answered, so it has not expired,
//!    even if it serves a format that is not compiled in.
//! 3. Append the decoder to the sink, report the duration and start.
//!
//! The generation of an attach is its [`Source`]. Events are only sent while
//! their generation is current, and carry it so the player can drop the ones
//! that were already queued when the source was replaced.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use cpal::traits::{DeviceTrait, HostTrait};
use rodio::{decoder::DecoderError, source::EmptyCallback, OutputStream, Sink, Source as _};
use stream_download::{
    http::{HttpStream, HttpStreamError},
    source::SourceStream,
    storage::temp::TempStorageProvider,
    StreamDownload, StreamPhase, StreamState,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    config::Config,
    error::{Error, Result},
    heal::MediaErrorCode,
    http,
    player::{Pipeline, PipelineEvent, Source, SourceEvent},
};

type Download = StreamDownload<TempStorageProvider>;
type Client = reqwest::Client;

/// Delivers events of one attach while it is current.
#[derive(Clone)]
struct Emitter {
    generation: Source,
    current: Arc<Mutex<Source>>,
    event_tx: mpsc::UnboundedSender<SourceEvent>,
}

impl Emitter {
    fn is_current(&self) -> bool {
        self.current
            .lock()
            .is_ok_and(|current| *current == self.generation)
    }

    fn emit(&self, event: PipelineEvent) {
        if self.is_current() {
            // The player is gone when this fails.
            let _ = self.event_tx.send(SourceEvent {
                source: self.generation,
                event,
            });
        }
    }
}

/// Audio output on a local device.
pub struct Output {
    sink: Arc<Sink>,
    client: Client,

    /// Generation of the current attach. Guards the sink against sources of
    /// replaced attaches.
    current: Arc<Mutex<Source>>,
    cancel: CancellationToken,

    event_tx: mpsc::UnboundedSender<SourceEvent>,

    // Must outlive the sink.
    _stream: OutputStream,
}

impl Output {
    /// How often the playback position is reported.
    const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

    /// Bytes to download before decoding starts.
    const PREFETCH_BYTES: u64 = 128 * 1024;

    /// Opens the output device called `device`, or the default device.
    /// Events of attached sources are sent to `event_tx`.
    ///
    /// # Errors
    ///
    /// Returns an error if the device does not exist or cannot be opened,
    /// or the HTTP client cannot be created.
    pub fn open(
        config: &Config,
        device: Option<&str>,
        event_tx: mpsc::UnboundedSender<SourceEvent>,
    ) -> Result<Self> {
        let (stream, handle) = match device {
            Some(name) => {
                let host = cpal::default_host();
                let device = host
                    .output_devices()?
                    .find(|device| device.name().is_ok_and(|n| n == name))
                    .ok_or_else(|| {
                        Error::not_found(format!(
                            "audio device \"{name}\" not found, available: {}",
                            Self::devices().unwrap_or_default().join(", ")
                        ))
                    })?;
                OutputStream::try_from_device(&device)?
            }
            None => OutputStream::try_default()?,
        };

        let sink = Sink::try_new(&handle)?;
        sink.pause();
        info!("audio output opened on {}", device.unwrap_or("default device"));

        Ok(Self {
            sink: Arc::new(sink),
            client: http::streaming(config)?,
            current: Arc::new(Mutex::new(0)),
            cancel: CancellationToken::new(),
            event_tx,
            _stream: stream,
        })
    }

    /// Names of the available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if the audio host cannot enumerate devices.
    pub fn devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        Ok(host
            .output_devices()?
            .filter_map(|device| device.name().ok())
            .collect())
    }

    /// Invalidates the current attach and empties the sink. Returns the
    /// generation of the next attach.
    fn teardown(&mut self) -> Source {
        self.cancel.cancel();

        let mut current = self
            .current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *current += 1;
        self.sink.clear();

        *current
    }

    /// Requests `url` and starts downloading it.
    async fn download(
        client: Client,
        url: Url,
        complete: Arc<AtomicBool>,
    ) -> std::result::Result<Download, MediaErrorCode> {
        let stream = HttpStream::new(client, url).await.map_err(|e| {
            warn!("failed to request stream: {e}");
            match &e {
                HttpStreamError::ResponseFailure(e)
                    if e.source().status().is_some_and(|status| status.is_client_error()) =>
                {
                    MediaErrorCode::SourceNotSupported
                }
                _ => MediaErrorCode::Network,
            }
        })?;

        match stream.content_length() {
            Some(length) => debug!("streaming {length} bytes"),
            None => debug!("streaming with unknown length"),
        }

        let settings = stream_download::Settings::default()
            .on_progress(move |_: &HttpStream<_>, state: StreamState, _: &CancellationToken| {
                if matches!(state.phase, StreamPhase::Complete) {
                    complete.store(true, Ordering::Release);
                }
            })
            .prefetch_bytes(Self::PREFETCH_BYTES);

        StreamDownload::from_stream(stream, TempStorageProvider::default(), settings)
            .await
            .map_err(|e| {
                warn!("failed to start download: {e}");
                MediaErrorCode::Network
            })
    }

    /// Probes the format of `download`. Reads block until enough has been
    /// downloaded.
    async fn decode(
        download: Download,
    ) -> std::result::Result<rodio::Decoder<Download>, MediaErrorCode> {
        match tokio::task::spawn_blocking(move || rodio::Decoder::new(download)).await {
            Ok(Ok(decoder)) => Ok(decoder),
            Ok(Err(DecoderError::UnrecognizedFormat)) => {
                warn!("stream is not in a supported format");
                Err(MediaErrorCode::Decode)
            }
            Ok(Err(e)) => {
                warn!("failed to decode stream: {e}");
                Err(MediaErrorCode::Decode)
            }
            Err(e) => {
                error!("decoder task failed: {e}");
                Err(MediaErrorCode::Decode)
            }
        }
    }

    async fn load(
        sink: Arc<Sink>,
        client: Client,
        url: Url,
        emitter: Emitter,
        cancel: CancellationToken,
    ) {
        let complete = Arc::new(AtomicBool::new(false));

        let loaded = tokio::select! {
            () = cancel.cancelled() => return,
            loaded = async {
                let download = Self::download(client, url, Arc::clone(&complete)).await?;
                Self::decode(download).await
            } => loaded,
        };

        let decoder = match loaded {
            Ok(decoder) => decoder,
            Err(code) => {
                emitter.emit(PipelineEvent::Error(code));
                return;
            }
        };

        if let Some(duration) = decoder.total_duration() {
            emitter.emit(PipelineEvent::MetadataReady {
                duration: duration.as_secs_f64(),
            });
        }

        // A source that ends before its download completed was cut off.
        let on_end = {
            let emitter = emitter.clone();
            EmptyCallback::<f32>::new(Box::new(move || {
                if complete.load(Ordering::Acquire) {
                    emitter.emit(PipelineEvent::Ended);
                } else {
                    emitter.emit(PipelineEvent::Error(MediaErrorCode::Network));
                }
            }))
        };

        {
            // Holding the generation keeps teardown from clearing the sink
            // between the check and the append.
            let Ok(current) = emitter.current.lock() else {
                return;
            };
            if *current != emitter.generation {
                return;
            }

            sink.append(decoder);
            sink.append(on_end);
            sink.play();
        }
        emitter.emit(PipelineEvent::Started);

        let mut interval = tokio::time::interval(Self::PROGRESS_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if sink.empty() {
                        break;
                    }
                    if !sink.is_paused() {
                        emitter.emit(PipelineEvent::Progress {
                            position: sink.get_pos().as_secs_f64(),
                        });
                    }
                }
            }
        }
    }
}

impl Pipeline for Output {
    fn attach(&mut self, url: &Url) -> Result<Source> {
        let generation = self.teardown();
        self.cancel = CancellationToken::new();
        debug!("attaching source {generation}");

        let emitter = Emitter {
            generation,
            current: Arc::clone(&self.current),
            event_tx: self.event_tx.clone(),
        };
        tokio::spawn(Self::load(
            Arc::clone(&self.sink),
            self.client.clone(),
            url.clone(),
            emitter,
            self.cancel.clone(),
        ));

        Ok(generation)
    }

    fn play(&mut self) -> Result<()> {
        self.sink.play();
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.sink.pause();
        Ok(())
    }

    fn seek(&mut self, position: Duration) -> Result<()> {
        self.sink.try_seek(position)?;
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) -> Result<()> {
        self.sink.set_volume(volume);
        Ok(())
    }

    fn stop(&mut self) {
        self.teardown();
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        self.teardown();
    }
}
