//! Playback engine.
//!
//! The [`Player`] owns the playback session and exactly one audio
//! [`Pipeline`]. It is a single-owner state machine: every transition takes
//! `&mut self`, and [`Player::run`] drives it from one task by selecting over
//! user commands, pipeline events, and resolution completions.
//!
//! # States
//!
//! ```text
//! Idle -> Loading -> Playing <-> Paused
//!            ^          |
//!            |          v
//!            +------ Errored   (only via self-healing or a fresh play)
//! ```
//!
//! # Resolution
//!
//! A URL to attach comes from the [`ResolutionCache`] when it is fresh, and
//! otherwise from a [`Refresh`] call running in a spawned task. Completions
//! report back over a channel, tagged with the track and the episode
//! generation they were started for. Anything that does not match the
//! session anymore, because the user switched tracks or stopped, is
//! dropped.
//!
//! # Sources
//!
//! Every attach yields a [`Source`] that tags the events of that source.
//! Events of a source that was replaced or stopped may still be queued when
//! the player gets to them; they are dropped instead of being applied to
//! whatever track is active by then.
//!
//! # Self-Healing
//!
//! A decode failure is classified by the [`Healer`]. An expired tunnel gets
//! one recovery per episode: invalidate the cached URL, re-resolve, and
//! re-attach from position 0.

use std::{str::FromStr, sync::Arc, time::Duration};

use tokio::sync::mpsc;
use url::Url;

use crate::{
    cache::ResolutionCache,
    error::{Error, Result},
    events::Event,
    heal::{Decision, Healer, MediaErrorCode},
    refresh::{Refresh, Refreshed},
    track::TrackId,
};

/// Playback status of the session.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Status {
    #[default]
    Idle,
    Loading,
    Playing,
    Paused,
    Errored,
}

/// The playback session.
#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    /// At most one active track. Retained after the track ended.
    pub active: Option<TrackId>,

    pub status: Status,

    /// Seconds.
    pub position: f64,

    /// Seconds, `0.0` until the decoder reports it.
    pub duration: f64,

    /// Ratio in `[0, 1]`, kept across tracks.
    pub volume: f32,
}

impl Session {
    pub const DEFAULT_VOLUME: f32 = 0.9;

    fn is_active(&self, id: &TrackId) -> bool {
        self.active.as_ref() == Some(id)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self {
            active: None,
            status: Status::Idle,
            position: 0.0,
            duration: 0.0,
            volume: Self::DEFAULT_VOLUME,
        }
    }
}

/// Identifies one attach of a [`Pipeline`]. Never reused by a pipeline.
pub type Source = u64;

/// Audio decode primitive driven by the player.
///
/// Implementations report what happens to the attached source through the
/// event channel they were created with, tagged with the [`Source`] that
/// `attach` returned. Attaching replaces any previous source.
pub trait Pipeline {
    /// Starts loading `url`. Decoding starts once loaded, signalled by
    /// [`PipelineEvent::Started`].
    fn attach(&mut self, url: &Url) -> Result<Source>;

    /// Resumes a paused source.
    fn play(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    fn seek(&mut self, position: Duration) -> Result<()>;

    fn set_volume(&mut self, volume: f32) -> Result<()>;

    /// Stops decoding and detaches the source. Idempotent.
    fn stop(&mut self);
}

/// What a pipeline reports about its attached source.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    /// Seconds, when the decoder knows the real duration.
    MetadataReady { duration: f64 },

    Started,

    /// Seconds.
    Progress { position: f64 },

    Ended,

    Error(MediaErrorCode),
}

/// A [`PipelineEvent`] of one attached source.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SourceEvent {
    pub source: Source,
    pub event: PipelineEvent,
}

/// User commands.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Play(TrackId),

    /// Pauses `id` when it is playing, plays it otherwise.
    Toggle(TrackId),

    Pause,

    /// Seeks `id` to a ratio of its duration.
    Seek(TrackId, f64),

    SetVolume(f32),

    Stop,
}

/// Parses commands as typed on a console:
///
/// ```text
/// play <id>
/// toggle <id>
/// pause
/// seek <id> <ratio>
/// volume <ratio>
/// stop
/// ```
impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut words = s.split_whitespace();
        let verb = words.next().unwrap_or_default().to_ascii_lowercase();
        let mut next = |what: &str| {
            words
                .next()
                .ok_or_else(|| Error::invalid_argument(format!("{verb}: missing {what}")))
        };

        let command = match verb.as_str() {
            "play" => Self::Play(next("track id")?.parse()?),
            "toggle" => Self::Toggle(next("track id")?.parse()?),
            "pause" => Self::Pause,
            "seek" => {
                let id = next("track id")?.parse()?;
                let ratio = next("ratio")?;
                let ratio = ratio
                    .parse()
                    .map_err(|_| Error::invalid_argument(format!("invalid ratio \"{ratio}\"")))?;
                Self::Seek(id, ratio)
            }
            "volume" => {
                let volume = next("volume")?;
                Self::SetVolume(volume.parse().map_err(|_| {
                    Error::invalid_argument(format!("invalid volume \"{volume}\""))
                })?)
            }
            "stop" => Self::Stop,
            "" => return Err(Error::invalid_argument("empty command")),
            _ => return Err(Error::invalid_argument(format!("unknown command \"{verb}\""))),
        };

        Ok(command)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum Purpose {
    /// First resolution of an episode.
    Initial,

    /// Recovery from an expired tunnel.
    Heal,
}

/// Completion of a spawned refresh.
#[derive(Debug)]
struct Resolved {
    id: TrackId,
    generation: u64,
    purpose: Purpose,
    result: Result<Refreshed>,
}

/// Single-track player over a [`Pipeline`].
pub struct Player<P: Pipeline> {
    session: Session,
    pipeline: P,

    /// What the pipeline plays for the active track, if anything.
    source: Option<Source>,

    refresher: Arc<dyn Refresh>,
    cache: ResolutionCache,
    healer: Healer,

    /// Bumped whenever in-flight resolutions stop being relevant.
    generation: u64,

    resolutions_tx: mpsc::UnboundedSender<Resolved>,
    resolutions_rx: mpsc::UnboundedReceiver<Resolved>,

    event_tx: Option<mpsc::UnboundedSender<Event>>,
}

impl<P: Pipeline> Player<P> {
    pub fn new(pipeline: P, refresher: Arc<dyn Refresh>) -> Self {
        let (resolutions_tx, resolutions_rx) = mpsc::unbounded_channel();
        Self {
            session: Session::default(),
            pipeline,
            source: None,
            refresher,
            cache: ResolutionCache::new(),
            healer: Healer::new(),
            generation: 0,
            resolutions_tx,
            resolutions_rx,
            event_tx: None,
        }
    }

    /// Sends [`Event`]s to `event_tx` from now on.
    #[must_use]
    pub fn with_events(mut self, event_tx: mpsc::UnboundedSender<Event>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    fn notify(&self, event: Event) {
        if let Some(event_tx) = &self.event_tx {
            if let Err(e) = event_tx.send(event) {
                error!("failed to send event: {e}");
            }
        }
    }

    fn set_status(&mut self, status: Status) {
        if self.session.status != status {
            trace!("status: {:?} -> {status:?}", self.session.status);
            self.session.status = status;
        }
    }

    /// Drives the player until the command channel closes.
    ///
    /// # Errors
    ///
    /// Currently never fails: command errors are logged and playback
    /// failures are session states, not errors.
    pub async fn run(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut pipeline_events: mpsc::UnboundedReceiver<SourceEvent>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if let Err(e) = self.handle(command) {
                        warn!("{e}");
                    }
                }

                Some(resolved) = self.resolutions_rx.recv() => {
                    self.on_resolved(resolved);
                }

                Some(event) = pipeline_events.recv() => {
                    self.on_pipeline_event(event);
                }
            }
        }

        self.stop();
        Ok(())
    }

    /// Applies one user command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command is not legal in the current state,
    /// or the pipeline rejects it.
    pub fn handle(&mut self, command: Command) -> Result<()> {
        debug!("command: {command:?}");
        match command {
            Command::Play(id) => self.play(id),
            Command::Toggle(id) => self.toggle(id),
            Command::Pause => self.pause(),
            Command::Seek(id, ratio) => self.seek(&id, ratio),
            Command::SetVolume(volume) => self.set_volume(volume),
            Command::Stop => {
                self.stop();
                Ok(())
            }
        }
    }

    /// Plays `id`, resuming it if it is the paused active track.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline fails to resume.
    pub fn play(&mut self, id: TrackId) -> Result<()> {
        if self.session.is_active(&id) {
            match self.session.status {
                Status::Paused => {
                    self.pipeline.play()?;
                    self.set_status(Status::Playing);
                    self.notify(Event::Play);
                    return Ok(());
                }
                Status::Loading | Status::Playing => return Ok(()),
                Status::Idle | Status::Errored => {}
            }
        }

        if self.session.active.is_some() {
            self.detach();
        }
        self.cache.purge_expired();

        // New episode: whatever is still resolving is for an old one.
        self.generation += 1;
        self.healer.clear(&id);

        info!("loading {id}");
        self.session.active = Some(id.clone());
        self.session.position = 0.0;
        self.session.duration = 0.0;
        self.set_status(Status::Loading);
        self.notify(Event::TrackChanged);

        if let Some(url) = self.cache.get(&id).cloned() {
            debug!("{id}: using cached resolution");
            self.attach(&url);
        } else {
            self.spawn_resolution(id, Purpose::Initial);
        }

        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the pipeline fails to pause or resume.
    pub fn toggle(&mut self, id: TrackId) -> Result<()> {
        if self.session.is_active(&id) && self.session.status == Status::Playing {
            self.pause()
        } else {
            self.play(id)
        }
    }

    /// Pauses a playing track; does nothing otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline fails to pause.
    pub fn pause(&mut self) -> Result<()> {
        if self.session.status != Status::Playing {
            return Ok(());
        }

        self.pipeline.pause()?;
        self.set_status(Status::Paused);
        self.notify(Event::Pause);
        Ok(())
    }

    /// Seeks the active track `id` to `ratio` of its duration.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if `ratio` is not within `[0, 1]`, or
    /// `FailedPrecondition` if `id` is not active or its duration is not
    /// known yet.
    pub fn seek(&mut self, id: &TrackId, ratio: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(Error::out_of_range(format!(
                "seek ratio {ratio} is not within [0, 1]"
            )));
        }
        if !self.session.is_active(id) {
            return Err(Error::failed_precondition(format!(
                "cannot seek {id}: not the active track"
            )));
        }
        if self.session.duration <= 0.0 {
            return Err(Error::failed_precondition(format!(
                "cannot seek {id}: duration unknown"
            )));
        }

        let position = ratio * self.session.duration;
        self.pipeline.seek(Duration::from_secs_f64(position))?;
        self.session.position = position;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `OutOfRange` if `volume` is not within `[0, 1]`.
    pub fn set_volume(&mut self, volume: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(Error::out_of_range(format!(
                "volume {volume} is not within [0, 1]"
            )));
        }

        self.pipeline.set_volume(volume)?;
        self.session.volume = volume;
        Ok(())
    }

    /// Tears down the pipeline and clears the active track.
    pub fn stop(&mut self) {
        self.detach();
        self.generation += 1;

        if self.session.active.take().is_some() {
            self.session.position = 0.0;
            self.session.duration = 0.0;
            self.set_status(Status::Idle);
            self.notify(Event::Stop);
        }
    }

    fn detach(&mut self) {
        self.pipeline.stop();
        self.source = None;
    }

    /// Replaces the pipeline source with `url` of the active track.
    fn attach(&mut self, url: &Url) {
        self.detach();
        self.session.position = 0.0;

        let result = self
            .pipeline
            .set_volume(self.session.volume)
            .and_then(|()| self.pipeline.attach(url));
        match result {
            Ok(source) => self.source = Some(source),
            Err(e) => {
                error!("failed to attach source: {e}");
                self.fail();
            }
        }
    }

    fn fail(&mut self) {
        self.set_status(Status::Errored);
        self.notify(Event::Error);
    }

    fn spawn_resolution(&self, id: TrackId, purpose: Purpose) {
        let refresher = Arc::clone(&self.refresher);
        let resolutions_tx = self.resolutions_tx.clone();
        let generation = self.generation;

        tokio::spawn(async move {
            let result = refresher.refresh(&id).await;
            // The player is gone when this fails, and nobody is interested.
            let _ = resolutions_tx.send(Resolved {
                id,
                generation,
                purpose,
                result,
            });
        });
    }

    fn on_resolved(&mut self, resolved: Resolved) {
        let Resolved {
            id,
            generation,
            purpose,
            result,
        } = resolved;

        if generation != self.generation || !self.session.is_active(&id) {
            debug!("{id}: discarding resolution of a previous episode");
            return;
        }

        match result {
            Ok(refreshed) => {
                if refreshed.stale {
                    // The last known URL is as good as a failed recovery:
                    // if it does not play, there is nothing left to try.
                    warn!("{id}: playing last known url, it may have expired");
                    self.healer.mark(&id);
                } else {
                    self.cache.put(id.clone(), refreshed.url.clone());
                }

                if purpose == Purpose::Heal {
                    debug!("{id}: re-attaching after recovery");
                }
                self.attach(&refreshed.url);
            }
            Err(e) => {
                error!("{id}: failed to resolve: {e}");
                self.fail();
            }
        }
    }

    fn on_pipeline_event(&mut self, SourceEvent { source, event }: SourceEvent) {
        if self.source != Some(source) {
            trace!("ignoring {event:?} of detached source {source}");
            return;
        }
        let Some(id) = self.session.active.clone() else {
            trace!("ignoring {event:?} without active track");
            return;
        };

        match event {
            PipelineEvent::MetadataReady { duration } => {
                if duration.is_finite() && duration > 0.0 {
                    self.session.duration = duration;
                }
            }

            PipelineEvent::Started => {
                if self.session.status == Status::Loading {
                    info!("{id}: playing");
                    self.set_status(Status::Playing);
                    self.notify(Event::Play);
                }
            }

            PipelineEvent::Progress { position } => {
                if position.is_finite() && position >= 0.0 {
                    self.session.position = position;
                }
            }

            PipelineEvent::Ended => {
                debug!("{id}: ended");
                self.session.position = 0.0;
                self.set_status(Status::Idle);
                self.notify(Event::Ended);
            }

            PipelineEvent::Error(code) => {
                if matches!(self.session.status, Status::Idle | Status::Errored) {
                    trace!("{id}: ignoring {code} while {:?}", self.session.status);
                    return;
                }

                warn!("{id}: {code}");
                self.fail();

                if self.healer.decide(&id, code) == Decision::Recover {
                    self.cache.invalidate(&id);
                    self.detach();
                    self.set_status(Status::Loading);
                    self.notify(Event::Recovering);
                    self.spawn_resolution(id, Purpose::Heal);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, VecDeque},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use async_trait::async_trait;

    use super::*;
    use crate::error::ErrorKind;

    #[derive(Clone, Debug, PartialEq)]
    enum Call {
        Attach(String),
        Play,
        Pause,
        Seek(Duration),
        Volume(f32),
        Stop,
    }

    /// Records calls and checks that no two sources are ever attached.
    #[derive(Default)]
    struct FakePipeline {
        calls: Vec<Call>,
        attached: Option<Url>,
        sources: Source,
    }

    impl FakePipeline {
        fn attaches(&self) -> Vec<&str> {
            self.calls
                .iter()
                .filter_map(|call| match call {
                    Call::Attach(url) => Some(url.as_str()),
                    _ => None,
                })
                .collect()
        }
    }

    impl Pipeline for FakePipeline {
        fn attach(&mut self, url: &Url) -> Result<Source> {
            assert!(self.attached.is_none(), "two sources attached");
            self.attached = Some(url.clone());
            self.calls.push(Call::Attach(url.to_string()));
            self.sources += 1;
            Ok(self.sources)
        }

        fn play(&mut self) -> Result<()> {
            self.calls.push(Call::Play);
            Ok(())
        }

        fn pause(&mut self) -> Result<()> {
            self.calls.push(Call::Pause);
            Ok(())
        }

        fn seek(&mut self, position: Duration) -> Result<()> {
            self.calls.push(Call::Seek(position));
            Ok(())
        }

        fn set_volume(&mut self, volume: f32) -> Result<()> {
            self.calls.push(Call::Volume(volume));
            Ok(())
        }

        fn stop(&mut self) {
            self.attached = None;
            self.calls.push(Call::Stop);
        }
    }

    /// Answers refreshes from queues per track and counts calls.
    #[derive(Default)]
    struct FakeRefresher {
        answers: Mutex<HashMap<TrackId, VecDeque<Result<Refreshed>>>>,
        calls: AtomicUsize,
    }

    impl FakeRefresher {
        fn answer(&self, id: &str, result: Result<Refreshed>) {
            self.answers
                .lock()
                .unwrap()
                .entry(id.parse().unwrap())
                .or_default()
                .push_back(result);
        }

        fn fresh(&self, id: &str, url: &str) {
            self.answer(id, Ok(refreshed(url, false)));
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Refresh for FakeRefresher {
        async fn refresh(&self, id: &TrackId) -> Result<Refreshed> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .lock()
                .unwrap()
                .get_mut(id)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Err(Error::not_found(format!("track {id} not found"))))
        }
    }

    fn refreshed(url: &str, stale: bool) -> Refreshed {
        Refreshed {
            url: Url::parse(url).unwrap(),
            stale,
        }
    }

    fn id(s: &str) -> TrackId {
        s.parse().unwrap()
    }

    fn player(refresher: &Arc<FakeRefresher>) -> Player<FakePipeline> {
        Player::new(FakePipeline::default(), refresher.clone())
    }

    impl Player<FakePipeline> {
        /// Waits for the next spawned resolution and applies it.
        async fn settle(&mut self) {
            let resolved = self.resolutions_rx.recv().await.unwrap();
            self.on_resolved(resolved);
        }

        /// Delivers `event` as coming from the current source.
        fn emit(&mut self, event: PipelineEvent) {
            let source = self.source.unwrap_or_default();
            self.on_pipeline_event(SourceEvent { source, event });
        }

        /// Loads `id` through a resolution and starts decoding.
        async fn play_through(&mut self, track: &str, duration: f64) {
            self.play(id(track)).unwrap();
            self.settle().await;
            self.emit(PipelineEvent::MetadataReady { duration });
            self.emit(PipelineEvent::Started);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cold_play_resolves_caches_and_plays() {
        let refresher = Arc::new(FakeRefresher::default());
        refresher.fresh("t1", "https://tunnel.example.net/t1-abc");
        let mut player = player(&refresher);

        player.play(id("t1")).unwrap();
        assert_eq!(player.session().status, Status::Loading);

        player.settle().await;
        assert_eq!(player.pipeline.attaches(), ["https://tunnel.example.net/t1-abc"]);
        assert_eq!(
            player.cache().get(&id("t1")).map(Url::as_str),
            Some("https://tunnel.example.net/t1-abc")
        );

        player.emit(PipelineEvent::MetadataReady { duration: 184.0 });
        player.emit(PipelineEvent::Started);
        assert_eq!(player.session().status, Status::Playing);
        assert_eq!(player.session().duration, 184.0);
        assert!(player.pipeline.calls.contains(&Call::Volume(0.9)));
    }

    #[tokio::test(start_paused = true)]
    async fn replay_within_ttl_skips_resolution() {
        let refresher = Arc::new(FakeRefresher::default());
        refresher.fresh("t1", "https://tunnel.example.net/t1-abc");
        let mut player = player(&refresher);

        player.play_through("t1", 184.0).await;
        player.emit(PipelineEvent::Ended);
        assert_eq!(player.session().status, Status::Idle);
        assert_eq!(player.session().active, Some(id("t1")));

        tokio::time::advance(Duration::from_secs(10 * 60)).await;
        player.play(id("t1")).unwrap();
        assert_eq!(refresher.calls(), 1);
        assert_eq!(player.pipeline.attaches().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_after_ttl_resolves_again() {
        let refresher = Arc::new(FakeRefresher::default());
        refresher.fresh("t1", "https://tunnel.example.net/t1-abc");
        refresher.fresh("t1", "https://tunnel.example.net/t1-def");
        let mut player = player(&refresher);

        player.play_through("t1", 184.0).await;
        player.stop();

        tokio::time::advance(ResolutionCache::TTL).await;
        player.play(id("t1")).unwrap();
        player.settle().await;
        assert_eq!(refresher.calls(), 2);
        assert_eq!(
            player.pipeline.attaches().last(),
            Some(&"https://tunnel.example.net/t1-def")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn playing_drops_expired_resolutions() {
        let refresher = Arc::new(FakeRefresher::default());
        refresher.fresh("t1", "https://tunnel.example.net/t1");
        refresher.fresh("t2", "https://tunnel.example.net/t2");
        let mut player = player(&refresher);

        player.play_through("t1", 100.0).await;
        assert_eq!(player.cache().len(), 1);

        tokio::time::advance(ResolutionCache::TTL).await;
        player.play(id("t2")).unwrap();
        assert!(player.cache().is_empty());

        player.settle().await;
        assert_eq!(player.cache().len(), 1);
        assert!(player.cache().get(&id("t2")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_tunnel_heals_once() {
        let refresher = Arc::new(FakeRefresher::default());
        refresher.fresh("t1", "https://tunnel.example.net/t1-abc");
        refresher.fresh("t1", "https://tunnel.example.net/t1-def");
        let mut player = player(&refresher);

        player.play_through("t1", 184.0).await;
        tokio::time::advance(Duration::from_secs(20 * 60)).await;
        player.emit(PipelineEvent::Progress { position: 120.0 });

        player.emit(PipelineEvent::Error(MediaErrorCode::SourceNotSupported));
        assert_eq!(player.session().status, Status::Loading);
        assert_eq!(player.cache().get(&id("t1")), None);

        player.settle().await;
        assert_eq!(refresher.calls(), 2);
        assert_eq!(player.session().position, 0.0);
        assert_eq!(
            player.pipeline.attaches().last(),
            Some(&"https://tunnel.example.net/t1-def")
        );
        player.emit(PipelineEvent::Started);
        assert_eq!(player.session().status, Status::Playing);

        // The second failure of this episode is final.
        player.emit(PipelineEvent::Error(MediaErrorCode::SourceNotSupported));
        assert_eq!(player.session().status, Status::Errored);
        assert_eq!(refresher.calls(), 2);
        assert!(player.resolutions_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_play_starts_a_new_episode() {
        let refresher = Arc::new(FakeRefresher::default());
        refresher.fresh("t1", "https://tunnel.example.net/a");
        refresher.fresh("t1", "https://tunnel.example.net/b");
        refresher.fresh("t1", "https://tunnel.example.net/c");
        let mut player = player(&refresher);

        player.play_through("t1", 184.0).await;
        player.emit(PipelineEvent::Error(MediaErrorCode::SourceNotSupported));
        player.settle().await;
        player.emit(PipelineEvent::Error(MediaErrorCode::SourceNotSupported));
        assert_eq!(player.session().status, Status::Errored);

        // Errored goes back to loading on an explicit play, and may heal again.
        player.play(id("t1")).unwrap();
        assert_eq!(player.session().status, Status::Loading);
        player.emit(PipelineEvent::Started);
        player.emit(PipelineEvent::Error(MediaErrorCode::SourceNotSupported));
        assert_eq!(player.session().status, Status::Loading);
        player.settle().await;
        assert_eq!(refresher.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_do_not_heal() {
        let refresher = Arc::new(FakeRefresher::default());
        refresher.fresh("t1", "https://tunnel.example.net/a");
        let mut player = player(&refresher);

        player.play_through("t1", 184.0).await;
        player.emit(PipelineEvent::Error(MediaErrorCode::Network));
        assert_eq!(player.session().status, Status::Errored);
        assert_eq!(refresher.calls(), 1);
        assert!(player.cache().get(&id("t1")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_urls_play_without_further_recovery() {
        let refresher = Arc::new(FakeRefresher::default());
        refresher.answer("t2", Ok(refreshed("https://tunnel.example.net/t2-old", true)));
        let mut player = player(&refresher);

        player.play(id("t2")).unwrap();
        player.settle().await;
        assert_eq!(player.pipeline.attaches(), ["https://tunnel.example.net/t2-old"]);
        assert!(player.cache().is_empty());

        player.emit(PipelineEvent::Error(MediaErrorCode::SourceNotSupported));
        assert_eq!(player.session().status, Status::Errored);
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_tracks_error() {
        let refresher = Arc::new(FakeRefresher::default());
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut player = player(&refresher).with_events(event_tx);

        player.play(id("ghost")).unwrap();
        player.settle().await;
        assert_eq!(player.session().status, Status::Errored);
        assert!(player.pipeline.attaches().is_empty());

        assert_eq!(event_rx.recv().await, Some(Event::TrackChanged));
        assert_eq!(event_rx.recv().await, Some(Event::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn switching_tracks_discards_late_resolutions() {
        let refresher = Arc::new(FakeRefresher::default());
        refresher.fresh("t1", "https://tunnel.example.net/t1");
        refresher.fresh("t2", "https://tunnel.example.net/t2");
        let mut player = player(&refresher);

        player.play(id("t1")).unwrap();
        player.play(id("t2")).unwrap();

        player.settle().await;
        player.settle().await;
        assert_eq!(player.pipeline.attaches(), ["https://tunnel.example.net/t2"]);
        assert_eq!(player.session().active, Some(id("t2")));

        // Same track, but a previous episode.
        player.play(id("t1")).unwrap();
        player.stop();
        refresher.fresh("t1", "https://tunnel.example.net/t1-late");
        player.settle().await;
        assert_eq!(player.pipeline.attaches(), ["https://tunnel.example.net/t2"]);
        assert_eq!(player.session().status, Status::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn late_end_of_a_replaced_source_is_ignored() {
        let refresher = Arc::new(FakeRefresher::default());
        refresher.fresh("t1", "https://tunnel.example.net/t1");
        refresher.fresh("t2", "https://tunnel.example.net/t2");
        let mut player = player(&refresher);

        player.play_through("t1", 100.0).await;
        let replaced = player.source.unwrap();

        // t1 finished just as t2 was requested; its end is still queued.
        player.play(id("t2")).unwrap();
        player.on_pipeline_event(SourceEvent {
            source: replaced,
            event: PipelineEvent::Ended,
        });
        assert_eq!(player.session().status, Status::Loading);

        player.settle().await;
        player.on_pipeline_event(SourceEvent {
            source: replaced,
            event: PipelineEvent::Ended,
        });
        player.emit(PipelineEvent::Started);
        assert_eq!(player.session().active, Some(id("t2")));
        assert_eq!(player.session().status, Status::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn late_error_of_a_replaced_source_does_not_heal() {
        let refresher = Arc::new(FakeRefresher::default());
        refresher.fresh("t1", "https://tunnel.example.net/t1");
        refresher.fresh("t2", "https://tunnel.example.net/t2");
        refresher.fresh("t2", "https://tunnel.example.net/t2-new");
        let mut player = player(&refresher);

        player.play_through("t1", 100.0).await;
        let replaced = player.source.unwrap();
        player.play(id("t2")).unwrap();
        player.settle().await;

        player.on_pipeline_event(SourceEvent {
            source: replaced,
            event: PipelineEvent::Error(MediaErrorCode::SourceNotSupported),
        });
        assert_eq!(player.session().status, Status::Loading);
        assert!(player.cache().get(&id("t2")).is_some());
        tokio::task::yield_now().await;
        assert_eq!(refresher.calls(), 2);
        assert!(player.resolutions_rx.try_recv().is_err());

        // t2 still has its own recovery.
        player.emit(PipelineEvent::Started);
        player.emit(PipelineEvent::Error(MediaErrorCode::SourceNotSupported));
        player.settle().await;
        assert_eq!(refresher.calls(), 3);
        assert_eq!(
            player.pipeline.attaches().last(),
            Some(&"https://tunnel.example.net/t2-new")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn events_after_stop_are_ignored() {
        let refresher = Arc::new(FakeRefresher::default());
        refresher.fresh("t1", "https://tunnel.example.net/t1");
        let mut player = player(&refresher);

        player.play_through("t1", 100.0).await;
        let stopped = player.source.unwrap();
        player.stop();

        // Cache hit: same track, new source.
        player.play(id("t1")).unwrap();
        player.on_pipeline_event(SourceEvent {
            source: stopped,
            event: PipelineEvent::Progress { position: 80.0 },
        });
        assert_eq!(player.session().position, 0.0);
        assert_ne!(player.source, Some(stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_resume_and_toggle() {
        let refresher = Arc::new(FakeRefresher::default());
        refresher.fresh("t1", "https://tunnel.example.net/t1");
        let mut player = player(&refresher);

        player.play_through("t1", 200.0).await;
        player.emit(PipelineEvent::Progress { position: 42.0 });

        player.toggle(id("t1")).unwrap();
        assert_eq!(player.session().status, Status::Paused);

        player.play(id("t1")).unwrap();
        assert_eq!(player.session().status, Status::Playing);
        assert_eq!(player.session().position, 42.0);
        assert_eq!(refresher.calls(), 1);
        assert_eq!(player.pipeline.calls.last(), Some(&Call::Play));

        // Playing the playing track changes nothing.
        player.play(id("t1")).unwrap();
        assert_eq!(player.pipeline.attaches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn seeking_needs_a_duration() {
        let refresher = Arc::new(FakeRefresher::default());
        refresher.fresh("t1", "https://tunnel.example.net/t1");
        let mut player = player(&refresher);

        player.play(id("t1")).unwrap();
        player.settle().await;
        let error = player.seek(&id("t1"), 0.5).unwrap_err();
        assert_eq!(error.kind, ErrorKind::FailedPrecondition);

        player.emit(PipelineEvent::MetadataReady { duration: 200.0 });
        player.seek(&id("t1"), 0.25).unwrap();
        assert_eq!(player.session().position, 50.0);
        assert_eq!(
            player.pipeline.calls.last(),
            Some(&Call::Seek(Duration::from_secs(50)))
        );

        let error = player.seek(&id("t1"), 1.5).unwrap_err();
        assert_eq!(error.kind, ErrorKind::OutOfRange);
        let error = player.seek(&id("t2"), 0.5).unwrap_err();
        assert_eq!(error.kind, ErrorKind::FailedPrecondition);
    }

    #[tokio::test(start_paused = true)]
    async fn volume_is_kept_across_tracks() {
        let refresher = Arc::new(FakeRefresher::default());
        refresher.fresh("t1", "https://tunnel.example.net/t1");
        refresher.fresh("t2", "https://tunnel.example.net/t2");
        let mut player = player(&refresher);

        assert!(player.set_volume(1.5).is_err());
        player.set_volume(0.5).unwrap();
        player.play_through("t1", 100.0).await;
        player.play(id("t2")).unwrap();
        player.settle().await;

        assert_eq!(player.session().volume, 0.5);
        assert_eq!(
            player
                .pipeline
                .calls
                .iter()
                .filter(|call| **call == Call::Volume(0.5))
                .count(),
            3
        );
    }

    #[test]
    fn console_commands() {
        assert_eq!("play t1".parse::<Command>().unwrap(), Command::Play(id("t1")));
        assert_eq!(
            "  SEEK t1 0.5 ".parse::<Command>().unwrap(),
            Command::Seek(id("t1"), 0.5)
        );
        assert_eq!("volume 0.25".parse::<Command>().unwrap(), Command::SetVolume(0.25));
        assert_eq!("stop".parse::<Command>().unwrap(), Command::Stop);

        assert!("".parse::<Command>().is_err());
        assert!("play".parse::<Command>().is_err());
        assert!("seek t1 half".parse::<Command>().is_err());
        assert!("rewind".parse::<Command>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn run_processes_commands_until_closed() {
        let refresher = Arc::new(FakeRefresher::default());
        refresher.fresh("t1", "https://tunnel.example.net/t1");
        let mut player = player(&refresher);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (pipeline_tx, pipeline_rx) = mpsc::unbounded_channel();
        command_tx.send(Command::Play(id("t1"))).unwrap();
        pipeline_tx
            .send(SourceEvent {
                source: 1,
                event: PipelineEvent::Started,
            })
            .unwrap();
        drop(command_tx);

        player.run(command_rx, pipeline_rx).await.unwrap();
        assert_eq!(player.session().active, None);
        assert_eq!(player.pipeline.calls.last(), Some(&Call::Stop));
    }
}
