//! Track persistence.
//!
//! [`TrackStore`] is what the refresh endpoint and the importer need from
//! persistence: look up a track, correct its duration, add a new one.
//! [`Library`] implements it on top of a TOML file:
//!
//! ```toml
//! [[track]]
//! id = "t1"
//! title = "Night Drive"
//! artist = "Artist"
//! source_url = "https://hosting.example.com/artist/night-drive"
//! stream_url = "https://extract.example.net/tunnel?id=abc"
//! cached_duration = 184
//! ```
//!
//! The file is read when opening or reloading and rewritten after every
//! mutation.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{
    error::{Error, Result},
    track::{Track, TrackId},
};

/// Persistence operations on tracks.
#[async_trait]
pub trait TrackStore: Send + Sync {
    /// Looks up a track. Unknown identifiers are `Ok(None)`.
    async fn track(&self, id: &TrackId) -> Result<Option<Track>>;

    /// Overwrites the cached duration of a track.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown identifiers, or an error if the change
    /// could not be persisted.
    async fn update_duration(&self, id: &TrackId, seconds: u32) -> Result<()>;

    /// Adds a new track.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the identifier is taken.
    async fn insert(&self, track: Track) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LibraryFile {
    #[serde(default, rename = "track")]
    tracks: Vec<Track>,
}

/// TOML-backed track library.
#[derive(Debug, Default)]
pub struct Library {
    tracks: RwLock<BTreeMap<TrackId, Track>>,

    /// Where to persist mutations; `None` keeps the library in memory.
    path: Option<PathBuf>,
}

impl Library {
    /// Maximum size of a library file.
    const MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;

    /// Opens the library at `path`. A missing file is an empty library that
    /// will be created on the first mutation.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, is too large,
    /// is not a valid library, or lists an identifier twice.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let library = Self::index(Self::read(path).await?)?;
        debug!("loaded {} tracks from {}", library.len().await, path.display());

        Ok(Self {
            path: Some(path.to_owned()),
            ..library
        })
    }

    /// Re-reads the library file, replacing all tracks in memory. On error,
    /// the tracks in memory are kept.
    ///
    /// # Errors
    ///
    /// Returns an error under the same conditions as [`Library::open`].
    pub async fn reload(&self) -> Result<usize> {
        let Some(path) = &self.path else {
            return Ok(self.len().await);
        };

        let fresh = Self::index(Self::read(path).await?)?.tracks.into_inner();
        let count = fresh.len();
        *self.tracks.write().await = fresh;

        info!("reloaded {count} tracks from {}", path.display());
        Ok(count)
    }

    async fn read(path: &Path) -> Result<Vec<Track>> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) => {
                // Prevent out-of-memory condition on files that are clearly
                // not a track library.
                if metadata.len() > Self::MAX_FILE_SIZE {
                    return Err(Error::out_of_range(format!(
                        "{} is too large ({} bytes)",
                        path.display(),
                        metadata.len()
                    )));
                }

                let contents = tokio::fs::read_to_string(path).await?;
                let file: LibraryFile = toml::from_str(&contents).map_err(|e| {
                    Error::invalid_argument(format!("{} format is invalid: {e}", path.display()))
                })?;
                Ok(file.tracks)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("{} does not exist yet, starting empty", path.display());
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Creates a library that is never written to disk.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if an identifier is listed twice.
    pub fn in_memory(tracks: impl IntoIterator<Item = Track>) -> Result<Self> {
        Self::index(tracks)
    }

    fn index(tracks: impl IntoIterator<Item = Track>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for track in tracks {
            if let Some(previous) = map.insert(track.id.clone(), track) {
                return Err(Error::already_exists(format!(
                    "track {} is listed more than once",
                    previous.id
                )));
            }
        }

        Ok(Self {
            tracks: RwLock::new(map),
            path: None,
        })
    }

    pub async fn len(&self) -> usize {
        self.tracks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tracks.read().await.is_empty()
    }

    /// Writes the library out while the caller holds the write lock, so
    /// concurrent mutations cannot interleave their writes.
    async fn persist(&self, tracks: &BTreeMap<TrackId, Track>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let file = LibraryFile {
            tracks: tracks.values().cloned().collect(),
        };
        let contents = toml::to_string_pretty(&file)?;

        // Write next to the target and rename, so a crash never leaves a
        // truncated library behind.
        let mut temporary = path.clone().into_os_string();
        temporary.push(".tmp");
        tokio::fs::write(&temporary, contents).await?;
        tokio::fs::rename(&temporary, path).await?;

        trace!("wrote {} tracks to {}", tracks.len(), path.display());
        Ok(())
    }
}

#[async_trait]
impl TrackStore for Library {
    async fn track(&self, id: &TrackId) -> Result<Option<Track>> {
        Ok(self.tracks.read().await.get(id).cloned())
    }

    async fn update_duration(&self, id: &TrackId, seconds: u32) -> Result<()> {
        let mut tracks = self.tracks.write().await;
        let track = tracks
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("track {id} not found")))?;

        track.cached_duration = Some(seconds);
        self.persist(&tracks).await
    }

    async fn insert(&self, track: Track) -> Result<()> {
        let mut tracks = self.tracks.write().await;
        if tracks.contains_key(&track.id) {
            return Err(Error::already_exists(format!(
                "track {} already exists",
                track.id
            )));
        }

        info!("adding track {track}");
        tracks.insert(track.id.clone(), track);
        self.persist(&tracks).await
    }
}
