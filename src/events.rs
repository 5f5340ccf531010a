//! Events emitted by the player.
//!
//! Observers subscribe with [`Player::with_events`](crate::player::Player::with_events)
//! and read the details of the new state from the player's session. Events
//! never carry tunnel URLs.
//!
//! # Example
//!
//! ```rust
//! use tunnelplay::events::Event;
//!
//! fn handle_event(event: Event) {
//!     match event {
//!         Event::Play => println!("Playback started"),
//!         Event::TrackChanged => println!("New track loading"),
//!         Event::Error => println!("Could not play this track"),
//!         _ => {}
//!     }
//! }
//! ```

/// Significant state changes of the playback session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// A different track became active, or the active track is loaded anew.
    TrackChanged,

    /// Decoding started, either for the first time or after a recovery.
    Play,

    /// Playback paused and can be resumed from the current position.
    Pause,

    /// The active track played to its end.
    Ended,

    /// The stream URL of the active track expired and is being replaced.
    Recovering,

    /// The active track cannot be played. Only an explicit play retries.
    Error,

    /// Playback stopped and no track is active anymore.
    Stop,
}
