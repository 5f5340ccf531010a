//! Playback of short-lived streaming tunnels.
//!
//! Tracks are references to a hosting platform. An extraction service turns
//! their durable source links into playable tunnel URLs that expire without
//! notice. This crate resolves and caches those URLs, re-resolves them on
//! demand behind a refresh endpoint, and plays them back with one audio
//! pipeline that heals itself once when a tunnel dies mid-session.
//!
//! # Components
//!
//! * [`extractor`] - client of the extraction service
//! * [`cache`] - process-local resolution cache with a fixed TTL
//! * [`refresh`] and [`server`] - the refresh endpoint, in-process and over
//!   HTTP
//! * [`player`] and [`audio`] - the playback state machine and its audio
//!   output
//! * [`heal`] - classification of decode failures and the one-retry guard
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod audio;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod extractor;
pub mod heal;
pub mod http;
pub mod player;
pub mod protocol;
pub mod refresh;
pub mod server;
pub mod signal;
pub mod store;
pub mod track;
