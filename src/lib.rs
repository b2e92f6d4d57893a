//! Duet: a temporal scheduling engine for playing along with a generative
//! music model.
//!
//! The [`engine::Engine`] captures a player's phrase, infers its tempo, primes
//! the model with it and then keeps the model's continuation flowing onto a
//! seekable transport. Rewinds fork the history and replay its tail; an idle
//! watchdog closes sessions nobody is playing.

pub mod active;
pub mod archive;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod generation;
pub mod history;
pub mod midi;
pub mod model;
pub mod note;
pub mod rewind;
pub mod runtime;
pub mod scheduler;
pub mod seeding;
pub mod sink;
pub mod watchdog;

pub use config::DuetConfig;
pub use engine::{Engine, InputEvent, RewindOutcome};
pub use history::History;
