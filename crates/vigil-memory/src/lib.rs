//! `vigil-memory` – Persistent safety state.
//!
//! Keeps the observatory's decisions on disk in a local SQLite substrate so
//! a restarted process resumes with the same latches, recovery holds and
//! emergency stage it crashed with.
//!
//! # Modules
//!
//! - [`journal`] – [`Journal`][journal::Journal]: append-only log of verdicts,
//!   hysteresis state, stages, command outcomes, events and sessions, with
//!   [`recover`][journal::Journal::recover] for start-up.

pub mod journal;

pub use journal::{Journal, JournalEntry, JournalError, JournalKind, RecoveredState};
