//! Recording session state.

pub mod receiver;
pub mod sink;

pub use receiver::{CaptureState, Receiver, SharedCapture};
pub use sink::SinkWriter;

use crate::timer::TimerHandle;
use crate::workers::WorkerId;
use chrono::{DateTime, Utc};
use serenity::model::id::{ChannelId, GuildId};
use std::io;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;

/// Timestamp format used in artifact names, `YYYYMMDD_hhmmss` in UTC.
pub const TIMESTAMP_FMT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Capturing. The room has, or recently had, tracked occupants.
    Active,
    /// Room emptied; waiting out the grace window for a rejoin.
    GraceWait,
    /// Winding down: sink draining, artifact heading into the pipeline.
    /// Entered exactly once; every later stop request is ignored.
    Stopping,
}

/// Why a session left Active/GraceWait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    GraceExpired,
    SilenceTimeout,
    Manual,
}

/// One recording session, owned by the orchestrator and keyed by room.
///
/// A session exists from the first tracked join until its finalization
/// completes; "idle" is simply the absence of an entry. The two timers are
/// independent: cancelling one must never invalidate the other, so each
/// carries its own epoch counter and expiry events are checked against the
/// current epoch before they are believed.
pub struct RecordingSession {
    pub guild: GuildId,
    pub room: ChannelId,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    /// Recorder bound to this room. `None` when the pool was exhausted or
    /// capture setup failed; the session then runs without audio.
    pub worker: Option<WorkerId>,
    pub capture: Option<SharedCapture>,
    pub writer: Option<JoinHandle<io::Result<u64>>>,
    /// In-progress artifact, named after the start timestamp only. The
    /// finalizer renames it once the end timestamp is known.
    pub raw_path: PathBuf,
    pub grace_timer: Option<TimerHandle>,
    pub grace_epoch: u64,
    pub silence_timer: Option<TimerHandle>,
    pub silence_epoch: u64,
}

impl RecordingSession {
    pub fn new(guild: GuildId, room: ChannelId, recordings_dir: &Path) -> Self {
        let started_at = Utc::now();
        let raw_path = recordings_dir.join(format!(
            "recording-{}-{}.pcm",
            room,
            started_at.format(TIMESTAMP_FMT)
        ));
        Self {
            guild,
            room,
            state: SessionState::Active,
            started_at,
            worker: None,
            capture: None,
            writer: None,
            raw_path,
            grace_timer: None,
            grace_epoch: 0,
            silence_timer: None,
            silence_epoch: 0,
        }
    }

    /// Abort the grace timer and invalidate any expiry already in flight.
    pub fn cancel_grace(&mut self) {
        if let Some(timer) = self.grace_timer.take() {
            timer.cancel();
        }
        self.grace_epoch += 1;
    }

    /// Abort the silence timer and invalidate any expiry already in flight.
    pub fn cancel_silence(&mut self) {
        if let Some(timer) = self.silence_timer.take() {
            timer.cancel();
        }
        self.silence_epoch += 1;
    }
}
