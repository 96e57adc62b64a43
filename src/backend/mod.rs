//! Platform seam.
//!
//! The orchestrator talks to Discord only through [`VoiceBackend`], so the
//! whole coordination layer runs against an in-memory double in tests. All
//! methods are fire-and-collect: callers run them in spawned tasks and feed
//! the results back into the event queue.

pub mod discord;

use crate::error::OrchestrateError;
use crate::session::SharedCapture;
use crate::workers::WorkerId;
use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId, UserId};

/// A voice channel as seen on the platform, used for startup adoption.
#[derive(Debug, Clone)]
pub struct RoomInfo {
    pub room: ChannelId,
    pub name: String,
    pub occupants: Vec<UserId>,
}

#[async_trait]
pub trait VoiceBackend: Send + Sync + 'static {
    /// Create a voice channel named `label` capped at `capacity` members.
    async fn create_room(
        &self,
        guild: GuildId,
        label: &str,
        capacity: u32,
    ) -> Result<ChannelId, OrchestrateError>;

    async fn delete_room(&self, guild: GuildId, room: ChannelId) -> Result<(), OrchestrateError>;

    /// Move `member` into `room`. A member already there is a no-op; a
    /// member who left voice or a vanished room is a lost race, reported
    /// without retry.
    async fn move_member(
        &self,
        guild: GuildId,
        member: UserId,
        room: ChannelId,
    ) -> Result<(), OrchestrateError>;

    /// Every voice channel in `guild` with its current occupants.
    async fn list_rooms(&self, guild: GuildId) -> Result<Vec<RoomInfo>, OrchestrateError>;

    /// Current occupants of a single channel.
    async fn room_occupants(
        &self,
        guild: GuildId,
        room: ChannelId,
    ) -> Result<Vec<UserId>, OrchestrateError>;

    /// Connect `worker`'s voice driver to `room` and wire its received
    /// audio into `capture`.
    async fn begin_capture(
        &self,
        worker: WorkerId,
        guild: GuildId,
        room: ChannelId,
        capture: SharedCapture,
    ) -> Result<(), OrchestrateError>;

    /// Tear down `worker`'s voice connection in `guild`.
    async fn end_capture(&self, worker: WorkerId, guild: GuildId) -> Result<(), OrchestrateError>;
}
