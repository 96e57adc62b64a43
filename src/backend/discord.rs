//! Serenity/songbird implementation of the platform seam.
//!
//! HTTP and cache come from the main bot's client. Voice drivers belong to
//! the recorder clients; each one registers its songbird instance here when
//! it logs in, keyed by worker id.

use super::{RoomInfo, VoiceBackend};
use crate::error::OrchestrateError;
use crate::session::{Receiver, SharedCapture};
use crate::workers::WorkerId;
use async_trait::async_trait;
use dashmap::DashMap;
use serenity::builder::CreateChannel;
use serenity::cache::Cache;
use serenity::http::Http;
use serenity::model::channel::{ChannelType, PermissionOverwrite, PermissionOverwriteType};
use serenity::model::id::{ChannelId, GuildId, RoleId, UserId};
use serenity::model::permissions::Permissions;
use songbird::{CoreEvent, Songbird};
use std::sync::Arc;
use tracing::debug;

pub type WorkerRegistry = Arc<DashMap<WorkerId, Arc<Songbird>>>;

pub struct DiscordBackend {
    http: Arc<Http>,
    cache: Arc<Cache>,
    workers: WorkerRegistry,
}

impl DiscordBackend {
    pub fn new(http: Arc<Http>, cache: Arc<Cache>, workers: WorkerRegistry) -> Self {
        Self {
            http,
            cache,
            workers,
        }
    }

    fn driver(&self, worker: WorkerId) -> Result<Arc<Songbird>, OrchestrateError> {
        self.workers
            .get(&worker)
            .map(|entry| Arc::clone(&entry))
            .ok_or_else(|| {
                OrchestrateError::race("capture", format!("worker {worker} has no voice driver"))
            })
    }
}

#[async_trait]
impl VoiceBackend for DiscordBackend {
    async fn create_room(
        &self,
        guild: GuildId,
        label: &str,
        capacity: u32,
    ) -> Result<ChannelId, OrchestrateError> {
        // The everyone role shares the guild's id.
        let everyone = RoleId::new(guild.get());
        let builder = CreateChannel::new(label)
            .kind(ChannelType::Voice)
            .user_limit(capacity)
            .permissions(vec![PermissionOverwrite {
                allow: Permissions::CONNECT | Permissions::VIEW_CHANNEL,
                deny: Permissions::empty(),
                kind: PermissionOverwriteType::Role(everyone),
            }]);
        let channel = guild
            .create_channel(&self.http, builder)
            .await
            .map_err(OrchestrateError::remote)?;
        debug!(%guild, room = %channel.id, label, "voice channel created");
        Ok(channel.id)
    }

    async fn delete_room(
        &self,
        _guild: GuildId,
        room: ChannelId,
    ) -> Result<(), OrchestrateError> {
        room.delete(&self.http)
            .await
            .map(|_| ())
            .map_err(OrchestrateError::remote)
    }

    async fn move_member(
        &self,
        guild: GuildId,
        member: UserId,
        room: ChannelId,
    ) -> Result<(), OrchestrateError> {
        let current = self
            .cache
            .guild(guild)
            .and_then(|g| g.voice_states.get(&member).and_then(|vs| vs.channel_id));
        match current {
            Some(channel) if channel == room => return Ok(()),
            None => {
                return Err(OrchestrateError::race(
                    "relocate",
                    format!("member {member} left voice before the move"),
                ));
            }
            _ => {}
        }
        guild
            .move_member(&self.http, member, room)
            .await
            .map(|_| ())
            .map_err(|e| OrchestrateError::race("relocate", e.to_string()))
    }

    async fn list_rooms(&self, guild: GuildId) -> Result<Vec<RoomInfo>, OrchestrateError> {
        let Some(guild_ref) = self.cache.guild(guild) else {
            return Err(OrchestrateError::race(
                "adoption",
                format!("guild {guild} not in cache"),
            ));
        };
        let mut rooms = Vec::new();
        for (id, channel) in &guild_ref.channels {
            if channel.kind != ChannelType::Voice {
                continue;
            }
            let occupants = guild_ref
                .voice_states
                .iter()
                .filter(|(_, vs)| vs.channel_id == Some(*id))
                .map(|(user, _)| *user)
                .collect();
            rooms.push(RoomInfo {
                room: *id,
                name: channel.name.clone(),
                occupants,
            });
        }
        Ok(rooms)
    }

    async fn room_occupants(
        &self,
        guild: GuildId,
        room: ChannelId,
    ) -> Result<Vec<UserId>, OrchestrateError> {
        let Some(guild_ref) = self.cache.guild(guild) else {
            return Err(OrchestrateError::race(
                "occupant lookup",
                format!("guild {guild} not in cache"),
            ));
        };
        Ok(guild_ref
            .voice_states
            .iter()
            .filter(|(_, vs)| vs.channel_id == Some(room))
            .map(|(user, _)| *user)
            .collect())
    }

    async fn begin_capture(
        &self,
        worker: WorkerId,
        guild: GuildId,
        room: ChannelId,
        capture: SharedCapture,
    ) -> Result<(), OrchestrateError> {
        let driver = self.driver(worker)?;
        let call = driver
            .join(guild, room)
            .await
            .map_err(OrchestrateError::remote)?;
        let mut handler = call.lock().await;
        handler.add_global_event(
            CoreEvent::SpeakingStateUpdate.into(),
            Receiver::new(Arc::clone(&capture)),
        );
        handler.add_global_event(CoreEvent::VoiceTick.into(), Receiver::new(capture));
        debug!(worker, %room, "capture wired into the voice driver");
        Ok(())
    }

    async fn end_capture(
        &self,
        worker: WorkerId,
        guild: GuildId,
    ) -> Result<(), OrchestrateError> {
        let driver = self.driver(worker)?;
        driver
            .remove(guild)
            .await
            .map_err(|e| OrchestrateError::race("capture teardown", e.to_string()))
    }
}
