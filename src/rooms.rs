//! Typed registry of numbered rooms.
//!
//! Room identity lives here, not in channel labels: records are keyed by
//! channel id and carry their sequence number, so nothing downstream ever
//! parses a label to decide what a channel is. Labels are parsed in exactly
//! one place, during startup adoption of pre-existing channels.
//!
//! Sequence allocation is two-phase. `reserve` hands out the smallest unused
//! number and marks it pending so the platform create call can run off the
//! event loop without a second caller being given the same number; `commit`
//! or `abandon` settles the reservation when the create completes.

use serenity::model::id::{ChannelId, GuildId};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A live numbered room.
#[derive(Debug, Clone)]
pub struct RoomRecord {
    pub room: ChannelId,
    pub guild: GuildId,
    pub seq: u16,
    pub label: String,
}

#[derive(Debug)]
pub struct RoomPool {
    prefix: String,
    max_rooms: u16,
    live: HashMap<GuildId, BTreeMap<u16, RoomRecord>>,
    pending: HashMap<GuildId, BTreeSet<u16>>,
    by_id: HashMap<ChannelId, (GuildId, u16)>,
}

impl RoomPool {
    pub fn new(prefix: impl Into<String>, max_rooms: u16) -> Self {
        Self {
            prefix: prefix.into(),
            max_rooms,
            live: HashMap::new(),
            pending: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn label(&self, seq: u16) -> String {
        format!("{}{}", self.prefix, seq)
    }

    /// The sequence number a channel label denotes, if it matches the
    /// configured prefix. Only the adoption path uses this.
    pub fn parse_label(&self, name: &str) -> Option<u16> {
        let seq: u16 = name.strip_prefix(&self.prefix)?.parse().ok()?;
        (seq >= 1).then_some(seq)
    }

    /// Reserve the smallest sequence number in `1..=max_rooms` that is
    /// neither live nor already reserved. `None` when the guild is at the
    /// room ceiling.
    pub fn reserve(&mut self, guild: GuildId) -> Option<u16> {
        let live = self.live.get(&guild);
        let pending = self.pending.entry(guild).or_default();
        let seq = (1..=self.max_rooms).find(|seq| {
            !pending.contains(seq) && live.is_none_or(|rooms| !rooms.contains_key(seq))
        })?;
        pending.insert(seq);
        Some(seq)
    }

    /// Give a reserved sequence number back without creating a room.
    pub fn abandon(&mut self, guild: GuildId, seq: u16) {
        if let Some(pending) = self.pending.get_mut(&guild) {
            pending.remove(&seq);
        }
    }

    /// Promote a reservation (or a startup adoption, which never reserves)
    /// to a live record. Refused when the sequence number already belongs
    /// to a different channel, keeping the two maps in step.
    pub fn commit(&mut self, guild: GuildId, seq: u16, room: ChannelId) -> bool {
        self.abandon(guild, seq);
        let label = self.label(seq);
        let live = self.live.entry(guild).or_default();
        if live.get(&seq).is_some_and(|taken| taken.room != room) {
            return false;
        }
        let record = RoomRecord {
            room,
            guild,
            seq,
            label,
        };
        live.insert(seq, record);
        self.by_id.insert(room, (guild, seq));
        true
    }

    /// Drop the record for `room`, freeing its sequence number for reuse.
    pub fn remove(&mut self, room: ChannelId) -> Option<RoomRecord> {
        let (guild, seq) = self.by_id.remove(&room)?;
        self.live.get_mut(&guild)?.remove(&seq)
    }

    pub fn contains(&self, room: ChannelId) -> bool {
        self.by_id.contains_key(&room)
    }
}
