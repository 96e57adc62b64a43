//! Room and session coordination.
//!
//! One task owns every piece of mutable state: the room registry, the worker
//! pool, the live sessions and the occupancy mirror. Everything reaches it
//! through a single event queue, so there are no locks around state and no
//! interleaving within a handler. Platform calls that might take time run in
//! spawned tasks and re-enter the queue as completion events.

use crate::backend::{RoomInfo, VoiceBackend};
use crate::config::Config;
use crate::error::OrchestrateError;
use crate::pipeline::{Artifact, PipelineError, UploadPipeline, UploadReport};
use crate::rooms::RoomPool;
use crate::session::{
    CaptureState, RecordingSession, SessionState, SharedCapture, SinkWriter, StopReason,
};
use crate::timer;
use crate::workers::{WorkerId, WorkerPool};
use chrono::{DateTime, Utc};
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Everything that can reach the orchestrator's queue. Occupancy events come
/// from the gateway; the rest are completions and timer expiries re-entering
/// the loop.
#[derive(Debug)]
pub enum Event {
    /// A member's voice channel changed. `None` means not in voice.
    Occupancy {
        guild: GuildId,
        member: UserId,
        from: Option<ChannelId>,
        to: Option<ChannelId>,
    },
    /// A guild became visible; its channels can be listed for adoption.
    GuildAvailable { guild: GuildId },
    RoomsListed {
        guild: GuildId,
        rooms: Vec<RoomInfo>,
    },
    /// A recorder client finished logging in.
    WorkerOnline { worker: WorkerId, user: UserId },
    RoomCreated {
        guild: GuildId,
        seq: u16,
        room: ChannelId,
    },
    RoomCreateFailed {
        guild: GuildId,
        seq: u16,
        error: OrchestrateError,
    },
    Relocated {
        guild: GuildId,
        room: ChannelId,
        member: UserId,
        origin: ChannelId,
        result: Result<(), OrchestrateError>,
    },
    CaptureReady {
        guild: GuildId,
        room: ChannelId,
        worker: WorkerId,
        result: Result<(), OrchestrateError>,
    },
    /// A worker's voice connection is fully torn down. Frees the slot only
    /// if the worker is still bound to the named room.
    CaptureEnded { worker: WorkerId, room: ChannelId },
    GraceExpired { room: ChannelId, epoch: u64 },
    SilenceExpired { room: ChannelId, epoch: u64 },
    SessionFinished {
        guild: GuildId,
        room: ChannelId,
        reason: StopReason,
        result: Result<Option<UploadReport>, PipelineError>,
    },
    ManualStart { guild: GuildId, room: ChannelId },
    ManualStop { guild: GuildId, room: ChannelId },
}

pub struct Orchestrator {
    backend: Arc<dyn VoiceBackend>,
    pipeline: Arc<UploadPipeline>,
    tx: UnboundedSender<Event>,
    rooms: RoomPool,
    workers: WorkerPool,
    sessions: HashMap<ChannelId, RecordingSession>,
    /// Non-worker occupants of every tracked channel, numbered or manually
    /// recorded, maintained from the event stream.
    occupancy: HashMap<ChannelId, HashSet<UserId>>,
    /// Last gateway-reported voice channel of every member, tracked or not.
    /// Relocation completions are checked against this so a completion the
    /// gateway has already overtaken does not re-apply a stale move.
    locations: HashMap<UserId, ChannelId>,
    max_rooms: u16,
    room_capacity: u32,
    grace_period: Duration,
    silence_timeout: Duration,
    recordings_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        backend: Arc<dyn VoiceBackend>,
        pipeline: Arc<UploadPipeline>,
        tx: UnboundedSender<Event>,
    ) -> Self {
        Self {
            backend,
            pipeline,
            tx,
            rooms: RoomPool::new(config.room_prefix.clone(), config.max_rooms),
            workers: WorkerPool::new(config.recorder_tokens.len()),
            sessions: HashMap::new(),
            occupancy: HashMap::new(),
            locations: HashMap::new(),
            max_rooms: config.max_rooms,
            room_capacity: config.room_capacity,
            grace_period: config.grace_period,
            silence_timeout: config.silence_timeout,
            recordings_dir: config.recordings_dir.clone(),
        }
    }

    pub async fn run(mut self, mut rx: UnboundedReceiver<Event>) {
        info!(
            max_rooms = self.max_rooms,
            capacity = self.room_capacity,
            workers = self.workers.size(),
            "orchestrator running"
        );
        while let Some(event) = rx.recv().await {
            self.handle(event).await;
        }
        info!("orchestrator stopped");
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Occupancy {
                guild,
                member,
                from,
                to,
            } => {
                if self.workers.is_worker(member) {
                    return;
                }
                if from == to {
                    // Mute and deafen toggles arrive as voice updates too.
                    return;
                }
                match to {
                    Some(room) => {
                        self.locations.insert(member, room);
                    }
                    None => {
                        self.locations.remove(&member);
                    }
                }
                if let Some(room) = from {
                    self.member_left(member, room).await;
                }
                if let Some(room) = to {
                    self.member_joined(guild, member, room).await;
                }
            }
            Event::GuildAvailable { guild } => {
                let backend = Arc::clone(&self.backend);
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    match backend.list_rooms(guild).await {
                        Ok(rooms) => {
                            let _ = tx.send(Event::RoomsListed { guild, rooms });
                        }
                        Err(error) => {
                            warn!(%guild, %error, "channel listing failed; skipping adoption");
                        }
                    }
                });
            }
            Event::RoomsListed { guild, rooms } => self.adopt_rooms(guild, rooms),
            Event::WorkerOnline { worker, user } => {
                self.workers.set_online(worker, user);
                self.locations.remove(&user);
                // Recorders never count as occupants, including in mirrors
                // built before this identity was known. A mirror the scrub
                // empties takes the same path a last leave would.
                let mut emptied = Vec::new();
                for (room, occupants) in &mut self.occupancy {
                    if occupants.remove(&user) && occupants.is_empty() {
                        emptied.push(*room);
                    }
                }
                for room in emptied {
                    if self.sessions.contains_key(&room) {
                        self.enter_grace(room);
                    } else if self.rooms.contains(room) {
                        self.reap_room(room);
                    }
                }
            }
            Event::RoomCreated { guild, seq, room } => {
                self.rooms.commit(guild, seq, room);
                self.occupancy.entry(room).or_default();
                info!(%guild, %room, seq, "room created");
            }
            Event::RoomCreateFailed { guild, seq, error } => {
                self.rooms.abandon(guild, seq);
                warn!(%guild, seq, %error, "room creation failed; member stays put");
            }
            Event::Relocated {
                guild,
                room,
                member,
                origin,
                result,
            } => match result {
                Ok(()) => {
                    // Apply the move only while the member is still where the
                    // move found them. The HTTP completion and the gateway
                    // echo arrive on unsynchronized connections; once the
                    // echo (or any later move or leave) has been processed,
                    // replaying the completion would resurrect a member who
                    // is no longer there.
                    if self.locations.get(&member) == Some(&origin) {
                        self.locations.insert(member, room);
                        self.member_left(member, origin).await;
                        self.member_joined(guild, member, room).await;
                    } else {
                        debug!(%room, %member, "relocation already overtaken by the gateway");
                    }
                }
                Err(error) => {
                    warn!(%room, %member, %error, "relocation lost; leaving the member in place");
                    let unused = self.occupancy.get(&room).is_none_or(|o| o.is_empty());
                    if unused && !self.sessions.contains_key(&room) {
                        self.reap_room(room);
                    }
                }
            },
            Event::CaptureReady {
                guild,
                room,
                worker,
                result,
            } => self.capture_ready(guild, room, worker, result).await,
            Event::CaptureEnded { worker, room } => self.workers.release_from(worker, room),
            Event::GraceExpired { room, epoch } => {
                let valid = self
                    .sessions
                    .get(&room)
                    .is_some_and(|s| s.state == SessionState::GraceWait && s.grace_epoch == epoch);
                if valid {
                    self.stop_session(room, StopReason::GraceExpired);
                } else {
                    debug!(%room, epoch, "stale grace expiry ignored");
                }
            }
            Event::SilenceExpired { room, epoch } => {
                let valid = self
                    .sessions
                    .get(&room)
                    .is_some_and(|s| s.state != SessionState::Stopping && s.silence_epoch == epoch);
                if valid {
                    info!(%room, "session hit the duration cap");
                    self.stop_session(room, StopReason::SilenceTimeout);
                } else {
                    debug!(%room, epoch, "stale duration cap ignored");
                }
            }
            Event::SessionFinished {
                guild,
                room,
                reason,
                result,
            } => self.session_finished(guild, room, reason, result),
            Event::ManualStart { guild, room } => self.manual_start(guild, room).await,
            Event::ManualStop { guild: _, room } => {
                if self.sessions.contains_key(&room) {
                    info!(%room, "manual recording stop");
                    self.stop_session(room, StopReason::Manual);
                } else {
                    info!(%room, "manual stop ignored; nothing recording");
                }
            }
        }
    }

    async fn member_left(&mut self, member: UserId, room: ChannelId) {
        let Some(occupants) = self.occupancy.get_mut(&room) else {
            return; // untracked channel
        };
        if !occupants.remove(&member) {
            return; // duplicate event, or a member predating our tracking
        }
        let emptied = occupants.is_empty();
        if let Some(session) = self.sessions.get(&room) {
            if let Some(capture) = &session.capture {
                capture.lock().await.members.remove(&member);
            }
        }
        if !emptied {
            return;
        }
        if self.sessions.contains_key(&room) {
            self.enter_grace(room);
        } else if self.rooms.contains(room) {
            self.reap_room(room);
        }
    }

    async fn member_joined(&mut self, guild: GuildId, member: UserId, room: ChannelId) {
        if self.rooms.contains(room) {
            let occupants = self.occupancy.entry(room).or_default();
            if !occupants.insert(member) {
                return; // echo of a relocation already applied
            }
            if occupants.len() as u32 > self.room_capacity {
                // The newcomer stays in the count until their move lands,
                // keeping the room visibly occupied throughout.
                debug!(%room, %member, "room full; relocating the newcomer");
                self.assign_new_room(guild, member, room);
                return;
            }
            if self.sessions.contains_key(&room) {
                self.refresh_session(room, member).await;
            } else {
                self.start_session(guild, room);
            }
        } else if self.sessions.contains_key(&room) {
            // Channel under a manual recording: tracked, never rerouted.
            self.occupancy.entry(room).or_default().insert(member);
            self.refresh_session(room, member).await;
        } else {
            self.assign_new_room(guild, member, room);
        }
    }

    /// Reserve the next room number and create a channel for `member` off
    /// the event loop. `origin` is wherever they are sitting right now.
    fn assign_new_room(&mut self, guild: GuildId, member: UserId, origin: ChannelId) {
        let Some(seq) = self.rooms.reserve(guild) else {
            let error = OrchestrateError::ResourceExhausted {
                resource: "rooms",
                limit: self.max_rooms as usize,
            };
            warn!(%guild, %member, %error, "member stays put");
            return;
        };
        let label = self.rooms.label(seq);
        let capacity = self.room_capacity;
        let backend = Arc::clone(&self.backend);
        let tx = self.tx.clone();
        info!(%guild, %member, label, "allocating a fresh room");
        tokio::spawn(async move {
            let room = match backend.create_room(guild, &label, capacity).await {
                Ok(room) => {
                    // Committed before the move so the gateway echo of the
                    // move always finds the room in the registry.
                    let _ = tx.send(Event::RoomCreated { guild, seq, room });
                    room
                }
                Err(error) => {
                    let _ = tx.send(Event::RoomCreateFailed { guild, seq, error });
                    return;
                }
            };
            let result = backend.move_member(guild, member, room).await;
            let _ = tx.send(Event::Relocated {
                guild,
                room,
                member,
                origin,
                result,
            });
        });
    }

    fn start_session(&mut self, guild: GuildId, room: ChannelId) {
        if self.sessions.contains_key(&room) {
            return;
        }
        let mut session = RecordingSession::new(guild, room, &self.recordings_dir);
        session.silence_epoch += 1;
        session.silence_timer = Some(timer::schedule(
            self.silence_timeout,
            self.tx.clone(),
            Event::SilenceExpired {
                room,
                epoch: session.silence_epoch,
            },
        ));
        match self.workers.acquire(room) {
            Some(worker) => match SinkWriter::create(session.raw_path.clone()) {
                Ok((sink, writer)) => {
                    let members = self.occupancy.get(&room).cloned().unwrap_or_default();
                    let capture: SharedCapture =
                        Arc::new(Mutex::new(CaptureState::new(members, sink)));
                    session.worker = Some(worker);
                    session.capture = Some(Arc::clone(&capture));
                    session.writer = Some(tokio::spawn(writer.run()));
                    let backend = Arc::clone(&self.backend);
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        let result = backend.begin_capture(worker, guild, room, capture).await;
                        let _ = tx.send(Event::CaptureReady {
                            guild,
                            room,
                            worker,
                            result,
                        });
                    });
                    info!(%room, worker, "recording session started");
                }
                Err(error) => {
                    error!(%room, %error, "sink setup failed; session runs without capture");
                    self.workers.release(worker);
                }
            },
            None => {
                let error = OrchestrateError::ResourceExhausted {
                    resource: "recorder workers",
                    limit: self.workers.size(),
                };
                warn!(%room, %error, "session runs without capture");
            }
        }
        self.sessions.insert(room, session);
    }

    /// Fold a joining member into the room's running session.
    async fn refresh_session(&mut self, room: ChannelId, member: UserId) {
        let Some(session) = self.sessions.get_mut(&room) else {
            return;
        };
        if let Some(capture) = &session.capture {
            capture.lock().await.members.insert(member);
        }
        if session.state == SessionState::GraceWait {
            session.state = SessionState::Active;
            session.cancel_grace();
            info!(%room, %member, "member rejoined; grace cancelled");
        }
    }

    fn enter_grace(&mut self, room: ChannelId) {
        let grace = self.grace_period;
        let tx = self.tx.clone();
        let Some(session) = self.sessions.get_mut(&room) else {
            return;
        };
        if session.state != SessionState::Active {
            return;
        }
        session.state = SessionState::GraceWait;
        session.grace_epoch += 1;
        let epoch = session.grace_epoch;
        session.grace_timer = Some(timer::schedule(
            grace,
            tx,
            Event::GraceExpired { room, epoch },
        ));
        info!(%room, grace_secs = grace.as_secs(), "room empty; grace running");
    }

    /// Move the session into Stopping and hand finalization to a task.
    /// Idempotent: only the first stop per session does anything.
    fn stop_session(&mut self, room: ChannelId, reason: StopReason) {
        let Some(session) = self.sessions.get_mut(&room) else {
            return;
        };
        if session.state == SessionState::Stopping {
            return;
        }
        session.state = SessionState::Stopping;
        session.cancel_grace();
        session.cancel_silence();
        info!(%room, ?reason, "recording session stopping");
        let finalizer = Finalizer {
            backend: Arc::clone(&self.backend),
            pipeline: Arc::clone(&self.pipeline),
            tx: self.tx.clone(),
            guild: session.guild,
            room: session.room,
            reason,
            worker: session.worker,
            capture: session.capture.take(),
            writer: session.writer.take(),
            raw_path: session.raw_path.clone(),
            started_at: session.started_at,
        };
        tokio::spawn(finalizer.run());
    }

    async fn capture_ready(
        &mut self,
        guild: GuildId,
        room: ChannelId,
        worker: WorkerId,
        result: Result<(), OrchestrateError>,
    ) {
        match result {
            Ok(()) => {
                let stale = match self.sessions.get(&room) {
                    Some(session) => {
                        session.state == SessionState::Stopping || session.worker != Some(worker)
                    }
                    None => true,
                };
                if stale {
                    // Tear down only while the worker still belongs to this
                    // room. Once the pool has moved it on, the connection is
                    // a newer session's and must be left alone.
                    if self.workers.bound_room(worker) == Some(room) {
                        debug!(%room, worker, "capture connected after its session ended; disconnecting");
                        self.disconnect_worker(worker, guild, room);
                    } else {
                        debug!(%room, worker, "stale capture completion for a rebound worker; ignored");
                    }
                }
            }
            Err(error) => {
                warn!(%room, worker, %error, "capture failed to start; session continues without audio");
                if let Some(session) = self.sessions.get_mut(&room) {
                    if session.worker == Some(worker) {
                        session.worker = None;
                        if let Some(capture) = session.capture.take() {
                            if let Some(sink) = capture.lock().await.stop() {
                                sink.finish();
                            }
                        }
                        if let Some(writer) = session.writer.take() {
                            let raw = session.raw_path.clone();
                            tokio::spawn(async move {
                                let _ = writer.await;
                                remove_quietly(&raw).await;
                            });
                        }
                    }
                }
                self.workers.release_from(worker, room);
            }
        }
    }

    fn session_finished(
        &mut self,
        guild: GuildId,
        room: ChannelId,
        reason: StopReason,
        result: Result<Option<UploadReport>, PipelineError>,
    ) {
        let session = self.sessions.remove(&room);
        match &result {
            Ok(Some(report)) => {
                info!(
                    %room,
                    audio = report.audio_key.as_deref().unwrap_or(""),
                    transcript = report.transcript_key.is_some(),
                    summary = report.summary_key.is_some(),
                    "recording uploaded"
                );
            }
            Ok(None) => info!(%room, "session closed with no audio"),
            Err(error) => {
                let started = session.as_ref().map(|s| s.started_at.to_rfc3339());
                error!(%room, ?reason, ?started, %error, "recording pipeline failed");
            }
        }
        let occupied = self.occupancy.get(&room).is_some_and(|o| !o.is_empty());
        if self.rooms.contains(room) {
            if occupied && reason == StopReason::GraceExpired {
                // Someone came back while the last take was winding down;
                // they get a session of their own.
                info!(%room, "room reoccupied during wind-down; starting fresh");
                self.start_session(guild, room);
            } else if !occupied {
                self.reap_room(room);
            }
        } else {
            // Manually recorded channels are never deleted; once their
            // session ends they revert to normal routing.
            self.occupancy.remove(&room);
        }
    }

    async fn manual_start(&mut self, guild: GuildId, room: ChannelId) {
        if self.sessions.contains_key(&room) {
            info!(%room, "manual start ignored; already recording");
            return;
        }
        if !self.occupancy.contains_key(&room) {
            match self.backend.room_occupants(guild, room).await {
                Ok(users) => {
                    let members: HashSet<UserId> = users
                        .into_iter()
                        .filter(|user| !self.workers.is_worker(*user))
                        .collect();
                    self.occupancy.insert(room, members);
                }
                Err(error) => {
                    warn!(%room, %error, "manual start failed; cannot read the channel");
                    return;
                }
            }
        }
        info!(%room, "manual recording start");
        self.start_session(guild, room);
    }

    fn adopt_rooms(&mut self, guild: GuildId, rooms: Vec<RoomInfo>) {
        for info in rooms {
            let Some(seq) = self.rooms.parse_label(&info.name) else {
                continue;
            };
            if self.rooms.contains(info.room) {
                continue;
            }
            let occupants: HashSet<UserId> = info
                .occupants
                .iter()
                .copied()
                .filter(|user| !self.workers.is_worker(*user))
                .collect();
            if occupants.is_empty() {
                info!(room = %info.room, label = info.name, "adopting empty room; deleting");
                self.delete_channel(guild, info.room);
            } else if self.rooms.commit(guild, seq, info.room) {
                info!(
                    room = %info.room,
                    label = info.name,
                    members = occupants.len(),
                    "adopting occupied room"
                );
                self.occupancy.insert(info.room, occupants);
                self.start_session(guild, info.room);
            } else {
                // Two channels wearing the same label; the first one
                // adopted keeps it and this one is left untouched.
                warn!(room = %info.room, label = info.name, "duplicate label; channel not adopted");
            }
        }
    }

    /// Forget a numbered room and delete its channel. The sequence number is
    /// reusable immediately; deletion failures only orphan the channel.
    fn reap_room(&mut self, room: ChannelId) {
        self.occupancy.remove(&room);
        let Some(record) = self.rooms.remove(room) else {
            return; // already reaped
        };
        info!(%room, label = record.label, "room empty; deleting");
        self.delete_channel(record.guild, record.room);
    }

    fn delete_channel(&self, guild: GuildId, room: ChannelId) {
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            if let Err(error) = backend.delete_room(guild, room).await {
                warn!(%room, %error, "room delete failed; channel may be orphaned");
            }
        });
    }

    fn disconnect_worker(&self, worker: WorkerId, guild: GuildId, room: ChannelId) {
        let backend = Arc::clone(&self.backend);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if let Err(error) = backend.end_capture(worker, guild).await {
                debug!(worker, %error, "voice disconnect failed");
            }
            let _ = tx.send(Event::CaptureEnded { worker, room });
        });
    }
}

/// Winds one stopped session down off the event loop: drains the sink,
/// disconnects the worker, renames the artifact and runs the pipeline.
struct Finalizer {
    backend: Arc<dyn VoiceBackend>,
    pipeline: Arc<UploadPipeline>,
    tx: UnboundedSender<Event>,
    guild: GuildId,
    room: ChannelId,
    reason: StopReason,
    worker: Option<WorkerId>,
    capture: Option<SharedCapture>,
    writer: Option<JoinHandle<io::Result<u64>>>,
    raw_path: PathBuf,
    started_at: DateTime<Utc>,
}

impl Finalizer {
    async fn run(mut self) {
        let result = self.execute().await;
        let _ = self.tx.send(Event::SessionFinished {
            guild: self.guild,
            room: self.room,
            reason: self.reason,
            result,
        });
    }

    async fn execute(&mut self) -> Result<Option<UploadReport>, PipelineError> {
        // Close the sink first so the writer drains every queued chunk.
        if let Some(capture) = self.capture.take() {
            if let Some(sink) = capture.lock().await.stop() {
                sink.finish();
            }
        }
        let drained = match self.writer.take() {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(join) => Err(io::Error::other(join)),
            },
            None => Ok(0),
        };
        // Voice teardown comes before any artifact handling; the worker
        // slot itself is freed when the orchestrator sees CaptureEnded.
        if let Some(worker) = self.worker {
            if let Err(error) = self.backend.end_capture(worker, self.guild).await {
                warn!(room = %self.room, worker, %error, "voice disconnect failed");
            }
            let _ = self.tx.send(Event::CaptureEnded {
                worker,
                room: self.room,
            });
        }
        let ended_at = Utc::now();
        let samples = match drained {
            Ok(samples) => samples,
            Err(e) => {
                remove_quietly(&self.raw_path).await;
                return Err(e.into());
            }
        };
        if samples == 0 {
            debug!(room = %self.room, "no audio captured; skipping upload");
            remove_quietly(&self.raw_path).await;
            return Ok(None);
        }
        let mut artifact = Artifact {
            room: self.room,
            raw_path: self.raw_path.clone(),
            started_at: self.started_at,
            ended_at,
        };
        let final_path = self.raw_path.with_file_name(artifact.final_raw_name());
        if let Err(e) = tokio::fs::rename(&self.raw_path, &final_path).await {
            remove_quietly(&self.raw_path).await;
            return Err(e.into());
        }
        artifact.raw_path = final_path;
        let report = self.pipeline.process(&artifact).await?;
        Ok(Some(report))
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "artifact cleanup failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::remote::ObjectStore;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    const GUILD: GuildId = GuildId::new(99);
    const LOBBY: ChannelId = ChannelId::new(500);

    #[derive(Default)]
    struct MockState {
        next_room: u64,
        created: Vec<(String, ChannelId)>,
        deleted: Vec<ChannelId>,
        moved: Vec<(UserId, ChannelId)>,
        captures_begun: Vec<(WorkerId, ChannelId)>,
        captures_ended: Vec<WorkerId>,
        fail_create: bool,
        fail_move: bool,
        fail_join: bool,
        listing: Vec<RoomInfo>,
        occupants: HashMap<ChannelId, Vec<UserId>>,
    }

    struct MockBackend {
        state: Arc<StdMutex<MockState>>,
    }

    #[async_trait]
    impl VoiceBackend for MockBackend {
        async fn create_room(
            &self,
            _guild: GuildId,
            label: &str,
            _capacity: u32,
        ) -> Result<ChannelId, OrchestrateError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_create {
                return Err(OrchestrateError::remote("create refused"));
            }
            state.next_room += 1;
            let room = ChannelId::new(state.next_room);
            state.created.push((label.to_string(), room));
            Ok(room)
        }

        async fn delete_room(
            &self,
            _guild: GuildId,
            room: ChannelId,
        ) -> Result<(), OrchestrateError> {
            self.state.lock().unwrap().deleted.push(room);
            Ok(())
        }

        async fn move_member(
            &self,
            _guild: GuildId,
            member: UserId,
            room: ChannelId,
        ) -> Result<(), OrchestrateError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_move {
                return Err(OrchestrateError::race("relocate", "member left voice"));
            }
            state.moved.push((member, room));
            Ok(())
        }

        async fn list_rooms(&self, _guild: GuildId) -> Result<Vec<RoomInfo>, OrchestrateError> {
            Ok(self.state.lock().unwrap().listing.clone())
        }

        async fn room_occupants(
            &self,
            _guild: GuildId,
            room: ChannelId,
        ) -> Result<Vec<UserId>, OrchestrateError> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .occupants
                .get(&room)
                .cloned()
                .unwrap_or_default())
        }

        async fn begin_capture(
            &self,
            worker: WorkerId,
            _guild: GuildId,
            room: ChannelId,
            capture: SharedCapture,
        ) -> Result<(), OrchestrateError> {
            if self.state.lock().unwrap().fail_join {
                return Err(OrchestrateError::remote("voice join refused"));
            }
            // A tick's worth of audio so finalization has something to ship.
            if let Some(sink) = capture.lock().await.sink() {
                sink.write_chunk(vec![1i16; 960]);
            }
            self.state
                .lock()
                .unwrap()
                .captures_begun
                .push((worker, room));
            Ok(())
        }

        async fn end_capture(
            &self,
            worker: WorkerId,
            _guild: GuildId,
        ) -> Result<(), OrchestrateError> {
            self.state.lock().unwrap().captures_ended.push(worker);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeStore {
        puts: StdMutex<Vec<String>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl ObjectStore for FakeStore {
        async fn put(&self, _local: &Path, key: &str) -> Result<(), PipelineError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(PipelineError::Remote("store offline".into()));
            }
            self.puts.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    struct Harness {
        orch: Orchestrator,
        rx: mpsc::UnboundedReceiver<Event>,
        state: Arc<StdMutex<MockState>>,
        store: Arc<FakeStore>,
        dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        harness_with(&[]).await
    }

    async fn harness_with(overrides: &[(&str, &str)]) -> Harness {
        let mut h = harness_offline_with(overrides).await;
        for worker in 0..h.orch.workers.size() {
            h.orch
                .handle(Event::WorkerOnline {
                    worker,
                    user: UserId::new(1000 + worker as u64),
                })
                .await;
        }
        h
    }

    /// Harness whose recorder clients have not logged in yet.
    async fn harness_offline() -> Harness {
        harness_offline_with(&[]).await
    }

    async fn harness_offline_with(overrides: &[(&str, &str)]) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let dir_value = dir.path().display().to_string();
        let mut vars = HashMap::from([
            ("DISCORD_TOKEN".to_string(), "main-token".to_string()),
            ("RECORDER_TOKENS".to_string(), "rec-a,rec-b".to_string()),
            ("STORAGE_ENDPOINT".to_string(), "http://store.local".to_string()),
            ("STORAGE_BUCKET".to_string(), "tapes".to_string()),
            ("RECORDINGS_DIR".to_string(), dir_value),
        ]);
        for (key, value) in overrides {
            vars.insert(key.to_string(), value.to_string());
        }
        let config = Config::from_lookup(|key| vars.get(key).cloned()).unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(StdMutex::new(MockState {
            next_room: 900,
            ..MockState::default()
        }));
        let backend = Arc::new(MockBackend {
            state: Arc::clone(&state),
        });
        let store = Arc::new(FakeStore::default());
        let pipeline = Arc::new(UploadPipeline::new(
            store.clone(),
            None,
            "recordings".into(),
        ));
        let orch = Orchestrator::new(&config, backend, pipeline, tx);
        Harness {
            orch,
            rx,
            state,
            store,
            dir,
        }
    }

    impl Harness {
        /// Run queued events until the queue stays empty across a few
        /// scheduler passes. Covers chains of spawned mock calls but not
        /// finalization, which crosses a blocking thread.
        async fn settle(&mut self) {
            for _ in 0..10 {
                tokio::task::yield_now().await;
                while let Ok(event) = self.rx.try_recv() {
                    self.orch.handle(event).await;
                }
            }
        }

        /// Wait out a finalization in flight: pump events until its
        /// SessionFinished lands, then settle the stragglers.
        async fn pump_until_finished(&mut self) {
            loop {
                let event = self.rx.recv().await.unwrap();
                let done = matches!(event, Event::SessionFinished { .. });
                self.orch.handle(event).await;
                if done {
                    break;
                }
            }
            self.settle().await;
        }

        async fn advance(&mut self, seconds: u64) {
            tokio::time::advance(Duration::from_secs(seconds)).await;
            self.settle().await;
        }

        async fn join(&mut self, member: u64, room: ChannelId) {
            self.orch
                .handle(Event::Occupancy {
                    guild: GUILD,
                    member: UserId::new(member),
                    from: None,
                    to: Some(room),
                })
                .await;
        }

        async fn leave(&mut self, member: u64, room: ChannelId) {
            self.orch
                .handle(Event::Occupancy {
                    guild: GUILD,
                    member: UserId::new(member),
                    from: Some(room),
                    to: None,
                })
                .await;
        }

        fn created(&self) -> Vec<(String, ChannelId)> {
            self.state.lock().unwrap().created.clone()
        }

        fn deleted(&self) -> Vec<ChannelId> {
            self.state.lock().unwrap().deleted.clone()
        }

        fn moved(&self) -> Vec<(UserId, ChannelId)> {
            self.state.lock().unwrap().moved.clone()
        }

        fn session_state(&self, room: ChannelId) -> Option<SessionState> {
            self.orch.sessions.get(&room).map(|s| s.state)
        }

        fn occupant_count(&self, room: ChannelId) -> usize {
            self.orch.occupancy.get(&room).map_or(0, HashSet::len)
        }

        fn recordings_on_disk(&self) -> usize {
            std::fs::read_dir(self.dir.path()).map_or(0, Iterator::count)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lobby_join_allocates_a_numbered_room() {
        let mut h = harness().await;
        h.join(1, LOBBY).await;
        h.settle().await;

        assert_eq!(h.created().len(), 1);
        let (label, room) = h.created()[0].clone();
        assert_eq!(label, "Room-1");
        assert_eq!(h.moved(), vec![(UserId::new(1), room)]);
        assert_eq!(h.session_state(room), Some(SessionState::Active));
        assert_eq!(h.occupant_count(room), 1);
        assert_eq!(h.state.lock().unwrap().captures_begun, vec![(0, room)]);
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_echo_of_a_relocation_is_absorbed() {
        let mut h = harness().await;
        h.join(1, LOBBY).await;
        h.settle().await;
        let room = h.created()[0].1;

        // The gateway reports the move we just made.
        h.orch
            .handle(Event::Occupancy {
                guild: GUILD,
                member: UserId::new(1),
                from: Some(LOBBY),
                to: Some(room),
            })
            .await;
        h.settle().await;

        assert_eq!(h.created().len(), 1);
        assert_eq!(h.occupant_count(room), 1);
        assert_eq!(h.session_state(room), Some(SessionState::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn late_relocation_completion_cannot_resurrect_a_leaver() {
        let mut h = harness().await;
        h.join(1, LOBBY).await;

        let created = h.rx.recv().await.unwrap();
        assert!(matches!(created, Event::RoomCreated { .. }));
        h.orch.handle(created).await;
        let held = h.rx.recv().await.unwrap();
        let Event::Relocated { room, .. } = held else {
            panic!("expected the relocation completion");
        };

        // The gateway reports the move and then the member leaving, all
        // before the HTTP completion drains.
        h.orch
            .handle(Event::Occupancy {
                guild: GUILD,
                member: UserId::new(1),
                from: Some(LOBBY),
                to: Some(room),
            })
            .await;
        h.leave(1, room).await;
        assert_eq!(h.session_state(room), Some(SessionState::GraceWait));

        h.orch.handle(held).await;
        h.settle().await;
        assert_eq!(h.occupant_count(room), 0, "completion must not re-add the leaver");
        assert_eq!(h.session_state(room), Some(SessionState::GraceWait));

        // The room still winds down and gets reaped on schedule.
        h.advance(121).await;
        h.pump_until_finished().await;
        assert!(h.session_state(room).is_none());
        assert_eq!(h.deleted(), vec![room]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_capture_completion_leaves_a_rebound_worker_alone() {
        let mut h = harness_with(&[("RECORDER_TOKENS", "rec-a")]).await;
        h.join(1, LOBBY).await;

        let created = h.rx.recv().await.unwrap();
        assert!(matches!(created, Event::RoomCreated { .. }));
        h.orch.handle(created).await;
        let relocated = h.rx.recv().await.unwrap();
        h.orch.handle(relocated).await;
        let held = h.rx.recv().await.unwrap();
        assert!(matches!(
            held,
            Event::CaptureReady { result: Ok(()), .. }
        ));
        let room_a = h.created()[0].1;

        // Stop A while its capture completion is still in flight; the
        // finalizer frees the lone worker and room B snaps it up.
        h.orch
            .handle(Event::ManualStop {
                guild: GUILD,
                room: room_a,
            })
            .await;
        h.pump_until_finished().await;
        h.join(2, LOBBY).await;
        h.settle().await;
        let room_b = h.created()[1].1;
        assert_eq!(h.orch.sessions.get(&room_b).unwrap().worker, Some(0));
        assert_eq!(h.orch.workers.bound_count(), 1);

        // The stale completion must not tear down B's capture or free
        // B's slot.
        h.orch.handle(held).await;
        h.settle().await;
        assert_eq!(h.orch.workers.bound_count(), 1);
        assert_eq!(h.orch.sessions.get(&room_b).unwrap().worker, Some(0));
        assert_eq!(h.state.lock().unwrap().captures_ended, vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_room_relocates_the_newcomer() {
        let mut h = harness().await;
        let room1 = ChannelId::new(11);
        let regulars = (1u64..=5).map(UserId::new).collect();
        h.orch
            .handle(Event::RoomsListed {
                guild: GUILD,
                rooms: vec![RoomInfo {
                    room: room1,
                    name: "Room-1".into(),
                    occupants: regulars,
                }],
            })
            .await;
        h.settle().await;
        assert_eq!(h.session_state(room1), Some(SessionState::Active));

        h.join(6, room1).await;
        h.settle().await;

        assert_eq!(h.created().len(), 1);
        let (label, room2) = h.created()[0].clone();
        assert_eq!(label, "Room-2");
        assert_eq!(h.moved(), vec![(UserId::new(6), room2)]);
        assert_eq!(h.occupant_count(room1), 5);
        assert_eq!(h.occupant_count(room2), 1);
        assert_eq!(h.session_state(room2), Some(SessionState::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn under_capacity_join_stays_put() {
        let mut h = harness().await;
        let room1 = ChannelId::new(11);
        h.orch
            .handle(Event::RoomsListed {
                guild: GUILD,
                rooms: vec![RoomInfo {
                    room: room1,
                    name: "Room-1".into(),
                    occupants: vec![UserId::new(1), UserId::new(2)],
                }],
            })
            .await;
        h.settle().await;

        h.join(3, room1).await;
        h.settle().await;

        assert!(h.created().is_empty());
        assert!(h.moved().is_empty());
        assert_eq!(h.occupant_count(room1), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn room_ceiling_degrades_gracefully() {
        let mut h = harness_with(&[("MAX_ROOMS", "1")]).await;
        h.join(1, LOBBY).await;
        h.settle().await;
        h.join(2, LOBBY).await;
        h.settle().await;

        assert_eq!(h.created().len(), 1);
        assert_eq!(h.moved().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_relocation_reaps_the_fresh_room_and_frees_its_number() {
        let mut h = harness().await;
        h.state.lock().unwrap().fail_move = true;
        h.join(1, LOBBY).await;
        h.settle().await;

        let room = h.created()[0].1;
        assert_eq!(h.deleted(), vec![room]);
        assert!(h.session_state(room).is_none());

        // The number comes straight back.
        h.state.lock().unwrap().fail_move = false;
        h.join(2, LOBBY).await;
        h.settle().await;
        assert_eq!(h.created().len(), 2);
        assert_eq!(h.created()[1].0, "Room-1");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_creation_releases_the_reservation() {
        let mut h = harness().await;
        h.state.lock().unwrap().fail_create = true;
        h.join(1, LOBBY).await;
        h.settle().await;
        assert!(h.created().is_empty());

        h.state.lock().unwrap().fail_create = false;
        h.join(2, LOBBY).await;
        h.settle().await;
        assert_eq!(h.created()[0].0, "Room-1");
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_finalizes_uploads_and_reaps() {
        let mut h = harness().await;
        h.join(1, LOBBY).await;
        h.settle().await;
        let room = h.created()[0].1;

        h.leave(1, room).await;
        assert_eq!(h.session_state(room), Some(SessionState::GraceWait));
        h.settle().await;
        h.advance(121).await;
        h.pump_until_finished().await;

        assert!(h.session_state(room).is_none());
        assert_eq!(h.deleted(), vec![room]);
        assert_eq!(h.orch.workers.bound_count(), 0);
        let puts = h.store.puts.lock().unwrap().clone();
        assert_eq!(puts.len(), 1);
        assert!(puts[0].starts_with("recordings/recording-"));
        assert!(puts[0].ends_with(".wav"));
        assert_eq!(h.recordings_on_disk(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_within_grace_keeps_the_session() {
        let mut h = harness().await;
        h.join(1, LOBBY).await;
        h.settle().await;
        let room = h.created()[0].1;

        h.leave(1, room).await;
        h.settle().await;
        h.advance(60).await;
        h.join(1, room).await;
        assert_eq!(h.session_state(room), Some(SessionState::Active));

        // The cancelled timer's deadline passes without effect.
        h.advance(120).await;
        assert_eq!(h.session_state(room), Some(SessionState::Active));
        assert!(h.deleted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_emptying_gets_a_fresh_grace_timer() {
        let mut h = harness().await;
        h.join(1, LOBBY).await;
        h.settle().await;
        let room = h.created()[0].1;

        h.leave(1, room).await;
        h.settle().await;
        h.advance(100).await;
        h.join(1, room).await;
        h.settle().await;
        h.leave(1, room).await;
        h.settle().await;

        // 100s into the second wait: the first timer's deadline is long
        // gone, the second has 20s to run.
        h.advance(100).await;
        assert_eq!(h.session_state(room), Some(SessionState::GraceWait));
        h.advance(21).await;
        h.pump_until_finished().await;
        assert!(h.session_state(room).is_none());
        assert_eq!(h.deleted(), vec![room]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_grace_expiry_is_ignored() {
        let mut h = harness().await;
        h.join(1, LOBBY).await;
        h.settle().await;
        let room = h.created()[0].1;
        h.leave(1, room).await;
        h.settle().await;
        let old_epoch = h.orch.sessions.get(&room).unwrap().grace_epoch;
        h.join(1, room).await;

        h.orch
            .handle(Event::GraceExpired {
                room,
                epoch: old_epoch,
            })
            .await;

        assert_eq!(h.session_state(room), Some(SessionState::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn duration_cap_fires_while_occupied_without_restart() {
        let mut h = harness().await;
        h.join(1, LOBBY).await;
        h.settle().await;
        let room = h.created()[0].1;

        h.advance(301).await;
        h.pump_until_finished().await;

        assert!(h.session_state(room).is_none());
        assert_eq!(h.occupant_count(room), 1);
        assert!(h.deleted().is_empty(), "occupied room must not be deleted");
        assert_eq!(h.store.puts.lock().unwrap().len(), 1);

        // When the room finally empties it is reaped without a session.
        h.leave(1, room).await;
        h.settle().await;
        assert_eq!(h.deleted(), vec![room]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_grace_leaves_the_duration_cap_armed() {
        let mut h = harness().await;
        h.join(1, LOBBY).await;
        h.settle().await;
        let room = h.created()[0].1;

        // Leave at t=0s, rejoin at t=119s: grace cancelled.
        h.leave(1, room).await;
        h.settle().await;
        h.advance(119).await;
        h.join(1, room).await;
        h.settle().await;
        assert_eq!(h.session_state(room), Some(SessionState::Active));

        // The cap armed at session start still fires at t=300s.
        h.advance(182).await;
        h.pump_until_finished().await;
        assert!(h.session_state(room).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_during_wind_down_starts_a_fresh_session() {
        let mut h = harness().await;
        h.join(1, LOBBY).await;
        h.settle().await;
        let room = h.created()[0].1;
        h.leave(1, room).await;
        h.settle().await;

        let epoch = h.orch.sessions.get(&room).unwrap().grace_epoch;
        h.orch.handle(Event::GraceExpired { room, epoch }).await;
        assert_eq!(h.session_state(room), Some(SessionState::Stopping));

        // Back before finalization lands.
        h.join(2, room).await;
        h.pump_until_finished().await;

        assert_eq!(h.session_state(room), Some(SessionState::Active));
        assert!(h.deleted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn worker_exhaustion_runs_sessions_without_capture() {
        let mut h = harness().await;
        for member in 1u64..=3 {
            h.join(member, LOBBY).await;
            h.settle().await;
        }

        let room1 = h.created()[0].1;
        let room2 = h.created()[1].1;
        let room3 = h.created()[2].1;
        assert_eq!(h.state.lock().unwrap().captures_begun.len(), 2);
        assert!(h.orch.sessions.get(&room1).unwrap().worker.is_some());
        assert!(h.orch.sessions.get(&room2).unwrap().worker.is_some());
        assert!(h.orch.sessions.get(&room3).unwrap().worker.is_none());

        // A worker-less session finalizes with nothing to upload.
        h.leave(3, room3).await;
        h.settle().await;
        h.advance(121).await;
        h.pump_until_finished().await;
        assert!(h.session_state(room3).is_none());
        assert!(h.deleted().contains(&room3));
        assert!(h.store.puts.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_capture_start_releases_the_worker() {
        let mut h = harness().await;
        h.state.lock().unwrap().fail_join = true;
        h.join(1, LOBBY).await;
        h.settle().await;

        let room = h.created()[0].1;
        assert_eq!(h.session_state(room), Some(SessionState::Active));
        assert!(h.orch.sessions.get(&room).unwrap().worker.is_none());
        assert_eq!(h.orch.workers.bound_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_events_are_invisible_to_occupancy() {
        let mut h = harness().await;
        h.join(1, LOBBY).await;
        h.settle().await;
        let room = h.created()[0].1;

        // The recorder joining (and leaving) the room it captures.
        h.join(1000, room).await;
        h.leave(1000, room).await;
        h.settle().await;

        assert_eq!(h.occupant_count(room), 1);
        assert_eq!(h.session_state(room), Some(SessionState::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn mute_toggles_do_not_move_anyone() {
        let mut h = harness().await;
        h.join(1, LOBBY).await;
        h.settle().await;
        let room = h.created()[0].1;

        h.orch
            .handle(Event::Occupancy {
                guild: GUILD,
                member: UserId::new(1),
                from: Some(room),
                to: Some(room),
            })
            .await;
        h.settle().await;

        assert_eq!(h.occupant_count(room), 1);
        assert_eq!(h.session_state(room), Some(SessionState::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn adoption_reaps_empty_rooms_and_records_occupied_ones() {
        let mut h = harness().await;
        h.state.lock().unwrap().listing = vec![
            RoomInfo {
                room: ChannelId::new(11),
                name: "Room-1".into(),
                occupants: vec![UserId::new(1)],
            },
            RoomInfo {
                room: ChannelId::new(13),
                name: "Room-3".into(),
                occupants: vec![],
            },
            RoomInfo {
                room: ChannelId::new(14),
                name: "Lounge".into(),
                occupants: vec![UserId::new(9)],
            },
        ];
        h.orch.handle(Event::GuildAvailable { guild: GUILD }).await;
        h.settle().await;

        assert_eq!(h.deleted(), vec![ChannelId::new(13)]);
        assert_eq!(
            h.session_state(ChannelId::new(11)),
            Some(SessionState::Active)
        );
        assert!(h.session_state(ChannelId::new(14)).is_none());
        // Lounge stays untouched and the gap at 2 is the next number.
        h.join(5, LOBBY).await;
        h.settle().await;
        assert_eq!(h.created().last().unwrap().0, "Room-2");
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_labels_adopt_only_the_first_channel() {
        let mut h = harness().await;
        h.orch
            .handle(Event::RoomsListed {
                guild: GUILD,
                rooms: vec![
                    RoomInfo {
                        room: ChannelId::new(11),
                        name: "Room-1".into(),
                        occupants: vec![UserId::new(1)],
                    },
                    RoomInfo {
                        room: ChannelId::new(12),
                        name: "Room-1".into(),
                        occupants: vec![UserId::new(2)],
                    },
                ],
            })
            .await;
        h.settle().await;

        assert_eq!(
            h.session_state(ChannelId::new(11)),
            Some(SessionState::Active)
        );
        // The imposter is neither tracked nor deleted.
        assert!(h.session_state(ChannelId::new(12)).is_none());
        assert_eq!(h.occupant_count(ChannelId::new(12)), 0);
        assert!(h.deleted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn worker_login_scrub_winds_down_an_emptied_room() {
        let mut h = harness_offline().await;
        let room = ChannelId::new(11);
        // Adopted before the recorder clients have announced themselves;
        // the lone "occupant" is really a recorder identity.
        h.orch
            .handle(Event::RoomsListed {
                guild: GUILD,
                rooms: vec![RoomInfo {
                    room,
                    name: "Room-1".into(),
                    occupants: vec![UserId::new(1000)],
                }],
            })
            .await;
        h.settle().await;
        assert_eq!(h.occupant_count(room), 1);
        assert_eq!(h.session_state(room), Some(SessionState::Active));

        h.orch
            .handle(Event::WorkerOnline {
                worker: 0,
                user: UserId::new(1000),
            })
            .await;
        h.settle().await;

        // The scrub emptied the mirror, so the session takes the normal
        // empty-room path instead of lingering.
        assert_eq!(h.occupant_count(room), 0);
        assert_eq!(h.session_state(room), Some(SessionState::GraceWait));
        h.advance(121).await;
        h.pump_until_finished().await;
        assert!(h.session_state(room).is_none());
        assert_eq!(h.deleted(), vec![room]);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_start_and_stop_never_delete_the_channel() {
        let mut h = harness().await;
        let stage = ChannelId::new(777);
        h.state
            .lock()
            .unwrap()
            .occupants
            .insert(stage, vec![UserId::new(5), UserId::new(1000)]);

        h.orch
            .handle(Event::ManualStart {
                guild: GUILD,
                room: stage,
            })
            .await;
        h.settle().await;
        assert_eq!(h.session_state(stage), Some(SessionState::Active));
        // The recorder identity was filtered out of the seed.
        assert_eq!(h.occupant_count(stage), 1);

        // Members of a manually recorded channel are not rerouted.
        h.join(6, stage).await;
        h.settle().await;
        assert!(h.created().is_empty());
        assert_eq!(h.occupant_count(stage), 2);

        h.orch
            .handle(Event::ManualStop {
                guild: GUILD,
                room: stage,
            })
            .await;
        h.pump_until_finished().await;

        assert!(h.session_state(stage).is_none());
        assert!(h.deleted().is_empty());
        assert_eq!(h.store.puts.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_start_on_an_active_session_is_a_no_op() {
        let mut h = harness().await;
        h.join(1, LOBBY).await;
        h.settle().await;
        let room = h.created()[0].1;

        h.orch
            .handle(Event::ManualStart {
                guild: GUILD,
                room,
            })
            .await;
        h.settle().await;

        assert_eq!(h.orch.sessions.len(), 1);
        assert_eq!(h.state.lock().unwrap().captures_begun.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn upload_failure_still_cleans_up_and_reaps() {
        let mut h = harness().await;
        h.store.fail.store(true, Ordering::SeqCst);
        h.join(1, LOBBY).await;
        h.settle().await;
        let room = h.created()[0].1;

        h.leave(1, room).await;
        h.settle().await;
        h.advance(121).await;
        h.pump_until_finished().await;

        assert!(h.session_state(room).is_none());
        assert_eq!(h.deleted(), vec![room]);
        assert_eq!(h.recordings_on_disk(), 0);
        assert_eq!(h.orch.workers.bound_count(), 0);
    }
}
