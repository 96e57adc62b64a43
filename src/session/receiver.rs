//! Voice-event receiver wired into a worker's driver.
//!
//! One receiver per capture. It learns the RTP source map from speaking
//! updates, filters each 20 ms tick down to the session's tracked members,
//! mixes their streams into one mono frame and forwards it to the sink.

use super::sink::SinkHandle;
use serenity::model::id::UserId;
use songbird::model::payload::Speaking;
use songbird::{Event, EventContext, EventHandler as VoiceEventHandler};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::trace;

/// Capture state shared between the orchestrator (membership updates, stop)
/// and the voice driver's event threads (audio delivery).
pub struct CaptureState {
    /// Cleared on stop; ticks arriving afterwards are dropped.
    pub active: bool,
    /// RTP source -> member, learned from speaking updates.
    pub ssrc_map: HashMap<u32, UserId>,
    /// Members whose audio feeds the sink. Kept in step with room occupancy;
    /// edits never reset the sink or the source map.
    pub members: HashSet<UserId>,
    sink: Option<SinkHandle>,
}

impl CaptureState {
    pub fn new(members: HashSet<UserId>, sink: SinkHandle) -> Self {
        Self {
            active: true,
            ssrc_map: HashMap::new(),
            members,
            sink: Some(sink),
        }
    }

    /// Stop accepting audio and hand the sink back for finalization.
    /// Idempotent: later calls return `None`.
    pub fn stop(&mut self) -> Option<SinkHandle> {
        self.active = false;
        self.sink.take()
    }

    pub fn sink(&self) -> Option<&SinkHandle> {
        self.sink.as_ref()
    }
}

pub type SharedCapture = Arc<Mutex<CaptureState>>;

pub struct Receiver {
    state: SharedCapture,
}

impl Receiver {
    pub fn new(state: SharedCapture) -> Self {
        Self { state }
    }
}

#[async_trait::async_trait]
impl VoiceEventHandler for Receiver {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        match ctx {
            EventContext::SpeakingStateUpdate(Speaking { ssrc, user_id, .. }) => {
                if let Some(user) = user_id {
                    if user.0 != 0 {
                        let mut state = self.state.lock().await;
                        state.ssrc_map.insert(*ssrc, UserId::new(user.0));
                        trace!(ssrc, user = user.0, "ssrc mapped");
                    }
                }
            }
            EventContext::VoiceTick(tick) => {
                let state = self.state.lock().await;
                if !state.active {
                    return None;
                }
                let mut mixed: Option<Vec<i32>> = None;
                for (ssrc, data) in &tick.speaking {
                    let Some(member) = state.ssrc_map.get(ssrc) else {
                        continue;
                    };
                    if !state.members.contains(member) {
                        continue;
                    }
                    let Some(decoded) = data.decoded_voice.as_ref() else {
                        continue;
                    };
                    if decoded.is_empty() {
                        continue;
                    }
                    let mono = downmix_stereo(decoded);
                    if mono.iter().all(|sample| *sample == 0) {
                        continue;
                    }
                    accumulate(mixed.get_or_insert_with(|| vec![0; mono.len()]), &mono);
                }
                if let (Some(mix), Some(sink)) = (mixed, state.sink()) {
                    sink.write_chunk(clamp_mix(&mix));
                }
            }
            _ => {}
        }
        None
    }
}

/// Average interleaved stereo down to mono.
pub fn downmix_stereo(stereo: &[i16]) -> Vec<i16> {
    stereo
        .chunks(2)
        .map(|pair| {
            if pair.len() == 2 {
                ((pair[0] as i32 + pair[1] as i32) / 2) as i16
            } else {
                pair[0]
            }
        })
        .collect()
}

fn accumulate(mix: &mut Vec<i32>, samples: &[i16]) {
    if mix.len() < samples.len() {
        mix.resize(samples.len(), 0);
    }
    for (slot, sample) in mix.iter_mut().zip(samples) {
        *slot += *sample as i32;
    }
}

/// Saturate the i32 mix back into the i16 sample range.
pub fn clamp_mix(mix: &[i32]) -> Vec<i16> {
    mix.iter()
        .map(|sample| (*sample).clamp(i16::MIN as i32, i16::MAX as i32) as i16)
        .collect()
}
