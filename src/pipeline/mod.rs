//! Upload pipeline for finalized recordings.
//!
//! Takes the renamed raw artifact through conversion, optional transcription
//! and summarization, and upload. Local intermediates are deleted whether or
//! not the remote steps succeed; after `process` returns, nothing of the
//! session remains on disk.

pub mod remote;

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use hound::{SampleFormat, WavSpec, WavWriter};
use remote::{ObjectStore, SpeechService};
use serenity::model::id::ChannelId;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::session::TIMESTAMP_FMT;

/// Capture sample rate after downmixing, 48 kHz mono.
pub const SAMPLE_RATE: u32 = 48_000;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("audio conversion failed: {0}")]
    Convert(String),
    #[error("local I/O failure: {0}")]
    Io(#[from] io::Error),
    #[error("remote call failed: {0}")]
    Remote(String),
}

/// A finalized recording: the renamed raw blob plus the timestamps that
/// name it. Every derived path and remote key comes from `base_name`.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub room: ChannelId,
    pub raw_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl Artifact {
    pub fn base_name(&self) -> String {
        format!(
            "recording-{}-{}-{}",
            self.room,
            self.started_at.format(TIMESTAMP_FMT),
            self.ended_at.format(TIMESTAMP_FMT)
        )
    }

    pub fn final_raw_name(&self) -> String {
        format!("{}.pcm", self.base_name())
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        self.raw_path
            .with_file_name(format!("{}.{suffix}", self.base_name()))
    }

    pub fn wav_path(&self) -> PathBuf {
        self.sibling("wav")
    }

    pub fn transcript_path(&self) -> PathBuf {
        self.sibling("txt")
    }

    pub fn summary_path(&self) -> PathBuf {
        self.sibling("summary.txt")
    }
}

/// What `process` managed to push.
#[derive(Debug, Default)]
pub struct UploadReport {
    pub audio_key: Option<String>,
    pub transcript_key: Option<String>,
    pub summary_key: Option<String>,
}

pub struct UploadPipeline {
    store: Arc<dyn ObjectStore>,
    speech: Option<Arc<dyn SpeechService>>,
    folder: String,
}

impl UploadPipeline {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        speech: Option<Arc<dyn SpeechService>>,
        folder: String,
    ) -> Self {
        Self {
            store,
            speech,
            folder,
        }
    }

    /// Run the pipeline, then delete local intermediates unconditionally.
    /// The error, if any, is the first fatal step failure; annotation
    /// failures only cost their own outputs.
    pub async fn process(&self, artifact: &Artifact) -> Result<UploadReport, PipelineError> {
        let outcome = self.run(artifact).await;
        self.cleanup(artifact).await;
        outcome
    }

    async fn run(&self, artifact: &Artifact) -> Result<UploadReport, PipelineError> {
        let wav = artifact.wav_path();
        {
            let raw = artifact.raw_path.clone();
            let wav = wav.clone();
            tokio::task::spawn_blocking(move || convert_to_wav(&raw, &wav))
                .await
                .map_err(|e| PipelineError::Convert(format!("conversion task: {e}")))??;
        }

        let mut transcript = None;
        let mut summary = None;
        if let Some(speech) = &self.speech {
            // Annotations are best-effort: a dead speech service must not
            // cost the audio upload.
            match speech.transcribe(&wav).await {
                Ok(text) => {
                    match speech.summarize(&text).await {
                        Ok(s) => summary = s,
                        Err(error) => warn!(%error, "summarization failed"),
                    }
                    transcript = Some(text);
                }
                Err(error) => warn!(%error, "transcription failed; uploading audio only"),
            }
        }

        let mut report = UploadReport::default();
        let audio_key = self.key(artifact, "wav");
        self.store.put(&wav, &audio_key).await?;
        report.audio_key = Some(audio_key);

        if let Some(text) = transcript {
            let key = self.key(artifact, "txt");
            match self.push_text(&artifact.transcript_path(), &key, &text).await {
                Ok(()) => report.transcript_key = Some(key),
                Err(error) => warn!(%error, "transcript upload failed"),
            }
        }
        if let Some(text) = summary {
            let key = self.key(artifact, "summary.txt");
            match self.push_text(&artifact.summary_path(), &key, &text).await {
                Ok(()) => report.summary_key = Some(key),
                Err(error) => warn!(%error, "summary upload failed"),
            }
        }
        Ok(report)
    }

    fn key(&self, artifact: &Artifact, suffix: &str) -> String {
        format!("{}/{}.{suffix}", self.folder, artifact.base_name())
    }

    async fn push_text(
        &self,
        path: &Path,
        key: &str,
        text: &str,
    ) -> Result<(), PipelineError> {
        tokio::fs::write(path, text).await?;
        self.store.put(path, key).await
    }

    async fn cleanup(&self, artifact: &Artifact) {
        let paths = [
            artifact.raw_path.clone(),
            artifact.wav_path(),
            artifact.transcript_path(),
            artifact.summary_path(),
        ];
        for path in paths {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "local artifact removed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "local cleanup failed"),
            }
        }
    }
}

/// Wrap raw little-endian mono PCM into a WAV container.
fn convert_to_wav(raw: &Path, wav: &Path) -> Result<(), PipelineError> {
    let mut reader = BufReader::new(File::open(raw)?);
    let spec = WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer =
        WavWriter::create(wav, spec).map_err(|e| PipelineError::Convert(e.to_string()))?;
    loop {
        match reader.read_i16::<LittleEndian>() {
            Ok(sample) => writer
                .write_sample(sample)
                .map_err(|e| PipelineError::Convert(e.to_string()))?,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(PipelineError::Io(e)),
        }
    }
    writer
        .finalize()
        .map_err(|e| PipelineError::Convert(e.to_string()))?;
    Ok(())
}
