//! Raw PCM sink for one recording session.
//!
//! Audio arrives on the voice driver's threads; the sink moves it through an
//! unbounded channel to a dedicated writer task so disk latency never blocks
//! a voice tick. Samples are appended as little-endian i16 mono. Closing the
//! writer returns the total sample count, which lets empty captures skip the
//! upload pipeline entirely.

use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug)]
pub enum SinkMessage {
    /// One voice tick's worth of mixed mono samples.
    Chunk(Vec<i16>),
    Finish,
}

/// Cheap clonable handle held by the capture side.
#[derive(Debug, Clone)]
pub struct SinkHandle {
    tx: mpsc::UnboundedSender<SinkMessage>,
}

impl SinkHandle {
    /// Queue samples for writing. Errors mean the writer is gone, which the
    /// capture side cannot act on, so they are ignored.
    pub fn write_chunk(&self, samples: Vec<i16>) {
        let _ = self.tx.send(SinkMessage::Chunk(samples));
    }

    pub fn finish(&self) {
        let _ = self.tx.send(SinkMessage::Finish);
    }
}

pub struct SinkWriter {
    path: PathBuf,
    rx: mpsc::UnboundedReceiver<SinkMessage>,
}

impl SinkWriter {
    /// Prepare a writer for `path`, creating parent directories as needed.
    /// The file itself is created when the writer task starts.
    pub fn create(path: PathBuf) -> io::Result<(SinkHandle, Self)> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((SinkHandle { tx }, Self { path, rx }))
    }

    /// Drain chunks until `Finish` (or every handle is dropped), then flush.
    /// Returns the number of samples written.
    pub async fn run(mut self) -> io::Result<u64> {
        let mut writer = BufWriter::new(File::create(&self.path)?);
        let mut samples: u64 = 0;
        info!(path = %self.path.display(), "recording sink open");
        loop {
            match self.rx.recv().await {
                Some(SinkMessage::Chunk(chunk)) => {
                    for sample in &chunk {
                        writer.write_i16::<LittleEndian>(*sample)?;
                    }
                    samples += chunk.len() as u64;
                }
                Some(SinkMessage::Finish) | None => break,
            }
        }
        writer.flush()?;
        info!(path = %self.path.display(), samples, "recording sink closed");
        Ok(samples)
    }
}
