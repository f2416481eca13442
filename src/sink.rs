//! A paced PCM sink standing in for an I2S consumer.
//!
//! Blocks pushed by the Playback loop are queued on a bounded channel and drained in
//! real time (75 frames per second), so the queue fills exactly like a hardware FIFO
//! and [`AudioSink::is_full`] provides genuine backpressure.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use crate::player::io::AudioSink;
use crate::player::state::{MAX_VOLUME, PlayerState};
use crate::player::time::FRAMES_PER_SECOND;
use crate::scsi::command::CD_DA_SECTOR_SIZE;

/// Frames per pushed block, one READ CD batch at most.
pub const BLOCK_FRAMES: u32 = 75;
/// Blocks queued ahead of the drain.
pub const QUEUE_DEPTH: usize = 4;

pub struct PacedSink {
    blocks: mpsc::Sender<Vec<u8>>,
    block_frames: u32,
}

impl PacedSink {
    /// Starts the drain task. PCM goes to `output` when given, otherwise it is dropped
    /// after pacing.
    pub async fn start(
        output: Option<&Path>,
        state: watch::Receiver<PlayerState>,
        block_frames: u32,
        depth: usize,
    ) -> io::Result<(Self, JoinHandle<()>)> {
        let file = match output {
            Some(path) => Some(File::create(path).await?),
            None => None,
        };
        let (blocks, rx) = mpsc::channel(depth.max(1));
        let drain = tokio::spawn(drain(rx, file, state));
        Ok((
            Self {
                blocks,
                block_frames: block_frames.max(1),
            },
            drain,
        ))
    }
}

impl AudioSink for PacedSink {
    fn is_full(&self) -> bool {
        self.blocks.capacity() == 0
    }

    fn capacity_frames(&self) -> u32 {
        self.block_frames
    }

    fn push(&mut self, pcm: &[u8]) {
        if let Err(e) = self.blocks.try_send(pcm.to_vec()) {
            warn!("audio block dropped: {e}");
        }
    }
}

async fn drain(mut blocks: mpsc::Receiver<Vec<u8>>, mut output: Option<File>, state: watch::Receiver<PlayerState>) {
    let mut deadline = Instant::now();
    while let Some(mut block) = blocks.recv().await {
        let now = Instant::now();
        if deadline < now {
            // underrun, restart the clock
            deadline = now;
        }

        scale_volume(&mut block, state.borrow().volume);
        if let Some(file) = output.as_mut() {
            if let Err(e) = file.write_all(&block).await {
                warn!("PCM output failed, discarding from now on: {e}");
                output = None;
            }
        }

        let frames = (block.len() / CD_DA_SECTOR_SIZE) as u64;
        deadline += Duration::from_micros(frames * 1_000_000 / u64::from(FRAMES_PER_SECOND));
        sleep_until(deadline).await;
    }
    if let Some(mut file) = output {
        if let Err(e) = file.flush().await {
            warn!("flushing PCM output: {e}");
        }
    }
    debug!("audio sink closed");
}

/// Scales 16-bit little endian samples by `volume` percent.
pub fn scale_volume(pcm: &mut [u8], volume: u8) {
    if volume >= MAX_VOLUME {
        return;
    }
    for sample in pcm.chunks_exact_mut(2) {
        let value = i32::from(i16::from_le_bytes([sample[0], sample[1]])) * i32::from(volume) / 100;
        sample.copy_from_slice(&(value as i16).to_le_bytes());
    }
}
