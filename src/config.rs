//! Command line arguments and the timing defaults of the player loops.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "discplay", version, about = "Plays audio CDs from a USB optical drive")]
pub struct Args {
    /// JSON file the volume is persisted in.
    #[arg(long, env = "DISCPLAY_SETTINGS", default_value = "discplay.json")]
    pub settings: PathBuf,

    /// Write the played PCM (16-bit stereo, 44.1 kHz, little endian) to this file.
    ///
    /// Without it the audio is paced and discarded.
    #[arg(long, env = "DISCPLAY_PCM_OUT")]
    pub pcm_out: Option<PathBuf>,

    /// Playback loop interval in milliseconds.
    #[arg(long, default_value_t = 10)]
    pub tick_ms: u64,

    /// How long to wait for a disc to spin up after the drive attaches, in seconds.
    #[arg(long, default_value_t = 20)]
    pub spinup_secs: u64,

    /// Interval between scans of the USB bus, in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub hotplug_ms: u64,
}

impl Args {
    pub fn player_config(&self) -> PlayerConfig {
        let mut config = PlayerConfig::default();
        config.playback.tick = Duration::from_millis(self.tick_ms.max(1));
        config.monitor.spinup_window = Duration::from_secs(self.spinup_secs);
        config
    }

    pub fn hotplug_poll(&self) -> Duration {
        Duration::from_millis(self.hotplug_ms.max(10))
    }
}

/// Time budgets of the Monitor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorTiming {
    /// Sleep between checks for an attached drive.
    pub device_poll: Duration,
    /// Total time spin-up may take before the disc is waited for without a deadline.
    pub spinup_window: Duration,
    pub spinup_poll: Duration,
    /// Lock wait for disc scanning commands.
    pub scan_lock_wait: Duration,
    /// Lock wait for the removal probe, which competes with playback reads.
    pub probe_lock_wait: Duration,
    pub removal_poll: Duration,
    /// Consecutive not-ready probes after which the disc counts as removed.
    pub removal_probes: u32,
    /// Pause after publishing a ready disc.
    pub ready_settle: Duration,
}

impl Default for MonitorTiming {
    fn default() -> Self {
        Self {
            device_poll: Duration::from_millis(100),
            spinup_window: Duration::from_secs(20),
            spinup_poll: Duration::from_millis(300),
            scan_lock_wait: Duration::from_secs(2),
            probe_lock_wait: Duration::from_secs(1),
            removal_poll: Duration::from_millis(500),
            removal_probes: 3,
            ready_settle: Duration::from_millis(200),
        }
    }
}

/// Timing and step sizes of the Playback loop. Counts are in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackTiming {
    pub tick: Duration,
    pub volume_step: u8,
    /// Ticks a button has to be held to count as a long press.
    pub long_press: u32,
    /// Auto-repeat interval of a held volume button.
    pub repeat: u32,
    /// Frames skipped per tick while fast-seeking.
    pub seek_step: u32,
    /// Ticks without volume changes before the volume is persisted.
    pub persist_after: u32,
    pub lock_wait: Duration,
}

impl Default for PlaybackTiming {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
            volume_step: 5,
            long_press: 50,
            repeat: 10,
            seek_step: 75,
            persist_after: 100,
            lock_wait: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayerConfig {
    pub monitor: MonitorTiming,
    pub playback: PlaybackTiming,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_override_defaults() {
        let args = Args::parse_from(["discplay", "--tick-ms", "20", "--spinup-secs", "5"]);
        let config = args.player_config();
        assert_eq!(config.playback.tick, Duration::from_millis(20));
        assert_eq!(config.monitor.spinup_window, Duration::from_secs(5));
        assert_eq!(config.monitor.removal_probes, 3);
        assert!(args.pcm_out.is_none());
    }
}
