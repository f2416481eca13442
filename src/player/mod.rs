//! The CD player engine.
//!
//! Two loops share the drive through a [`crate::usb::slot::DriveSlot`]: the
//! [`monitor::Monitor`] owns [`state::DriveInfo`] and the [`playback::Playback`] loop
//! owns [`state::PlayerState`]. Both publish whole snapshots through `watch` channels.

pub mod io;
pub mod monitor;
pub mod playback;
pub mod state;
pub mod time;

pub use monitor::{Monitor, MonitorState};
pub use playback::Playback;
pub use state::{DriveInfo, DriveStatus, PlayerState, TrackInfo};

#[cfg(test)]
mod tests {
    use tokio::sync::watch;

    use super::playback::tests::{FakeSink, MemorySettings, PLAY, ScriptedButtons};
    use super::*;
    use crate::config::PlayerConfig;
    use crate::scsi::command::CD_DA_SECTOR_SIZE;
    use crate::usb::sim::{SimDisc, SimulatedDrive, toc_bytes};
    use crate::usb::slot::DriveSlot;

    #[tokio::test(start_paused = true)]
    async fn attach_to_end_of_disc() {
        let config = PlayerConfig::default();
        let sim = SimulatedDrive::new().with_disc(SimDisc::audio(toc_bytes(&[(1, 0, 0), (2, 0, 4500)], 10500)));
        sim.becoming_ready(3);
        let slot = DriveSlot::new();
        let (info_tx, info_rx) = watch::channel(DriveInfo::default());
        let (state_tx, state_rx) = watch::channel(PlayerState::default());

        let mut monitor = Monitor::new(slot.clone(), info_tx, config.monitor);
        let sink = FakeSink::default();
        let buttons = ScriptedButtons::default();
        let mut playback = Playback::new(
            slot.clone(),
            info_rx.clone(),
            state_tx,
            Box::new(sink.clone()),
            Box::new(buttons.clone()),
            Box::new(MemorySettings::default()),
            config.playback,
        );

        assert_eq!(monitor.step().await, MonitorState::WaitForDevice);
        slot.attach(sim.scsi_device()).await;
        for _ in 0..50 {
            if monitor.step().await == MonitorState::WaitForRemoval {
                break;
            }
        }
        let info = info_rx.borrow().clone();
        assert!(info.ready_to_play);
        let durations: Vec<u32> = info.tracks.iter().map(|t| t.duration).collect();
        assert_eq!(durations, vec![4500, 6000]);

        buttons.press(PLAY, 1);
        for tick in 1..60u32 {
            playback.tick().await;
            let state = *state_rx.borrow();
            assert!(state.playing);
            assert_eq!((state.track_index, state.read_frame_count), (0, tick * 75));
        }
        playback.tick().await;
        let state = *state_rx.borrow();
        assert_eq!((state.track_index, state.read_frame_count), (1, 0));

        for _ in 0..80 {
            playback.tick().await;
        }
        let state = *state_rx.borrow();
        assert!(!state.playing);
        assert_eq!((state.track_index, state.read_frame_count), (0, 0));
        assert_eq!(sink.pushed.lock().unwrap().len(), 140);
        assert!(sink.pushed.lock().unwrap().iter().all(|n| *n == 75 * CD_DA_SECTOR_SIZE));
    }
}
