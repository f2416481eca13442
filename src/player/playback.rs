//! The Playback loop: button handling, paced READ CD batches and track advance.
//!
//! The loop never waits on the Monitor. Each tick it takes the latest [`DriveInfo`]
//! snapshot and simply does nothing while the disc is not ready to play.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::io::{AudioSink, ButtonSource, Buttons, SettingsStore};
use super::state::{DEFAULT_VOLUME, DriveInfo, MAX_VOLUME, PlayerState};
use crate::config::PlaybackTiming;
use crate::usb::slot::DriveSlot;
use crate::usb::transport::UsbBackend;

/// What a tick's button levels mean for the player.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Eject,
    VolumeUp,
    VolumeDown,
    TogglePlay,
    NextTrack,
    PrevTrack,
    /// Emitted every tick while next is held past a long press.
    SeekForward,
    SeekBackward,
    /// A seek button was released; no track skip follows.
    SeekEnd,
}

/// Turns sampled button levels into [`Action`]s.
#[derive(Debug, Default)]
pub struct ButtonTracker {
    previous: Buttons,
    volume_up: u32,
    volume_down: u32,
    next: u32,
    prev: u32,
}

impl ButtonTracker {
    pub fn update(&mut self, buttons: Buttons, timing: &PlaybackTiming) -> Vec<Action> {
        let mut actions = Vec::new();
        if buttons.eject && !self.previous.eject {
            actions.push(Action::Eject);
        }
        if buttons.play && !self.previous.play {
            actions.push(Action::TogglePlay);
        }
        if auto_repeat(&mut self.volume_up, buttons.volume_up, timing) {
            actions.push(Action::VolumeUp);
        }
        if auto_repeat(&mut self.volume_down, buttons.volume_down, timing) {
            actions.push(Action::VolumeDown);
        }
        actions.extend(seek_or_skip(
            &mut self.next,
            buttons.next,
            timing.long_press,
            Action::SeekForward,
            Action::NextTrack,
        ));
        actions.extend(seek_or_skip(
            &mut self.prev,
            buttons.prev,
            timing.long_press,
            Action::SeekBackward,
            Action::PrevTrack,
        ));
        self.previous = buttons;
        actions
    }
}

/// Fires on the press, then every `repeat` ticks once held past a long press.
fn auto_repeat(held_for: &mut u32, held: bool, timing: &PlaybackTiming) -> bool {
    if !held {
        *held_for = 0;
        return false;
    }
    *held_for = held_for.saturating_add(1);
    let past = held_for.saturating_sub(timing.long_press);
    *held_for == 1 || (past > 0 && past % timing.repeat.max(1) == 0)
}

/// A short press skips on release; a long press seeks while held and only ends the
/// seek on release.
fn seek_or_skip(held_for: &mut u32, held: bool, long_press: u32, seek: Action, skip: Action) -> Option<Action> {
    if held {
        *held_for = held_for.saturating_add(1);
        return (*held_for >= long_press).then_some(seek);
    }
    match std::mem::take(held_for) {
        0 => None,
        n if n >= long_press => Some(Action::SeekEnd),
        _ => Some(skip),
    }
}

pub struct Playback<B> {
    slot: DriveSlot<B>,
    drive: watch::Receiver<DriveInfo>,
    state: watch::Sender<PlayerState>,
    player: PlayerState,
    sink: Box<dyn AudioSink>,
    buttons: Box<dyn ButtonSource>,
    settings: Box<dyn SettingsStore>,
    timing: PlaybackTiming,
    tracker: ButtonTracker,
    session: u64,
    /// Ticks since the last unsaved volume change.
    volume_idle: Option<u32>,
    buffer: Vec<u8>,
}

impl<B: UsbBackend> Playback<B> {
    pub fn new(
        slot: DriveSlot<B>,
        drive: watch::Receiver<DriveInfo>,
        state: watch::Sender<PlayerState>,
        sink: Box<dyn AudioSink>,
        buttons: Box<dyn ButtonSource>,
        settings: Box<dyn SettingsStore>,
        timing: PlaybackTiming,
    ) -> Self {
        let volume = settings.load_volume().unwrap_or(DEFAULT_VOLUME).min(MAX_VOLUME);
        let player = PlayerState {
            volume,
            ..PlayerState::default()
        };
        state.send_replace(player);
        Self {
            slot,
            drive,
            state,
            player,
            sink,
            buttons,
            settings,
            timing,
            tracker: ButtonTracker::default(),
            session: 0,
            volume_idle: None,
            buffer: Vec::new(),
        }
    }

    pub fn player(&self) -> PlayerState {
        self.player
    }

    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.timing.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// One pass of the loop: buttons, at most one read batch, track advance, publish.
    pub async fn tick(&mut self) {
        let drive = self.drive.borrow_and_update().clone();
        if drive.session != self.session {
            debug!(session = drive.session, "new disc session");
            self.session = drive.session;
            self.player.rewind();
        }
        self.player.ready = drive.ready_to_play;
        if !self.player.ready {
            self.stop();
        }

        if let Some(volume) = self.buttons.volume_request() {
            self.set_volume(volume);
        }
        let buttons = self.buttons.poll();
        for action in self.tracker.update(buttons, &self.timing) {
            self.apply(action, &drive).await;
        }
        self.persist_volume();

        if self.player.ready && self.player.playing && !self.player.seeking() && !self.sink.is_full() {
            self.read_batch(&drive).await;
        }
        if self.player.ready {
            self.advance_track(&drive);
        }
        self.state.send_replace(self.player);
    }

    fn stop(&mut self) {
        self.player.playing = false;
        self.player.fast_forward = false;
        self.player.fast_backward = false;
    }

    fn set_volume(&mut self, volume: u8) {
        let volume = volume.min(MAX_VOLUME);
        if volume != self.player.volume {
            debug!(volume, "volume");
            self.player.volume = volume;
            self.volume_idle = Some(0);
        }
    }

    /// Saves the volume once it stopped changing, and only while stopped.
    fn persist_volume(&mut self) {
        let Some(idle) = self.volume_idle.as_mut() else {
            return;
        };
        *idle = idle.saturating_add(1);
        if *idle >= self.timing.persist_after && !self.player.playing {
            self.settings.save_volume(self.player.volume);
            self.volume_idle = None;
        }
    }

    async fn apply(&mut self, action: Action, drive: &DriveInfo) {
        let track_count = drive.tracks.len();
        match action {
            Action::Eject => self.eject().await,
            Action::VolumeUp => self.set_volume(self.player.volume.saturating_add(self.timing.volume_step)),
            Action::VolumeDown => self.set_volume(self.player.volume.saturating_sub(self.timing.volume_step)),
            Action::TogglePlay if !self.player.ready => debug!("no disc ready, play ignored"),
            Action::TogglePlay => {
                self.player.playing = !self.player.playing;
                info!(playing = self.player.playing, track = self.player.track_index, "play/pause");
                if self.player.playing {
                    self.max_speed(self.timing.lock_wait).await;
                }
            }
            _ if !self.player.ready || track_count == 0 => {}
            Action::NextTrack => {
                self.player.track_index = (self.player.track_index + 1) % track_count;
                self.player.read_frame_count = 0;
            }
            Action::PrevTrack => {
                self.player.track_index = self
                    .player
                    .track_index
                    .checked_sub(1)
                    .unwrap_or(track_count - 1);
                self.player.read_frame_count = 0;
            }
            Action::SeekForward => {
                let duration = drive.track(self.player.track_index).map_or(0, |t| t.duration);
                self.player.fast_forward = true;
                self.player.read_frame_count = self
                    .player
                    .read_frame_count
                    .saturating_add(self.timing.seek_step)
                    .min(duration.saturating_sub(1));
            }
            Action::SeekBackward => {
                self.player.fast_backward = true;
                self.player.read_frame_count = self.player.read_frame_count.saturating_sub(self.timing.seek_step);
            }
            Action::SeekEnd => {
                self.player.fast_forward = false;
                self.player.fast_backward = false;
            }
        }
    }

    async fn eject(&mut self) {
        self.stop();
        let Some(mut device) = self.slot.lock(self.timing.lock_wait * 10).await else {
            warn!("no drive to eject");
            return;
        };
        info!("ejecting");
        if let Err(e) = device.start_stop_unit(false, true).await {
            warn!("eject failed: {e}");
        }
    }

    async fn max_speed(&mut self, wait: Duration) {
        let Some(mut device) = self.slot.lock(wait).await else {
            return;
        };
        if let Err(e) = device.set_max_speed().await {
            debug!("SET CD SPEED failed: {e}");
        }
    }

    async fn read_batch(&mut self, drive: &DriveInfo) {
        let Some(track) = drive.track(self.player.track_index) else {
            self.player.rewind();
            return;
        };
        let remaining = track.duration.saturating_sub(self.player.read_frame_count);
        let frames = remaining.min(self.sink.capacity_frames());
        if frames == 0 {
            return;
        }
        let lba = track.start_lba + self.player.read_frame_count;

        let Some(mut device) = self.slot.lock(self.timing.lock_wait).await else {
            // monitor is probing, try again next tick
            return;
        };
        match device.read_cd(lba, frames, &mut self.buffer).await {
            Ok(_) if self.sink.alternate_source_active() => {}
            Ok(_) => self.sink.push(&self.buffer),
            Err(e) => {
                warn!(lba, frames, "READ CD failed, skipping: {e}");
                if !e.is_disconnect() {
                    match device.request_sense().await {
                        Ok(sense) => warn!(%sense, "sense after failed read"),
                        Err(e) => debug!("REQUEST SENSE failed: {e}"),
                    }
                }
            }
        }
        self.player.read_frame_count += frames;
    }

    fn advance_track(&mut self, drive: &DriveInfo) {
        let Some(track) = drive.track(self.player.track_index) else {
            return;
        };
        if self.player.read_frame_count < track.duration {
            return;
        }
        self.player.read_frame_count = 0;
        if self.player.track_index + 1 < drive.tracks.len() {
            self.player.track_index += 1;
            info!(track = self.player.track_index, "next track");
        } else {
            info!("end of disc");
            self.player.rewind();
        }
    }
}
