//! Snapshots shared between the engine loops and their readers.
//!
//! [`DriveInfo`] is written by the Monitor loop only and [`PlayerState`] by the
//! Playback loop only; both are published whole through `tokio::sync::watch`, so a
//! reader always sees one consistent snapshot. The track table is reference counted:
//! tearing down a disc replaces the table, it never frees strings under a reader.

use std::sync::Arc;

use crate::scsi::cd_text::CdText;
use crate::scsi::toc::TocTrack;

/// One audio track of the current disc.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackInfo {
    /// Track number as printed on the disc, data tracks leave gaps.
    pub number: u8,
    pub pre_emphasis: bool,
    pub title: Option<String>,
    pub performer: Option<String>,
    pub start_lba: u32,
    /// Length in frames.
    pub duration: u32,
}

impl TrackInfo {
    pub fn new(track: &TocTrack, text: Option<&CdText>) -> Self {
        Self {
            number: track.number,
            pre_emphasis: track.pre_emphasis,
            title: text.and_then(|t| t.title(track.number)).map(str::to_owned),
            performer: text.and_then(|t| t.performer(track.number)).map(str::to_owned),
            start_lba: track.start_lba,
            duration: track.duration,
        }
    }
}

/// What a status display should say about the drive.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DriveStatus {
    NoDrive,
    TrayOpen,
    NoDisc,
    NotAudio,
    /// A disc is in but not (yet) ready to play.
    Loading,
    Ready,
}

impl DriveStatus {
    pub fn label(self) -> &'static str {
        match self {
            DriveStatus::NoDrive => "No drive",
            DriveStatus::TrayOpen => "Tray open",
            DriveStatus::NoDisc => "No disc",
            DriveStatus::NotAudio => "Not CD-DA",
            DriveStatus::Loading => "Loading",
            DriveStatus::Ready => "Ready",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DriveInfo {
    pub vendor: String,
    pub product: String,
    pub revision: String,
    pub connected: bool,
    pub tray_closed: bool,
    pub disc_inserted: bool,
    pub disc_is_audio: bool,
    pub cd_text_available: bool,
    pub album_title: Option<String>,
    pub album_performer: Option<String>,
    pub tracks: Arc<[TrackInfo]>,
    pub ready_to_play: bool,
    /// Bumped every time a disc becomes ready, so a new disc is never mistaken for the
    /// previous one.
    pub session: u64,
}

impl DriveInfo {
    pub fn status(&self) -> DriveStatus {
        if !self.connected {
            DriveStatus::NoDrive
        } else if !self.tray_closed {
            DriveStatus::TrayOpen
        } else if !self.disc_inserted {
            DriveStatus::NoDisc
        } else if self.ready_to_play {
            DriveStatus::Ready
        } else if !self.disc_is_audio {
            DriveStatus::NotAudio
        } else {
            DriveStatus::Loading
        }
    }

    /// Forgets everything about the current disc, keeping the drive identity.
    pub fn clear_disc(&mut self) {
        self.disc_inserted = false;
        self.disc_is_audio = false;
        self.cd_text_available = false;
        self.album_title = None;
        self.album_performer = None;
        self.tracks = Arc::from(Vec::new());
        self.ready_to_play = false;
    }

    pub fn track(&self, index: usize) -> Option<&TrackInfo> {
        self.tracks.get(index)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PlayerState {
    /// 0 to 100.
    pub volume: u8,
    pub ready: bool,
    pub playing: bool,
    /// Index into [`DriveInfo::tracks`].
    pub track_index: usize,
    pub fast_forward: bool,
    pub fast_backward: bool,
    /// Frames played (or skipped) in the current track.
    pub read_frame_count: u32,
}

pub const DEFAULT_VOLUME: u8 = 50;
pub const MAX_VOLUME: u8 = 100;

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            volume: DEFAULT_VOLUME,
            ready: false,
            playing: false,
            track_index: 0,
            fast_forward: false,
            fast_backward: false,
            read_frame_count: 0,
        }
    }
}

impl PlayerState {
    pub fn seeking(&self) -> bool {
        self.fast_forward || self.fast_backward
    }

    /// Back to the first track, stopped.
    pub fn rewind(&mut self) {
        self.playing = false;
        self.fast_forward = false;
        self.fast_backward = false;
        self.track_index = 0;
        self.read_frame_count = 0;
    }
}
