//! Red-Book timing: 75 frames (sectors) per second.

use std::fmt;

pub const FRAMES_PER_SECOND: u32 = 75;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Hmsf {
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    pub frame: u32,
}

pub fn frame_to_hmsf(frames: u32) -> Hmsf {
    let seconds = frames / FRAMES_PER_SECOND;
    Hmsf {
        hour: seconds / 3600,
        minute: seconds % 3600 / 60,
        second: seconds % 60,
        frame: frames % FRAMES_PER_SECOND,
    }
}

impl Hmsf {
    pub fn to_frames(self) -> u32 {
        ((self.hour * 3600 + self.minute * 60 + self.second) * FRAMES_PER_SECOND) + self.frame
    }
}

/// `mm:ss.ff`, with hours folded into the minutes.
impl fmt::Display for Hmsf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}.{:02}",
            self.hour * 60 + self.minute,
            self.second,
            self.frame
        )
    }
}
