//! Contracts of the collaborators around the engine.

/// Consumer of raw CD-DA sectors (16-bit little endian stereo PCM).
pub trait AudioSink: Send {
    /// Backpressure: no read is issued while this is true.
    fn is_full(&self) -> bool;

    /// Largest batch, in frames, a single [`AudioSink::push`] may carry.
    fn capacity_frames(&self) -> u32;

    fn push(&mut self, pcm: &[u8]);

    /// While another audio source is streaming, read sectors are discarded.
    fn alternate_source_active(&self) -> bool {
        false
    }
}

/// Button levels sampled once per Playback tick, `true` while held.
///
/// Edges, long presses and auto-repeat are derived by the Playback loop.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Buttons {
    pub eject: bool,
    pub volume_up: bool,
    pub volume_down: bool,
    /// Next track, fast-forward while held.
    pub next: bool,
    /// Previous track, fast-backward while held.
    pub prev: bool,
    pub play: bool,
}

pub trait ButtonSource: Send {
    fn poll(&mut self) -> Buttons;

    /// An absolute volume requested out of band (remote control, companion app).
    fn volume_request(&mut self) -> Option<u8> {
        None
    }
}

pub trait SettingsStore: Send {
    fn load_volume(&self) -> Option<u8>;

    fn save_volume(&mut self, volume: u8);
}
