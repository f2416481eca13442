//! The Monitor loop: follows the drive and the disc in it, and publishes [`DriveInfo`].
//!
//! ```text
//! WaitForDevice -> Spinup -> WaitForDiscReady -> VerifyAudioDisc -> ReadToc
//!     -> ReadCdText -> Ready -> WaitForRemoval -> WaitForDiscReady | WaitForDevice
//! ```
//!
//! A TOC that cannot be read sends the drive back through Spinup.
//!
//! Every wait is bounded by [`MonitorTiming`]; losing the device from any state tears
//! everything down and goes back to waiting for a device.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::state::{DriveInfo, TrackInfo};
use crate::config::MonitorTiming;
use crate::scsi::CommandError;
use crate::scsi::cd_text::CdText;
use crate::scsi::response::{MediumState, PROFILE_CD_ROM, TrayState};
use crate::scsi::toc::TocTrack;
use crate::usb::slot::DriveSlot;
use crate::usb::transport::UsbBackend;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MonitorState {
    WaitForDevice,
    Spinup,
    WaitForDiscReady,
    VerifyAudioDisc,
    ReadToc,
    ReadCdText,
    Ready,
    WaitForRemoval,
}

/// Result of one TEST UNIT READY (+ REQUEST SENSE) probe.
#[derive(Debug)]
enum Probe {
    Medium(MediumState),
    /// The other loop held the command lock for the whole wait.
    Busy,
    Failed,
    Gone,
}

pub struct Monitor<B> {
    slot: DriveSlot<B>,
    info: watch::Sender<DriveInfo>,
    timing: MonitorTiming,
    state: MonitorState,
    toc: Vec<TocTrack>,
    cd_text: Option<CdText>,
    cd_text_supported: bool,
    not_ready: u32,
    session: u64,
}

impl<B: UsbBackend> Monitor<B> {
    pub fn new(slot: DriveSlot<B>, info: watch::Sender<DriveInfo>, timing: MonitorTiming) -> Self {
        Self {
            slot,
            info,
            timing,
            state: MonitorState::WaitForDevice,
            toc: Vec::new(),
            cd_text: None,
            cd_text_supported: false,
            not_ready: 0,
            session: 0,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub async fn run(mut self) {
        loop {
            self.step().await;
        }
    }

    /// Runs the current state once and moves to the next one.
    pub async fn step(&mut self) -> MonitorState {
        let next = match self.state {
            MonitorState::WaitForDevice => self.wait_for_device().await,
            MonitorState::Spinup => self.spinup().await,
            MonitorState::WaitForDiscReady => self.wait_for_disc_ready().await,
            MonitorState::VerifyAudioDisc => self.verify_audio_disc().await,
            MonitorState::ReadToc => self.read_toc().await,
            MonitorState::ReadCdText => self.read_cd_text().await,
            MonitorState::Ready => self.ready().await,
            MonitorState::WaitForRemoval => self.wait_for_removal().await,
        };
        if next != self.state {
            debug!(from = ?self.state, to = ?next, "monitor state");
        }
        self.state = next;
        next
    }

    fn publish(&self, update: impl FnOnce(&mut DriveInfo)) {
        self.info.send_modify(update);
    }

    fn forget_disc(&mut self) {
        self.toc.clear();
        self.cd_text = None;
        self.cd_text_supported = false;
        self.not_ready = 0;
    }

    /// Full teardown after the device went away.
    async fn device_lost(&mut self) -> MonitorState {
        info!("drive lost, waiting for a device");
        self.forget_disc();
        let session = self.session;
        self.info.send_replace(DriveInfo {
            session,
            ..DriveInfo::default()
        });
        sleep(self.timing.device_poll).await;
        MonitorState::WaitForDevice
    }

    /// The command lock could not be had: either the device is gone, or the other
    /// loop is busy and the current state is retried.
    async fn unavailable(&mut self) -> MonitorState {
        if self.slot.is_open() {
            self.state
        } else {
            self.device_lost().await
        }
    }

    async fn probe(&self, wait: std::time::Duration) -> Probe {
        if !self.slot.is_open() {
            return Probe::Gone;
        }
        let Some(mut device) = self.slot.lock(wait).await else {
            return if self.slot.is_open() {
                Probe::Busy
            } else {
                Probe::Gone
            };
        };
        match device.medium_state().await {
            Ok(state) => Probe::Medium(state),
            Err(e) if e.is_disconnect() => Probe::Gone,
            Err(e) => {
                debug!(error = %e, "readiness probe failed");
                Probe::Failed
            }
        }
    }

    fn note_no_medium(&self, tray: TrayState) {
        self.publish(|info| {
            info.clear_disc();
            info.tray_closed = tray != TrayState::Open;
        });
    }

    async fn wait_for_device(&mut self) -> MonitorState {
        if !self.slot.is_open() {
            sleep(self.timing.device_poll).await;
            return MonitorState::WaitForDevice;
        }
        self.forget_disc();
        let session = self.session;
        self.info.send_replace(DriveInfo {
            session,
            ..DriveInfo::default()
        });
        MonitorState::Spinup
    }

    #[tracing::instrument(skip(self))]
    async fn spinup(&mut self) -> MonitorState {
        let slot = self.slot.clone();
        {
            let Some(mut device) = slot.lock(self.timing.scan_lock_wait).await else {
                return self.unavailable().await;
            };
            match device.inquiry().await {
                Ok(inquiry) => {
                    info!(vendor = %inquiry.vendor, product = %inquiry.product, "drive connected");
                    self.publish(|info| {
                        info.vendor = inquiry.vendor;
                        info.product = inquiry.product;
                        info.revision = inquiry.revision;
                    });
                }
                Err(e) if e.is_disconnect() => {
                    drop(device);
                    return self.device_lost().await;
                }
                Err(e) => warn!("INQUIRY failed: {e}"),
            }
            self.publish(|info| info.connected = true);

            // Many drives do not implement these, the results are only logged.
            if let Err(e) = device.prevent_allow_medium_removal(false).await {
                debug!("PREVENT ALLOW MEDIUM REMOVAL failed: {e}");
            }
            if let Err(e) = device.start_stop_unit(true, true).await {
                debug!("START STOP UNIT failed: {e}");
            }
        }

        let deadline = Instant::now() + self.timing.spinup_window;
        loop {
            match self.probe(self.timing.scan_lock_wait).await {
                Probe::Medium(MediumState::Ready) => return MonitorState::WaitForDiscReady,
                Probe::Medium(MediumState::NoMedium(tray)) => {
                    debug!(?tray, "no medium, not waiting for spin-up");
                    self.note_no_medium(tray);
                    return MonitorState::WaitForDiscReady;
                }
                Probe::Gone => return self.device_lost().await,
                Probe::Medium(_) | Probe::Busy | Probe::Failed => {}
            }
            if Instant::now() >= deadline {
                warn!(window = ?self.timing.spinup_window, "drive did not become ready while spinning up");
                return MonitorState::WaitForDiscReady;
            }
            sleep(self.timing.spinup_poll).await;
        }
    }

    async fn wait_for_disc_ready(&mut self) -> MonitorState {
        match self.probe(self.timing.scan_lock_wait).await {
            Probe::Medium(MediumState::Ready) => {
                self.publish(|info| {
                    info.tray_closed = true;
                    info.disc_inserted = true;
                });
                MonitorState::VerifyAudioDisc
            }
            Probe::Medium(MediumState::NoMedium(tray)) => {
                self.note_no_medium(tray);
                sleep(self.timing.removal_poll).await;
                MonitorState::WaitForDiscReady
            }
            Probe::Gone => self.device_lost().await,
            Probe::Medium(_) | Probe::Busy | Probe::Failed => {
                sleep(self.timing.spinup_poll).await;
                MonitorState::WaitForDiscReady
            }
        }
    }

    async fn verify_audio_disc(&mut self) -> MonitorState {
        let slot = self.slot.clone();
        let (profile, disc, feature) = {
            let Some(mut device) = slot.lock(self.timing.scan_lock_wait).await else {
                return self.unavailable().await;
            };
            let profile = device.current_profile().await;
            let disc = device.read_disc_information().await;
            let feature = device.cd_read_feature().await;
            (profile, disc, feature)
        };

        let lost = [profile.as_ref().err(), disc.as_ref().err()]
            .into_iter()
            .flatten()
            .any(CommandError::is_disconnect);
        if lost {
            return self.device_lost().await;
        }

        let audio = match (&profile, &disc) {
            (Ok(profile), Ok(disc)) => *profile == PROFILE_CD_ROM && disc.is_audio(),
            _ => false,
        };
        if !audio {
            info!(
                profile = ?profile.as_ref().ok(),
                disc_type = ?disc.as_ref().ok().map(|d| d.disc_type),
                "not an audio CD"
            );
            self.publish(|info| info.disc_is_audio = false);
            return MonitorState::WaitForRemoval;
        }

        self.cd_text_supported = matches!(&feature, Ok(Some(f)) if f.cd_text);
        self.publish(|info| info.disc_is_audio = true);
        MonitorState::ReadToc
    }

    async fn read_toc(&mut self) -> MonitorState {
        let slot = self.slot.clone();
        let toc = {
            let Some(mut device) = slot.lock(self.timing.scan_lock_wait).await else {
                return self.unavailable().await;
            };
            device.read_toc().await
        };
        match toc {
            Ok(tracks) if tracks.is_empty() => {
                info!("disc has no audio tracks");
                self.publish(|info| info.disc_is_audio = false);
                MonitorState::WaitForRemoval
            }
            Ok(tracks) => {
                debug!(count = tracks.len(), "read TOC");
                self.toc = tracks;
                if self.cd_text_supported {
                    MonitorState::ReadCdText
                } else {
                    MonitorState::Ready
                }
            }
            Err(e) if e.is_disconnect() => self.device_lost().await,
            Err(e) => {
                warn!("reading the TOC failed, spinning the drive up again: {e}");
                self.forget_disc();
                self.publish(DriveInfo::clear_disc);
                sleep(self.timing.spinup_poll).await;
                MonitorState::Spinup
            }
        }
    }

    async fn read_cd_text(&mut self) -> MonitorState {
        let slot = self.slot.clone();
        let text = {
            let Some(mut device) = slot.lock(self.timing.scan_lock_wait).await else {
                return self.unavailable().await;
            };
            device.read_cd_text().await
        };
        self.cd_text = match text {
            Ok(text) => Some(text),
            Err(e) if e.is_disconnect() => return self.device_lost().await,
            Err(e) => {
                warn!("CD-Text unavailable: {e}");
                None
            }
        };
        MonitorState::Ready
    }

    async fn ready(&mut self) -> MonitorState {
        self.session += 1;
        let text = self.cd_text.take();
        let tracks: Arc<[TrackInfo]> = self
            .toc
            .iter()
            .map(|track| TrackInfo::new(track, text.as_ref()))
            .collect();
        info!(tracks = tracks.len(), cd_text = text.is_some(), "disc ready");

        let session = self.session;
        self.publish(|info| {
            info.cd_text_available = text.is_some();
            info.album_title = text.as_ref().and_then(|t| t.album_title()).map(str::to_owned);
            info.album_performer = text.as_ref().and_then(|t| t.album_performer()).map(str::to_owned);
            info.tracks = tracks;
            info.session = session;
            info.ready_to_play = true;
        });
        sleep(self.timing.ready_settle).await;
        self.not_ready = 0;
        MonitorState::WaitForRemoval
    }

    async fn wait_for_removal(&mut self) -> MonitorState {
        let mut tray = None;
        match self.probe(self.timing.probe_lock_wait).await {
            Probe::Gone => return self.device_lost().await,
            Probe::Medium(MediumState::Ready) => self.not_ready = 0,
            Probe::Busy => {}
            Probe::Medium(MediumState::MediumChanged) => {
                // another disc was swapped in between two probes
                self.not_ready = self.timing.removal_probes;
            }
            Probe::Medium(MediumState::NoMedium(state)) => {
                tray = Some(state);
                self.not_ready += 1;
            }
            Probe::Medium(_) | Probe::Failed => self.not_ready += 1,
        }

        if self.not_ready >= self.timing.removal_probes {
            info!("disc removed");
            self.forget_disc();
            self.publish(|info| {
                info.clear_disc();
                if let Some(tray) = tray {
                    info.tray_closed = tray != TrayState::Open;
                }
            });
            return MonitorState::WaitForDiscReady;
        }
        sleep(self.timing.removal_poll).await;
        MonitorState::WaitForRemoval
    }
}
