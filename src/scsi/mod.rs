//! SCSI protocol and format implementation as described in:
//! - SCSI Primary Commands – 2 (SPC-2):
//!   <https://www.rockbox.org/wiki/pub/Main/DataSheets/spc2r20.pdf>
//!   This is an older version of the SCSI specification.
//!   It has enough information to describe almost every command we need to know,
//!   except for some information specific to block devices, which is described in the next SCSI
//!   specification linked below.
//! - SCSI Block Commands – 2 (SBC-2)
//!   <https://raw.githubusercontent.com/carmark/papers/master/storage/scsi/sbc2r16.pdf>
//!   This is an older version of the SCSI block commands specification. It contains information
//!   about commands specific to block devices.
//! - SCSI Multimedia Commands – 5 (MMC-5), for everything specific to optical drives
//!   (TOC, CD-Text, READ CD, feature profiles).

pub mod cd_text;
pub mod command;
mod command_descriptor;
pub mod response;
pub mod toc;

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};

use crate::usb::cbw::{CSW_SIZE, CBWDirection, CommandBlockWrapper, CommandStatusWrapper, TagGenerator};
use crate::usb::transport::{TransportError, USBDrive, UsbBackend};
use cd_text::CdText;
use command::{CD_DA_SECTOR_SIZE, CommandBlock, RequestType, TocFormat};
use response::{
    CdReadFeature, Configuration, DiscInformation, FEATURE_CD_READ, Inquiry, MediumState,
    ParseError, Sense,
};
use toc::TocTrack;

/// Timeout for commands answered straight from drive firmware.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for commands that may need the motor (spin-up, tray movement, media reads).
pub const MEDIUM_TIMEOUT: Duration = Duration::from_secs(20);
/// Timeout for one READ CD batch.
pub const READ_TIMEOUT: Duration = Duration::from_secs(8);

/// Size of the READ TOC response header, which declares the length of the rest.
const TOC_HEADER_LEN: usize = 4;

/// Outcome of one BOT command exchange that did not end in success.
#[derive(Debug, Error)]
pub enum CommandError {
    /// A phase failed in the transport, later phases were not attempted.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    /// CSW status 1, the caller should issue REQUEST SENSE.
    #[error("device reported CHECK CONDITION")]
    CheckCondition,
    #[error("phase error (CSW status {0:#04x})")]
    PhaseError(u8),
    #[error("invalid CSW: {0}")]
    InvalidStatus(String),
    #[error("CSW tag {received:#x} does not match CBW tag {sent:#x}")]
    TagMismatch { sent: u32, received: u32 },
    #[error("data buffer of {provided} bytes cannot hold the {needed} bytes requested")]
    BufferTooSmall { needed: usize, provided: usize },
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl CommandError {
    pub fn is_check_condition(&self) -> bool {
        matches!(self, CommandError::CheckCondition)
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, CommandError::Transport(TransportError::Disconnected))
    }
}

/// An abstraction over an underlying USB
/// mass storage device.
///
/// Commands are defined in the `command` module, and
/// issued to the device with [`SCSIDevice::send_command`] or one of the typed
/// wrappers below.
pub struct SCSIDevice<B> {
    drive: USBDrive<B>,
    tags: TagGenerator,
}

impl<B: UsbBackend> SCSIDevice<B> {
    pub fn new(drive: USBDrive<B>) -> Self {
        Self {
            drive,
            tags: TagGenerator::new(),
        }
    }

    pub fn drive(&self) -> &USBDrive<B> {
        &self.drive
    }

    pub fn drive_mut(&mut self) -> &mut USBDrive<B> {
        &mut self.drive
    }

    /// Runs one Bulk-Only Transport exchange: CBW out, optional data phase, CSW in.
    ///
    /// `data` must hold at least `block.data_transfer_len` bytes; it is the source of a
    /// Data-Out phase or the destination of a Data-In phase. Returns the number of
    /// bytes actually moved in the data phase.
    pub async fn send_command(
        &mut self,
        block: &CommandBlock,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, CommandError> {
        let len = block.data_transfer_len as usize;
        if block.direction != CBWDirection::NonDirectional && data.len() < len {
            return Err(CommandError::BufferTooSmall {
                needed: len,
                provided: data.len(),
            });
        }

        let tag = self.tags.next_tag();
        let cbw = CommandBlockWrapper::new(block, tag);
        trace!(opcode = block.opcode(), tag, len, "sending CBW");
        self.drive.bulk_out(cbw.as_slice(), timeout).await?;

        let transferred = match block.direction {
            CBWDirection::DataIn => self.drive.bulk_in(&mut data[..len], timeout).await?,
            CBWDirection::DataOut => self.drive.bulk_out(&data[..len], timeout).await?,
            CBWDirection::NonDirectional => 0,
        };

        let mut csw = [0u8; CSW_SIZE];
        let received = self.drive.bulk_in(&mut csw, timeout).await?;
        let status = CommandStatusWrapper::from_slice(&csw[..received])?;
        if status.data_residue != 0 {
            trace!(residue = status.data_residue, "short data phase");
        }
        status.validate(tag)?;
        Ok(transferred)
    }

    async fn data_in(&mut self, block: CommandBlock, timeout: Duration) -> Result<Vec<u8>, CommandError> {
        let mut data = vec![0u8; block.data_transfer_len as usize];
        let n = self.send_command(&block, &mut data, timeout).await?;
        data.truncate(n);
        Ok(data)
    }

    async fn no_data(&mut self, block: CommandBlock, timeout: Duration) -> Result<(), CommandError> {
        self.send_command(&block, &mut [], timeout).await.map(|_| ())
    }

    #[tracing::instrument(skip(self))]
    pub async fn inquiry(&mut self) -> Result<Inquiry, CommandError> {
        let data = self.data_in(command::inquiry(), COMMAND_TIMEOUT).await?;
        let inquiry = Inquiry::parse(&data)?;
        debug!(?inquiry, "INQUIRY");
        Ok(inquiry)
    }

    pub async fn test_unit_ready(&mut self) -> Result<(), CommandError> {
        self.no_data(command::test_unit_ready(), COMMAND_TIMEOUT).await
    }

    pub async fn request_sense(&mut self) -> Result<Sense, CommandError> {
        let data = self.data_in(command::request_sense(), COMMAND_TIMEOUT).await?;
        Ok(Sense::parse(&data)?)
    }

    /// TEST UNIT READY, followed by REQUEST SENSE when the drive reports CHECK CONDITION.
    pub async fn medium_state(&mut self) -> Result<MediumState, CommandError> {
        match self.test_unit_ready().await {
            Ok(()) => Ok(MediumState::Ready),
            Err(CommandError::CheckCondition) => {
                let sense = self.request_sense().await?;
                trace!(%sense, "TEST UNIT READY failed");
                Ok(sense.medium_state())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn prevent_allow_medium_removal(&mut self, prevent: bool) -> Result<(), CommandError> {
        self.no_data(command::prevent_allow_medium_removal(prevent), COMMAND_TIMEOUT)
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn start_stop_unit(&mut self, start: bool, load_eject: bool) -> Result<(), CommandError> {
        self.no_data(command::start_stop_unit(start, load_eject), MEDIUM_TIMEOUT)
            .await
    }

    pub async fn get_configuration(
        &mut self,
        request_type: RequestType,
        starting_feature: u16,
        allocation_len: u16,
    ) -> Result<Configuration, CommandError> {
        let block = command::get_configuration(request_type, starting_feature, allocation_len);
        let data = self.data_in(block, COMMAND_TIMEOUT).await?;
        Ok(Configuration::parse(&data)?)
    }

    /// The current MMC profile, 0x0008 for a CD-ROM.
    pub async fn current_profile(&mut self) -> Result<u16, CommandError> {
        // header only
        let config = self.get_configuration(RequestType::Current, 0, 8).await?;
        Ok(config.current_profile)
    }

    /// The CD Read feature descriptor, if the drive has one.
    pub async fn cd_read_feature(&mut self) -> Result<Option<CdReadFeature>, CommandError> {
        let config = self
            .get_configuration(RequestType::Single, FEATURE_CD_READ, 16)
            .await?;
        Ok(config.cd_read)
    }

    pub async fn read_disc_information(&mut self) -> Result<DiscInformation, CommandError> {
        let data = self
            .data_in(command::read_disc_information(), MEDIUM_TIMEOUT)
            .await?;
        Ok(DiscInformation::parse(&data)?)
    }

    /// READ TOC/PMA/ATIP in two steps: the header first, to learn the length of the
    /// response, then the whole response.
    pub async fn read_toc_raw(&mut self, format: TocFormat) -> Result<Vec<u8>, CommandError> {
        let header = self
            .data_in(command::read_toc(format, TOC_HEADER_LEN as u16), MEDIUM_TIMEOUT)
            .await?;
        if header.len() < 2 {
            return Err(ParseError::TooShort {
                what: "READ TOC header",
                len: header.len(),
            }
            .into());
        }
        let declared = u16::from_be_bytes([header[0], header[1]]) as usize + 2;
        debug!(?format, declared, "READ TOC header");
        if declared <= header.len() {
            return Ok(header);
        }
        let allocation = u16::try_from(declared)
            .map_err(|_| ParseError::Invalid(format!("TOC length {declared} out of range")))?;
        self.data_in(command::read_toc(format, allocation), MEDIUM_TIMEOUT)
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn read_toc(&mut self) -> Result<Vec<TocTrack>, CommandError> {
        let raw = self.read_toc_raw(TocFormat::Toc).await?;
        Ok(toc::parse_toc(&raw)?)
    }

    #[tracing::instrument(skip(self))]
    pub async fn read_cd_text(&mut self) -> Result<CdText, CommandError> {
        let raw = self.read_toc_raw(TocFormat::CdText).await?;
        Ok(cd_text::parse_cd_text(&raw)?)
    }

    /// Reads `frames` CD-DA sectors starting at `lba` into `out`, which is resized to fit.
    /// Returns the number of bytes read.
    pub async fn read_cd(&mut self, lba: u32, frames: u32, out: &mut Vec<u8>) -> Result<usize, CommandError> {
        out.resize(frames as usize * CD_DA_SECTOR_SIZE, 0);
        let block = command::read_cd(lba, frames);
        let n = self.send_command(&block, out, READ_TIMEOUT).await?;
        out.truncate(n);
        Ok(n)
    }

    /// Asks the drive to read as fast as it can.
    pub async fn set_max_speed(&mut self) -> Result<(), CommandError> {
        self.no_data(command::set_cd_speed_max(), COMMAND_TIMEOUT).await
    }
}
