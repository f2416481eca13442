//! Representations for SCSI commands.
//!
//! This module uses the term "command descriptor" to describe a struct and implementation specific
//! details behind a CDB, and uses the term "command block" to describe a "black box" containing
//! a valid CDB.
//!
//! Commands are exposed as a function that returns a [`CommandBlock`]. These functions wrap
//! the more granular descriptor structs in [`super::command_descriptor`].

use super::command_descriptor::*;
use crate::usb::cbw::CBWDirection;

/// Size of a Red-Book CD-DA sector (one frame of audio) as returned by READ CD.
pub const CD_DA_SECTOR_SIZE: usize = 2352;
/// Allocation length of fixed format sense data.
pub const SENSE_LEN: usize = 18;
/// "The standard INQUIRY data shall contain at least 36 bytes" (SPC-2 table 46)
pub const INQUIRY_LEN: usize = 36;
/// Size of standard disc information (MMC-5 table 301).
pub const DISC_INFORMATION_LEN: usize = 34;

/// A serialized command block ready to be submitted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandBlock {
    command: [u8; 16],
    len: usize,
    pub direction: CBWDirection,
    pub data_transfer_len: u32,
}

impl CommandBlock {
    /// `command` longer than 16 bytes is truncated; CDBs are at most 16 bytes.
    pub fn new(command: &[u8], direction: CBWDirection, data_transfer_len: u32) -> Self {
        let len = command.len().min(16);
        let mut bytes = [0u8; 16];
        bytes[..len].copy_from_slice(&command[..len]);
        let direction = if data_transfer_len == 0 {
            CBWDirection::NonDirectional
        } else {
            direction
        };
        Self {
            command: bytes,
            len,
            direction,
            data_transfer_len,
        }
    }

    /// Returns the length of the underlying command block.
    ///
    /// Will always be at most 16 bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn opcode(&self) -> u8 {
        self.command[0]
    }

    /// The significant bytes of the CDB.
    pub fn as_bytes(&self) -> &[u8] {
        &self.command[..self.len]
    }

    /// Returns a valid command block, prepared as described by USB Mass
    /// Storage Class - Bulk Only Transport section 5.1 (CBWCB).
    pub fn get(&self) -> [u8; 16] {
        self.command
    }
}

fn x6(operation_code: OpCode, misc_len: u8) -> X6CommandDescriptor {
    X6CommandDescriptor {
        operation_code,
        logical_block_address: [0, 0, 0],
        misc_len,
        control: 0,
    }
}

/// "The TEST UNIT READY command provides a means to check if the logical unit is ready.
///
/// If the logical unit is able to accept an appropriate medium access command without
/// returning CHECK CONDITION status, this command shall return a GOOD status. If the logical
/// unit is unable to become operational or is in a state such that an applicaton client action
/// (e.g START UNIT command) is required to make the unit ready, the device server shall return
/// CHECK CONDITION status with a sense key of NOT READY."
///
/// Defined in SPC2 7.25
pub fn test_unit_ready() -> CommandBlock {
    x6(OpCode::TestUnitReady, 0).into_block(CBWDirection::NonDirectional, 0)
}

/// "The REQUEST SENSE command requests that the device server transfer sense data
/// to the application client."
///
/// Defined in SPC-2 7.20, fixed format sense data is 18 bytes long.
pub fn request_sense() -> CommandBlock {
    x6(OpCode::RequestSense, SENSE_LEN as u8).into_block(CBWDirection::DataIn, SENSE_LEN as u32)
}

/// "The INQUIRY command requests that information regarding parameters
/// of the target and a component logical unit be sent to the application client.
/// Options allow the client to request additional information."
///
/// Defined in SPC2 7.3.1 table 45
pub fn inquiry() -> CommandBlock {
    x6(OpCode::Inquiry, INQUIRY_LEN as u8).into_block(CBWDirection::DataIn, INQUIRY_LEN as u32)
}

/// "The PREVENT ALLOW MEDIUM REMOVAL command (see table 77) requests that
/// the target enable or disable the removal of the medium in the logical unit."
///
/// SPC-2 7.12
pub fn prevent_allow_medium_removal(prevent: bool) -> CommandBlock {
    x6(OpCode::PreventAllowMediumRemoval, prevent as u8).into_block(CBWDirection::NonDirectional, 0)
}

/// START STOP UNIT, SBC-2 5.1.18. `start` spins the medium up (or down), `load_eject`
/// additionally loads (with `start`) or ejects (without) the medium.
pub fn start_stop_unit(start: bool, load_eject: bool) -> CommandBlock {
    let flags = (start as u8) | ((load_eject as u8) << 1);
    x6(OpCode::StartStopUnit, flags).into_block(CBWDirection::NonDirectional, 0)
}

/// Which features GET CONFIGURATION reports (MMC-5 table 86).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    All = 0x00,
    Current = 0x01,
    /// Only the feature named by the starting feature number.
    Single = 0x02,
}

/// GET CONFIGURATION, MMC-5 6.6.
pub fn get_configuration(rt: RequestType, starting_feature: u16, allocation_len: u16) -> CommandBlock {
    let feature = starting_feature.to_be_bytes();
    X10CommandDescriptor {
        operation_code: OpCode::GetConfiguration,
        service_action: rt as u8,
        logical_block_address: [feature[0], feature[1], 0, 0],
        misc_info: 0,
        misc_len: allocation_len.to_be_bytes(),
        control: 0,
    }
    .into_block(CBWDirection::DataIn, allocation_len as u32)
}

/// READ DISC INFORMATION, MMC-5 6.22, standard disc information.
pub fn read_disc_information() -> CommandBlock {
    X10CommandDescriptor {
        operation_code: OpCode::ReadDiscInformation,
        service_action: 0,
        logical_block_address: [0; 4],
        misc_info: 0,
        misc_len: (DISC_INFORMATION_LEN as u16).to_be_bytes(),
        control: 0,
    }
    .into_block(CBWDirection::DataIn, DISC_INFORMATION_LEN as u32)
}

/// Response formats of READ TOC/PMA/ATIP (MMC-5 table 478).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TocFormat {
    /// Formatted TOC, one 8-byte descriptor per track plus the lead-out.
    Toc = 0x00,
    /// CD-Text packs from the lead-in.
    CdText = 0x05,
}

/// READ TOC/PMA/ATIP, MMC-5 6.26, with LBA addressing starting from track 1.
pub fn read_toc(format: TocFormat, allocation_len: u16) -> CommandBlock {
    let track = match format {
        TocFormat::Toc => 1,
        TocFormat::CdText => 0,
    };
    X10CommandDescriptor {
        operation_code: OpCode::ReadTocPmaAtip,
        service_action: 0,
        logical_block_address: [format as u8, 0, 0, 0],
        misc_info: track,
        misc_len: allocation_len.to_be_bytes(),
        control: 0,
    }
    .into_block(CBWDirection::DataIn, allocation_len as u32)
}

/// READ CD, MMC-5 6.19: `frames` whole CD-DA sectors starting at `lba`, user data only.
pub fn read_cd(lba: u32, frames: u32) -> CommandBlock {
    let length = frames.to_be_bytes();
    X12CommandDescriptor {
        operation_code: OpCode::ReadCd,
        // expected sector type: CD-DA
        service_action: 0b001 << 2,
        logical_block_address: lba.to_be_bytes(),
        // 24-bit transfer length, then main channel selection: user data
        transfer_length: [length[1], length[2], length[3], 0x10],
        misc_info: 0,
        control: 0,
    }
    .into_block(CBWDirection::DataIn, frames * CD_DA_SECTOR_SIZE as u32)
}

/// SET CD SPEED, MMC-5 6.37, asking for the maximum read speed the drive supports.
pub fn set_cd_speed_max() -> CommandBlock {
    X12CommandDescriptor {
        operation_code: OpCode::SetCdSpeed,
        service_action: 0,
        // read speed 0xFFFF = maximum, then the write speed
        logical_block_address: [0xff, 0xff, 0xff, 0xff],
        transfer_length: [0; 4],
        misc_info: 0,
        control: 0,
    }
    .into_block(CBWDirection::NonDirectional, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_command_block() {
        // Ensures that a single byte is packed successfully
        let cb = CommandBlock::new(&[1], CBWDirection::NonDirectional, 0);
        let mut serialized_cb = cb.get().into_iter();
        assert!(serialized_cb.next() == Some(1));
        assert!(serialized_cb.all(|b| b == 0));
        assert_eq!(cb.len(), 1);
    }

    #[test]
    fn zero_length_commands_are_non_directional() {
        let cb = CommandBlock::new(&[0x00; 6], CBWDirection::DataIn, 0);
        assert_eq!(cb.direction, CBWDirection::NonDirectional);
    }

    #[test]
    fn read_cd_encodes_big_endian_fields() {
        let cb = read_cd(0x0001_0203, 27);
        assert_eq!(
            cb.as_bytes(),
            &[0xbe, 0x04, 0x00, 0x01, 0x02, 0x03, 0x00, 0x00, 27, 0x10, 0x00, 0x00]
        );
        assert_eq!(cb.data_transfer_len, 27 * 2352);
        assert_eq!(cb.direction, CBWDirection::DataIn);
    }

    #[test]
    fn read_toc_carries_format_and_allocation() {
        let cb = read_toc(TocFormat::CdText, 0x1234);
        assert_eq!(
            cb.as_bytes(),
            &[0x43, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x12, 0x34, 0x00]
        );
    }

    #[test]
    fn start_stop_flags() {
        assert_eq!(start_stop_unit(true, true).as_bytes()[4], 0b11);
        assert_eq!(start_stop_unit(false, true).as_bytes()[4], 0b10);
        assert_eq!(prevent_allow_medium_removal(false).as_bytes(), &[0x1e, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn get_configuration_single_feature() {
        let cb = get_configuration(RequestType::Single, 0x001e, 16);
        assert_eq!(
            cb.as_bytes(),
            &[0x46, 0x02, 0x00, 0x1e, 0x00, 0x00, 0x00, 0x00, 16, 0x00]
        );
    }
}
