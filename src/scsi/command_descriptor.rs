//! Underlying structures that commands are issued in

use super::command::CommandBlock;
use crate::usb::cbw::CBWDirection;

/// Operation codes for a Command Descriptor Block, specifying what operation you want
/// to do as described in 7.1 of SPC-2 and chapter 6 of MMC-5.
///
/// This enum is not complete, and is intended to grow
/// as needed
#[repr(u8)]
#[non_exhaustive]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpCode {
    /// SPC-2 7.25
    TestUnitReady = 0x00,
    /// SPC-2 7.20
    RequestSense = 0x03,
    /// SPC-2 7.3
    Inquiry = 0x12,
    /// SBC-2 5.1.18
    StartStopUnit = 0x1b,
    /// SPC-2 7.12
    PreventAllowMediumRemoval = 0x1e,
    /// MMC-5 6.26
    ReadTocPmaAtip = 0x43,
    /// MMC-5 6.6
    GetConfiguration = 0x46,
    /// MMC-5 6.22
    ReadDiscInformation = 0x51,
    /// MMC-5 6.37
    SetCdSpeed = 0xbb,
    /// MMC-5 6.19
    ReadCd = 0xbe,
}

/// As described in SPC-2 4.3.2 table 1, a typical CDB for 6 byte commands.
#[repr(C, packed)]
pub struct X6CommandDescriptor {
    ///"The `OPERATION CODE` field contains the code value identifying the operation
    /// being requested by the CDB. SAM-2 defines the general structure of the operation
    /// code value. The `OPERATION CODE` field has a consistently defined meaning across
    /// all commands. This standard specifies the operation code values used by the commands
    /// defined herein."
    ///
    /// This field specifies what command is being issued by the host
    /// to the drive.
    pub operation_code: OpCode,
    /// "A six-byte CDB contains a 21-bit `LOGICAL BLOCK ADDRESS` field."
    /// The last 3 bits are reserved.
    ///
    /// The use of this field varies from command to command.
    pub logical_block_address: [u8; 3],
    /// Depending on the opcode, this field is one of `TRANSFER LENGTH` (amount of
    /// data to be transferred, usually in blocks),
    /// `PARAMETER LIST LENGTH` (number of bytes sent from the Data-Out buffer),
    /// or `ALLOCATION LENGTH` (The maximum number of bytes a client has allocated for returned
    /// data). START STOP UNIT and PREVENT ALLOW MEDIUM REMOVAL keep their flag bits here.
    ///
    ///More info can be found in SCSI SPC2 4.3
    pub misc_len: u8,
    /// "The contents of the `CONTROL` field are defined in SAM-2. The `CONTROL` field
    /// has a consistently defined meaning across all commands."
    ///
    /// As far as I can tell, this value is set to zero by most modern implementations.
    pub control: u8,
}

impl CommandDescriptor for X6CommandDescriptor {}

/// As described in SPC-2 4.3.2 table 2, a typical CDB for 10 byte commands.
///
/// Multi-byte fields are big endian on the wire.
#[repr(C, packed)]
pub struct X10CommandDescriptor {
    /// See [`X6CommandDescriptor::operation_code`].
    pub operation_code: OpCode,
    /// (if required) the lower 5 bits identify a function to be performed under the
    /// more general command specified in the `OPERATION CODE` field. MMC commands keep
    /// their addressing flags (MSF, RT) here.
    pub service_action: u8,
    /// The use of this field varies from command to command. READ TOC keeps its format
    /// in the first byte, GET CONFIGURATION its starting feature number in the first two.
    pub logical_block_address: [u8; 4],
    /// Reserved for most commands, READ TOC keeps the track/session number here.
    pub misc_info: u8,
    /// `TRANSFER LENGTH`, `PARAMETER LIST LENGTH` or `ALLOCATION LENGTH`.
    ///
    ///More info can be found in SCSI SPC2 4.3
    pub misc_len: [u8; 2],
    /// See [`X6CommandDescriptor::control`].
    pub control: u8,
}

impl CommandDescriptor for X10CommandDescriptor {}

/// As described in SPC-2 4.3.2 table 3, a typical CDB for 12 byte commands.
///
/// READ CD and SET CD SPEED reuse the trailing bytes for their own fields, see
/// the builders in [`super::command`].
#[repr(C, packed)]
pub struct X12CommandDescriptor {
    /// See [`X6CommandDescriptor::operation_code`].
    pub operation_code: OpCode,
    /// Command specific flags. READ CD keeps the expected sector type in bits 2-4.
    pub service_action: u8,
    /// "The logical block addresses on a logical unit or within a volume partition
    /// shall begin with block zero and be contiguous up to the last logical
    /// block of that logical unit or within that partition."
    pub logical_block_address: [u8; 4],
    /// READ CD uses a 24-bit transfer length (in sectors) followed by the main channel
    /// selection byte; SET CD SPEED uses the first two bytes as the write speed.
    pub transfer_length: [u8; 4],
    /// Sub-channel selection for READ CD, reserved otherwise.
    pub misc_info: u8,
    /// See [`X6CommandDescriptor::control`].
    pub control: u8,
}

impl CommandDescriptor for X12CommandDescriptor {}

pub trait CommandDescriptor: Sized {
    fn as_slice(&'_ self) -> &[u8] {
        // SAFETY: A struct is the size of itself, and every descriptor is a packed
        // sequence of bytes without padding
        let slice: &'_ [u8] = unsafe {
            let ptr = self as *const Self as *const u8;
            std::slice::from_raw_parts(ptr, std::mem::size_of::<Self>())
        };
        slice
    }

    /// Copies the descriptor into a [`CommandBlock`] ready to be wrapped in a CBW.
    fn into_block(self, direction: CBWDirection, data_transfer_len: u32) -> CommandBlock {
        CommandBlock::new(self.as_slice(), direction, data_transfer_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_have_their_nominal_sizes() {
        assert_eq!(std::mem::size_of::<X6CommandDescriptor>(), 6);
        assert_eq!(std::mem::size_of::<X10CommandDescriptor>(), 10);
        assert_eq!(std::mem::size_of::<X12CommandDescriptor>(), 12);
    }
}
