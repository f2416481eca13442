//! A USB packet containing a command block wrapper and associated
//! information.

use std::num::NonZeroU32;

use crate::scsi::CommandError;
use crate::scsi::command::CommandBlock;

/// Signature that identifies a packet as a CBW.
///
/// This packet contains the below magic number (little endian), `"USBC"` on the wire.
///
/// See USB Mass Storage Class - Bulk Only Transport, section 5
pub const CBW_SIGNATURE: u32 = 0x43425355;
/// Signature that identifies a packet as a CSW.
///
/// The packet will start with the below magic number (little endian), `"USBS"` on the wire.
pub const CSW_SIGNATURE: u32 = 0x53425355;

/// A command block wrapper is *always* 31 bytes in size
pub const CBW_SIZE: usize = 31;
/// A command status wrapper is *always* 13 bytes in size
pub const CSW_SIZE: usize = 13;

/// Direction of the optional data phase of a command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CBWDirection {
    /// Data-Out: from host to the device
    DataOut,
    /// Data-In: from the device to the host
    DataIn,
    /// For when the CBW has a data transfer length of zero.
    ///
    /// BOT ignores the direction bit entirely if the data transfer
    /// length field is zero, so it exists in the enum purely as an abstraction
    NonDirectional,
}

impl CBWDirection {
    /// `bmCBWFlags` - bit 7 set means Data-In, every other bit is reserved.
    pub fn flags(self) -> u8 {
        match self {
            CBWDirection::DataIn => 0x80,
            CBWDirection::DataOut | CBWDirection::NonDirectional => 0x00,
        }
    }
}

/// The CBW wraps an SCSI command.
///
/// The CBW is always exactly 31 bytes in size, and in little endian format.
///
/// Spec info can be found in the USB Mass Storage Class - Bulk Only Transport document,
/// section 5.
#[repr(C, packed)]
pub struct CommandBlockWrapper {
    /// `dCBWSignature` -"Signature that helps identify this packet as a CBW.
    /// The signature field shall contain the value 43425355h (little endian),
    /// indicating a CBW."
    ///
    /// This value should always be set to [`CBW_SIGNATURE`]
    signature: [u8; 4],
    /// `dCBWTag` - "A Command Block Tag sent by the host. The device shall echo
    /// the contents of this field back to the host in the [tag] field of the associated CSW.
    /// The [tag] positvely associates a CSW with the corrosponding CBW"
    ///
    /// See [`TagGenerator`] for tooling.
    pub tag: [u8; 4],
    /// `dCBWDataTransferLength` - "The number of bytes that the host expects
    /// to transfer on the Bulk-In or Bulk-Out endpoint (as indicated by the
    /// *Direction* bit) during the execution of this command. If this field
    /// is zero, the device and the host shall transfer no data between the CBW
    /// and associated CSW, and the device shall ignore the value of the *Direction*
    /// bit in *bmCBWFlags*."
    pub data_transfer_length: [u8; 4],
    /// `bmCBWFlags` - see [`CBWDirection::flags`].
    pub flags: u8,
    /// `bCBWLUN` - "The device Logical Unit Number (LUN) to which the command block
    /// is being sent. For devices that support multiple LUNs, the host shall
    /// place into this field, the LUN to which this command block is addressed.
    /// Otherwise, the host shall set this field to zero."
    ///
    /// Multiple LUNs are not supported, so this field is always zero.
    pub lun: u8,
    /// `bCBWCBLength` - "The valid length of the *CBWCB* in bytes. This defines the
    /// valid length of the command block. The only legal values are 1 through 16
    /// (01h through 10h). All other values are reserved."
    pub command_block_length: u8,
    /// `CBWCB` - "The command block to be executed by the device. The device shall
    /// first interpret the *bCBWCBLength* bytes in this field as a command block as
    /// defined by the command set *bInterfaceSubClass*."
    pub command: [u8; 16],
}

impl CommandBlockWrapper {
    /// Creates a new [`CommandBlockWrapper`].
    pub fn new(command: &CommandBlock, tag: u32) -> Self {
        Self {
            signature: CBW_SIGNATURE.to_le_bytes(),
            tag: tag.to_le_bytes(),
            data_transfer_length: command.data_transfer_len.to_le_bytes(),
            flags: command.direction.flags(),
            lun: 0,
            command_block_length: command.len() as u8,
            command: command.get(),
        }
    }

    /// Returns a slice containing the entirety of `self` that is exactly [`CBW_SIZE`] bytes in length
    pub fn as_slice(&'_ self) -> &[u8] {
        const {
            assert!(
                std::mem::size_of::<CommandBlockWrapper>() == CBW_SIZE,
                "CommandBlockWrapper not 31 bytes in size"
            );
        };
        // SAFETY: the const assertion above
        // guarantees that the size is as we expected, every field is a byte
        // or byte array, and we know the lifetime of `self` is valid.
        let slice: &'_ [u8] = unsafe {
            let ptr = self as *const CommandBlockWrapper as *const u8;
            std::slice::from_raw_parts(ptr, CBW_SIZE)
        };
        slice
    }
}

/// `bCSWStatus` as reported by the device.
///
/// | Value | Description                    |
/// | ----- | ------------------------------ |
/// | 0x00  | Command Passed ("good status") |
/// | 0x01  | Command Failed                 |
/// | 0x02  | Phase Error                    |
/// | _     | All other values are reserved  |
///
/// Reserved values are folded into [`CommandStatus::PhaseError`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandStatus {
    Passed,
    Failed,
    PhaseError(u8),
}

impl From<u8> for CommandStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => CommandStatus::Passed,
            1 => CommandStatus::Failed,
            other => CommandStatus::PhaseError(other),
        }
    }
}

/// A packet containing the status/return value of a command block executed by the USB device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CommandStatusWrapper {
    /// `dCSWTag` - "The device shall set this field to the value received in the *dCBWTag* of
    /// the associated CBW."
    pub tag: u32,
    /// `dCSWDataResidue` - the difference between the amount of data expected as stated
    /// in the *dCBWDataTransferLength* and the actual amount of data processed by the device.
    pub data_residue: u32,
    /// `bCSWStatus`
    pub status: CommandStatus,
}

impl CommandStatusWrapper {
    /// Decode the provided slice into a command status wrapper.
    ///
    /// This function validates the length and the `signature`.
    pub fn from_slice(buf: &[u8]) -> Result<CommandStatusWrapper, CommandError> {
        if buf.len() != CSW_SIZE {
            return Err(CommandError::InvalidStatus(format!(
                "CSW must be exactly {CSW_SIZE} bytes, was {}",
                buf.len()
            )));
        }
        let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let signature = word(0);
        if signature != CSW_SIGNATURE {
            return Err(CommandError::InvalidStatus(format!(
                "invalid magic number for command status wrapper, should be 0x53425355, is 0x{signature:X}"
            )));
        }
        Ok(CommandStatusWrapper {
            tag: word(4),
            data_residue: word(8),
            status: CommandStatus::from(buf[12]),
        })
    }

    /// Checks that this CSW answers the CBW sent with `sent_tag` and maps the status
    /// byte onto the command outcome.
    pub fn validate(&self, sent_tag: u32) -> Result<(), CommandError> {
        if self.tag != sent_tag {
            return Err(CommandError::TagMismatch {
                sent: sent_tag,
                received: self.tag,
            });
        }
        match self.status {
            CommandStatus::Passed => Ok(()),
            CommandStatus::Failed => Err(CommandError::CheckCondition),
            CommandStatus::PhaseError(raw) => Err(CommandError::PhaseError(raw)),
        }
    }
}

/// Hands out `dCBWTag` values for one device.
///
/// Tags count up and skip zero when they wrap, so a zero-filled CSW never matches.
#[derive(Debug, Clone)]
pub struct TagGenerator {
    next: NonZeroU32,
}

impl TagGenerator {
    pub fn new() -> TagGenerator {
        Self::starting_at(NonZeroU32::MIN)
    }

    pub fn starting_at(first: NonZeroU32) -> TagGenerator {
        Self { next: first }
    }

    pub fn next_tag(&mut self) -> u32 {
        let tag = self.next;
        self.next = tag.checked_add(1).unwrap_or(NonZeroU32::MIN);
        tag.get()
    }
}

impl Default for TagGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::command;
    use proptest::prelude::*;

    fn csw_bytes(tag: u32, status: u8) -> [u8; CSW_SIZE] {
        let mut out = [0u8; CSW_SIZE];
        out[..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        out[4..8].copy_from_slice(&tag.to_le_bytes());
        out[12] = status;
        out
    }

    #[test]
    fn reserved_status_is_a_phase_error() {
        // Captured from an actual USB device, with the last byte (command_status) modified to
        // a reserved value (0xaa)
        let input_packet = [0x55, 0x53, 0x42, 0x53, 0, 0, 0, 0, 0, 0, 0, 0, 0xaa];
        let csw = CommandStatusWrapper::from_slice(&input_packet).unwrap();
        assert_eq!(csw.status, CommandStatus::PhaseError(0xaa));
        assert!(matches!(csw.validate(0), Err(CommandError::PhaseError(0xaa))));
    }

    #[test]
    fn rejects_bad_signature_and_length() {
        let mut packet = csw_bytes(1, 0);
        packet[0] = b'X';
        assert!(matches!(
            CommandStatusWrapper::from_slice(&packet),
            Err(CommandError::InvalidStatus(_))
        ));
        assert!(matches!(
            CommandStatusWrapper::from_slice(&packet[..12]),
            Err(CommandError::InvalidStatus(_))
        ));
    }

    #[test]
    fn failed_status_asks_for_sense() {
        let csw = CommandStatusWrapper::from_slice(&csw_bytes(9, 1)).unwrap();
        assert!(matches!(csw.validate(9), Err(CommandError::CheckCondition)));
    }

    #[test]
    fn cbw_layout_matches_wire_format() {
        let block = command::request_sense();
        let cbw = CommandBlockWrapper::new(&block, 0x0102_0304);
        let bytes = cbw.as_slice();
        assert_eq!(&bytes[..4], b"USBC");
        assert_eq!(&bytes[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[8..12], &18u32.to_le_bytes());
        assert_eq!(bytes[12], 0x80);
        assert_eq!(bytes[13], 0);
        assert_eq!(bytes[14], 6);
        assert_eq!(bytes[15], 0x03);
        assert_eq!(bytes[19], 18);
    }

    #[test]
    fn tags_count_up_and_never_hit_zero() {
        let mut tags = TagGenerator::new();
        assert_eq!((tags.next_tag(), tags.next_tag(), tags.next_tag()), (1, 2, 3));

        let mut tags = TagGenerator::starting_at(NonZeroU32::MAX);
        assert_eq!(tags.next_tag(), u32::MAX);
        assert_eq!(tags.next_tag(), 1);
    }

    proptest! {
        #[test]
        fn tag_mismatch_is_always_rejected(sent in any::<u32>(), received in any::<u32>()) {
            let csw = CommandStatusWrapper::from_slice(&csw_bytes(received, 0)).unwrap();
            let outcome = csw.validate(sent);
            if sent == received {
                prop_assert!(outcome.is_ok());
            } else {
                let is_mismatch = matches!(outcome, Err(CommandError::TagMismatch { .. }));
                prop_assert!(is_mismatch);
            }
        }
    }
}
