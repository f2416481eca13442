//! Representations for responses to SCSI commands.

use thiserror::Error;

/// MMC profile number of a CD-ROM (read-only CD media, including CD-DA).
pub const PROFILE_CD_ROM: u16 = 0x0008;
/// MMC feature number of the CD Read feature.
pub const FEATURE_CD_READ: u16 = 0x001e;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("{what} response too short: {len} bytes")]
    TooShort { what: &'static str, len: usize },
    #[error("CD-Text block length {0} is not a whole number of packs")]
    PackAlignment(usize),
    #[error("CD-Text pack {kind:#04x} for track {got} arrived while track {expected} was expected")]
    OutOfOrder { kind: u8, expected: u8, got: u8 },
    #[error("invalid response: {0}")]
    Invalid(String),
}

fn ensure_len(what: &'static str, buf: &[u8], len: usize) -> Result<(), ParseError> {
    if buf.len() < len {
        return Err(ParseError::TooShort {
            what,
            len: buf.len(),
        });
    }
    Ok(())
}

fn ascii_field(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|b| **b != 0)
        .map(|b| if b.is_ascii_graphic() || *b == b' ' { *b as char } else { '?' })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Standard INQUIRY data, SPC-2 table 46.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Inquiry {
    /// PERIPHERAL QUALIFIER (bits 7:5) and PERIPHERAL DEVICE TYPE (bits 4:0).
    ///
    /// An optical drive reports device type 0x05 (CD/DVD device).
    pub peripheral_info: u8,
    pub removable: bool,
    /// `T10 VENDOR IDENTIFICATION`, bytes 8..16
    pub vendor: String,
    /// `PRODUCT IDENTIFICATION`, bytes 16..32
    pub product: String,
    /// `PRODUCT REVISION LEVEL`, bytes 32..36
    pub revision: String,
}

impl Inquiry {
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        ensure_len("INQUIRY", buf, 36)?;
        Ok(Self {
            peripheral_info: buf[0],
            removable: buf[1] & 0x80 != 0,
            vendor: ascii_field(&buf[8..16]),
            product: ascii_field(&buf[16..32]),
            revision: ascii_field(&buf[32..36]),
        })
    }
}

/// The interesting part of fixed format sense data (SPC-2 7.20.2).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Sense {
    pub key: u8,
    /// ADDITIONAL SENSE CODE
    pub asc: u8,
    /// ADDITIONAL SENSE CODE QUALIFIER
    pub ascq: u8,
}

/// Whether the tray is open, when the drive says so.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrayState {
    Open,
    Closed,
    Unknown,
}

/// What a sense triple says about the medium, as consumed by the disc monitor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MediumState {
    /// No sense to report.
    Ready,
    /// ASC 0x3A, MEDIUM NOT PRESENT.
    NoMedium(TrayState),
    /// ASC 0x04 ASCQ 0x01, LOGICAL UNIT IS IN PROCESS OF BECOMING READY.
    BecomingReady,
    /// ASC 0x28, NOT READY TO READY CHANGE, MEDIUM MAY HAVE CHANGED.
    MediumChanged,
    Other(Sense),
}

impl Sense {
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        ensure_len("REQUEST SENSE", buf, 14)?;
        Ok(Self {
            key: buf[2] & 0x0f,
            asc: buf[12],
            ascq: buf[13],
        })
    }

    pub fn medium_state(&self) -> MediumState {
        match (self.key, self.asc, self.ascq) {
            (0x00, 0x00, _) => MediumState::Ready,
            (_, 0x3a, 0x01) => MediumState::NoMedium(TrayState::Closed),
            (_, 0x3a, 0x02) => MediumState::NoMedium(TrayState::Open),
            (_, 0x3a, _) => MediumState::NoMedium(TrayState::Unknown),
            (_, 0x04, 0x01) => MediumState::BecomingReady,
            (_, 0x28, _) => MediumState::MediumChanged,
            _ => MediumState::Other(*self),
        }
    }
}

impl std::fmt::Display for Sense {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02X}/{:02X}/{:02X}", self.key, self.asc, self.ascq)
    }
}

/// Feature header of a GET CONFIGURATION response (MMC-5 table 87).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Configuration {
    pub current_profile: u16,
    /// Flags byte of the CD Read feature descriptor, when one was returned.
    pub cd_read: Option<CdReadFeature>,
}

/// CD Read feature (MMC-5 5.3.15).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CdReadFeature {
    pub current: bool,
    pub cd_text: bool,
    pub c2_flags: bool,
}

impl Configuration {
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        ensure_len("GET CONFIGURATION", buf, 8)?;
        let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize + 4;
        let end = declared.min(buf.len());
        let mut cd_read = None;
        let mut at = 8;
        while at + 4 <= end {
            let code = u16::from_be_bytes([buf[at], buf[at + 1]]);
            let additional = buf[at + 3] as usize;
            if code == FEATURE_CD_READ && at + 4 < end {
                let flags = buf[at + 4];
                cd_read = Some(CdReadFeature {
                    current: buf[at + 2] & 0x01 != 0,
                    cd_text: flags & 0x01 != 0,
                    c2_flags: flags & 0x02 != 0,
                });
            }
            at += 4 + additional;
        }
        Ok(Self {
            current_profile: u16::from_be_bytes([buf[6], buf[7]]),
            cd_read,
        })
    }

    pub fn is_cd_rom(&self) -> bool {
        self.current_profile == PROFILE_CD_ROM
    }
}

/// Standard disc information (MMC-5 table 301).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DiscInformation {
    /// 0x00 CD-DA or CD-ROM, 0x10 CD-I, 0x20 CD-ROM XA.
    pub disc_type: u8,
    pub first_track: u8,
    pub sessions: u8,
}

impl DiscInformation {
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        ensure_len("READ DISC INFORMATION", buf, 9)?;
        Ok(Self {
            first_track: buf[3],
            sessions: buf[4],
            disc_type: buf[8],
        })
    }

    /// No data-track indication: the disc is plain CD-DA.
    pub fn is_audio(&self) -> bool {
        self.disc_type == 0x00
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sense(key: u8, asc: u8, ascq: u8) -> Vec<u8> {
        let mut buf = vec![0u8; 18];
        buf[0] = 0x70;
        buf[2] = 0xf0 | key;
        buf[12] = asc;
        buf[13] = ascq;
        buf
    }

    #[test]
    fn sense_key_is_low_nibble() {
        let parsed = Sense::parse(&sense(0x02, 0x3a, 0x01)).unwrap();
        assert_eq!(parsed, Sense { key: 0x02, asc: 0x3a, ascq: 0x01 });
    }

    #[test]
    fn medium_states() {
        let state = |k, a, q| Sense::parse(&sense(k, a, q)).unwrap().medium_state();
        assert_eq!(state(0x02, 0x3a, 0x02), MediumState::NoMedium(TrayState::Open));
        assert_eq!(state(0x02, 0x3a, 0x01), MediumState::NoMedium(TrayState::Closed));
        assert_eq!(state(0x02, 0x3a, 0x00), MediumState::NoMedium(TrayState::Unknown));
        assert_eq!(state(0x02, 0x04, 0x01), MediumState::BecomingReady);
        assert_eq!(state(0x06, 0x28, 0x00), MediumState::MediumChanged);
        assert_eq!(state(0x00, 0x00, 0x00), MediumState::Ready);
        assert!(matches!(state(0x03, 0x11, 0x05), MediumState::Other(_)));
    }

    #[test]
    fn short_sense_is_rejected() {
        assert!(matches!(Sense::parse(&[0x70; 8]), Err(ParseError::TooShort { .. })));
    }

    #[test]
    fn inquiry_strings_are_trimmed() {
        let mut buf = vec![0u8; 36];
        buf[0] = 0x05;
        buf[1] = 0x80;
        buf[8..16].copy_from_slice(b"PIONEER ");
        buf[16..32].copy_from_slice(b"DVD-RW  DVR-219L");
        buf[32..36].copy_from_slice(b"1.00");
        let inquiry = Inquiry::parse(&buf).unwrap();
        assert_eq!(inquiry.vendor, "PIONEER");
        assert_eq!(inquiry.product, "DVD-RW  DVR-219L");
        assert_eq!(inquiry.revision, "1.00");
        assert!(inquiry.removable);
    }

    #[test]
    fn configuration_with_cd_read_feature() {
        let buf = [
            0x00, 0x00, 0x00, 0x0c, 0x00, 0x00, 0x00, 0x08, // header
            0x00, 0x1e, 0x0b, 0x04, 0x01, 0x00, 0x00, 0x00, // CD Read
        ];
        let config = Configuration::parse(&buf).unwrap();
        assert!(config.is_cd_rom());
        let feature = config.cd_read.unwrap();
        assert!(feature.cd_text);
        assert!(feature.current);
        assert!(!feature.c2_flags);
    }

    #[test]
    fn disc_information_type() {
        let mut buf = vec![0u8; 34];
        buf[8] = 0x20;
        assert!(!DiscInformation::parse(&buf).unwrap().is_audio());
        buf[8] = 0x00;
        assert!(DiscInformation::parse(&buf).unwrap().is_audio());
    }
}
