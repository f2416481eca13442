//! Decoding of READ TOC/PMA/ATIP format 0 (formatted TOC) responses.

use super::response::ParseError;

/// Track number of the lead-out descriptor, which closes the list.
pub const LEAD_OUT: u8 = 0xaa;
/// Red-Book discs carry at most 99 tracks.
pub const MAX_TRACKS: usize = 99;

const HEADER_LEN: usize = 4;
const DESCRIPTOR_LEN: usize = 8;

/// Q sub-channel CONTROL bits (MMC-5 table 480).
const CONTROL_DATA: u8 = 0x04;
const CONTROL_PRE_EMPHASIS: u8 = 0x01;

/// One audio track as listed in the TOC.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TocTrack {
    pub number: u8,
    pub pre_emphasis: bool,
    pub start_lba: u32,
    /// Length in frames, up to the start of whatever follows on the disc.
    pub duration: u32,
}

/// Parses a formatted TOC into its audio tracks.
///
/// Data tracks are skipped, but their start address still ends the audio track
/// before them. The lead-out descriptor terminates the list.
pub fn parse_toc(buf: &[u8]) -> Result<Vec<TocTrack>, ParseError> {
    if buf.len() < HEADER_LEN {
        return Err(ParseError::TooShort {
            what: "READ TOC",
            len: buf.len(),
        });
    }
    let declared = u16::from_be_bytes([buf[0], buf[1]]) as usize + 2;
    if declared < HEADER_LEN {
        return Err(ParseError::TooShort {
            what: "READ TOC header",
            len: declared,
        });
    }
    let body = &buf[HEADER_LEN..declared.min(buf.len())];

    let mut tracks: Vec<TocTrack> = Vec::new();
    let mut open: Option<usize> = None;
    for descriptor in body.chunks_exact(DESCRIPTOR_LEN) {
        let control = descriptor[1] & 0x0f;
        let number = descriptor[2];
        let lba = u32::from_be_bytes([descriptor[4], descriptor[5], descriptor[6], descriptor[7]]);

        if let Some(at) = open.take() {
            let track = &mut tracks[at];
            track.duration = lba.checked_sub(track.start_lba).ok_or_else(|| {
                ParseError::Invalid(format!(
                    "track {} starts at {} but the next entry starts at {lba}",
                    track.number, track.start_lba
                ))
            })?;
        }
        if number == LEAD_OUT {
            break;
        }
        if control & CONTROL_DATA != 0 {
            continue;
        }
        if tracks.len() == MAX_TRACKS {
            return Err(ParseError::Invalid("more than 99 tracks".into()));
        }
        open = Some(tracks.len());
        tracks.push(TocTrack {
            number,
            pre_emphasis: control & CONTROL_PRE_EMPHASIS != 0,
            start_lba: lba,
            duration: 0,
        });
    }

    if let Some(at) = open {
        return Err(ParseError::Invalid(format!(
            "no lead-out after track {}",
            tracks[at].number
        )));
    }
    Ok(tracks)
}
