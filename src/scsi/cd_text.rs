//! Decoding of READ TOC/PMA/ATIP format 5 (CD-Text) responses.
//!
//! CD-Text is a sequence of 18-byte packs read from the lead-in. Each pack carries
//! 12 characters of a run of NUL-terminated strings, one string per track, with
//! index 0 belonging to the album. Only block 0 (the first language) is decoded,
//! and only the title and performer pack types.

use super::response::ParseError;

pub const PACK_LEN: usize = 18;
const TEXT_LEN: usize = 12;

pub const PACK_TITLE: u8 = 0x80;
pub const PACK_PERFORMER: u8 = 0x81;

/// Owned title/performer strings of one disc, indexed by track number.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CdText {
    titles: Vec<String>,
    performers: Vec<String>,
}

impl CdText {
    pub fn album_title(&self) -> Option<&str> {
        self.title(0)
    }

    pub fn album_performer(&self) -> Option<&str> {
        self.performer(0)
    }

    pub fn title(&self, track: u8) -> Option<&str> {
        non_empty(&self.titles, track)
    }

    pub fn performer(&self, track: u8) -> Option<&str> {
        non_empty(&self.performers, track)
    }
}

fn non_empty(strings: &[String], track: u8) -> Option<&str> {
    strings
        .get(track as usize)
        .map(String::as_str)
        .filter(|s| !s.is_empty())
}

/// Accumulates the string run of one pack type.
#[derive(Default)]
struct Field {
    strings: Vec<String>,
    current: Vec<u8>,
}

impl Field {
    fn expected(&self) -> u8 {
        self.strings.len() as u8
    }

    fn push(&mut self, kind: u8, track: u8, text: &[u8]) -> Result<(), ParseError> {
        let expected = self.expected();
        if track != expected {
            return Err(ParseError::OutOfOrder {
                kind,
                expected,
                got: track,
            });
        }
        for &byte in text {
            if byte == 0 {
                let bytes = std::mem::take(&mut self.current);
                // a lone TAB repeats the previous string
                let string = if bytes == [b'\t'] {
                    self.strings.last().cloned().unwrap_or_default()
                } else {
                    latin1(&bytes)
                };
                self.strings.push(string);
            } else {
                self.current.push(byte);
            }
        }
        Ok(())
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect::<String>().trim().to_string()
}

/// Parses a CD-Text response. Any inconsistency fails the whole block, no partial
/// result is ever returned.
pub fn parse_cd_text(buf: &[u8]) -> Result<CdText, ParseError> {
    if buf.len() < 4 {
        return Err(ParseError::TooShort {
            what: "CD-Text",
            len: buf.len(),
        });
    }
    let declared = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let packs_len = declared.saturating_sub(2);
    if packs_len % PACK_LEN != 0 {
        return Err(ParseError::PackAlignment(packs_len));
    }
    if buf.len() < 4 + packs_len {
        return Err(ParseError::TooShort {
            what: "CD-Text",
            len: buf.len(),
        });
    }

    let mut titles = Field::default();
    let mut performers = Field::default();
    for pack in buf[4..4 + packs_len].chunks_exact(PACK_LEN) {
        let kind = pack[0];
        let track = pack[1] & 0x7f;
        let block = (pack[3] >> 4) & 0x07;
        if block != 0 {
            continue;
        }
        let text = &pack[4..4 + TEXT_LEN];
        match kind {
            PACK_TITLE => titles.push(kind, track, text)?,
            PACK_PERFORMER => performers.push(kind, track, text)?,
            _ => {}
        }
    }

    Ok(CdText {
        titles: titles.strings,
        performers: performers.strings,
    })
}
