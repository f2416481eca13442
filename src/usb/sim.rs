//! A simulated optical drive speaking Bulk-Only Transport, for tests.
//!
//! The drive decodes CBWs submitted on the OUT pipe, executes the SCSI command
//! against an in-memory disc, and answers data and CSW requests on the IN pipe.
//! Faults (refused submissions, hung transfers, stalls, corrupt tags, read errors) are
//! injected through
//! [`SimulatedDrive`], and every backend call is recorded as a [`SimEvent`].

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use super::cbw::{CBW_SIGNATURE, CBW_SIZE, CSW_SIGNATURE, CSW_SIZE};
use super::transport::{
    BULK_ONLY_RESET, Completion, EndpointInfo, GET_MAX_LUN, Pipe, SetupPacket, SubmitError,
    TransferStatus, TransportError, USBDrive, UsbBackend,
};
use crate::scsi::SCSIDevice;
use crate::scsi::command::CD_DA_SECTOR_SIZE;

pub const SIM_MAX_PACKET: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimEvent {
    Submit { pipe: Pipe, len: usize },
    Control(SetupPacket),
    Wait(Pipe),
    Halt(Pipe),
    Flush(Pipe),
    Clear(Pipe),
}

impl SimEvent {
    pub fn pipe(&self) -> Option<Pipe> {
        match self {
            SimEvent::Submit { pipe, .. }
            | SimEvent::Wait(pipe)
            | SimEvent::Halt(pipe)
            | SimEvent::Flush(pipe)
            | SimEvent::Clear(pipe) => Some(*pipe),
            SimEvent::Control(_) => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SimDisc {
    pub toc: Vec<u8>,
    pub cd_text: Option<Vec<u8>>,
    pub disc_type: u8,
    pub profile: u16,
}

impl SimDisc {
    pub fn audio(toc: Vec<u8>) -> Self {
        Self {
            toc,
            cd_text: None,
            disc_type: 0x00,
            profile: 0x0008,
        }
    }

    pub fn with_cd_text(mut self, cd_text: Vec<u8>) -> Self {
        self.cd_text = Some(cd_text);
        self
    }
}

#[derive(Debug)]
enum Phase {
    Idle,
    DataIn { payload: Vec<u8>, tag: u32, passed: bool },
    DataOut { tag: u32, passed: bool },
    Status { tag: u32, passed: bool },
}

#[derive(Debug)]
struct SimState {
    attached: bool,
    disc: Option<SimDisc>,
    tray_open: bool,
    becoming_ready: u32,
    cd_text_supported: bool,
    failing_reads: u32,
    failing_tocs: u32,
    max_lun: u8,
    sense: (u8, u8, u8),
    phase: Phase,
    completions: Vec<(Pipe, Completion)>,
    hung: Option<(Pipe, Vec<u8>)>,
    hang_next: Option<Pipe>,
    stall_next: Option<Pipe>,
    reject_next: Option<Pipe>,
    corrupt_next_tag: bool,
    raw_in: VecDeque<Vec<u8>>,
    events: Vec<SimEvent>,
    commands: Vec<u8>,
}

/// Handle to the shared simulated drive. Clones observe and steer the same device.
#[derive(Clone, Debug)]
pub struct SimulatedDrive {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedDrive {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDrive {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                attached: true,
                disc: None,
                tray_open: false,
                becoming_ready: 0,
                cd_text_supported: true,
                failing_reads: 0,
                failing_tocs: 0,
                max_lun: 0,
                sense: (0, 0, 0),
                phase: Phase::Idle,
                completions: Vec::new(),
                hung: None,
                hang_next: None,
                stall_next: None,
                reject_next: None,
                corrupt_next_tag: false,
                raw_in: VecDeque::new(),
                events: Vec::new(),
                commands: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    pub fn with_disc(self, disc: SimDisc) -> Self {
        self.insert_disc(disc);
        self
    }

    pub fn insert_disc(&self, disc: SimDisc) {
        let mut state = self.lock();
        state.disc = Some(disc);
        state.tray_open = false;
    }

    pub fn remove_disc(&self) {
        self.lock().disc = None;
    }

    pub fn open_tray(&self) {
        let mut state = self.lock();
        state.disc = None;
        state.tray_open = true;
    }

    pub fn set_attached(&self, attached: bool) {
        self.lock().attached = attached;
    }

    pub fn becoming_ready(&self, polls: u32) {
        self.lock().becoming_ready = polls;
    }

    pub fn set_cd_text_supported(&self, supported: bool) {
        self.lock().cd_text_supported = supported;
    }

    pub fn fail_reads(&self, count: u32) {
        self.lock().failing_reads = count;
    }

    /// READ TOC (formatted TOC) fails with a MEDIUM ERROR this many times.
    pub fn fail_tocs(&self, count: u32) {
        self.lock().failing_tocs = count;
    }

    /// Highest LUN reported by GET MAX LUN.
    pub fn set_max_lun(&self, lun: u8) {
        self.lock().max_lun = lun;
    }

    /// The next submission on `pipe` is refused by the backend.
    pub fn reject_next(&self, pipe: Pipe) {
        self.lock().reject_next = Some(pipe);
    }

    pub fn hang_next(&self, pipe: Pipe) {
        self.lock().hang_next = Some(pipe);
    }

    pub fn stall_next(&self, pipe: Pipe) {
        self.lock().stall_next = Some(pipe);
    }

    pub fn corrupt_next_tag(&self) {
        self.lock().corrupt_next_tag = true;
    }

    /// Data handed out on the next IN submissions, ahead of the BOT state machine.
    pub fn queue_raw_in(&self, data: Vec<u8>) {
        self.lock().raw_in.push_back(data);
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.lock().events.clone()
    }

    /// Operation codes of every CBW received, in order.
    pub fn commands(&self) -> Vec<u8> {
        self.lock().commands.clone()
    }

    pub fn tray_open(&self) -> bool {
        self.lock().tray_open
    }

    pub fn backend(&self) -> SimBackend {
        SimBackend {
            state: self.state.clone(),
        }
    }

    pub fn usb_drive(&self) -> USBDrive<SimBackend> {
        let endpoint = |address| EndpointInfo {
            address,
            max_packet_size: SIM_MAX_PACKET,
        };
        USBDrive::new(self.backend(), 0, endpoint(0x81), endpoint(0x02))
    }

    pub fn scsi_device(&self) -> SCSIDevice<SimBackend> {
        SCSIDevice::new(self.usb_drive())
    }
}

pub struct SimBackend {
    state: Arc<Mutex<SimState>>,
}

impl SimBackend {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }
}

impl UsbBackend for SimBackend {
    fn max_packet_size(&self, _pipe: Pipe) -> usize {
        SIM_MAX_PACKET
    }

    fn submit_control(&mut self, setup: SetupPacket, mut buffer: Vec<u8>) -> Result<(), SubmitError> {
        let mut state = self.lock();
        state.events.push(SimEvent::Control(setup));
        if state.reject_next.take_if(|p| *p == Pipe::Control).is_some() {
            return Err(SubmitError::new(buffer, "control submission refused"));
        }
        if state.attached && state.hang_next.take_if(|p| *p == Pipe::Control).is_some() {
            state.hung = Some((Pipe::Control, buffer));
            return Ok(());
        }
        let completion = if !state.attached {
            Completion::new(buffer, 0, TransferStatus::Disconnected)
        } else if state.stall_next.take_if(|p| *p == Pipe::Control).is_some() {
            Completion::new(buffer, 0, TransferStatus::Stall)
        } else if setup.request == GET_MAX_LUN {
            if buffer.is_empty() {
                buffer.push(0);
            }
            buffer[0] = state.max_lun;
            Completion::new(buffer, 1, TransferStatus::Completed)
        } else if setup.request == BULK_ONLY_RESET {
            state.phase = Phase::Idle;
            Completion::new(buffer, 0, TransferStatus::Completed)
        } else {
            Completion::new(buffer, 0, TransferStatus::Stall)
        };
        state.completions.push((Pipe::Control, completion));
        Ok(())
    }

    fn submit_bulk(&mut self, pipe: Pipe, mut buffer: Vec<u8>, len: usize) -> Result<(), SubmitError> {
        let mut state = self.lock();
        state.events.push(SimEvent::Submit { pipe, len });
        if state.reject_next.take_if(|p| *p == pipe).is_some() {
            return Err(SubmitError::new(buffer, "bulk submission refused"));
        }
        if !state.attached {
            state
                .completions
                .push((pipe, Completion::new(buffer, 0, TransferStatus::Disconnected)));
            return Ok(());
        }
        if state.hang_next == Some(pipe) {
            state.hang_next = None;
            state.hung = Some((pipe, buffer));
            return Ok(());
        }
        if state.stall_next == Some(pipe) {
            state.stall_next = None;
            state
                .completions
                .push((pipe, Completion::new(buffer, 0, TransferStatus::Stall)));
            return Ok(());
        }

        let completion = match pipe {
            Pipe::BulkOut => {
                let data = buffer[..len].to_vec();
                state.receive(&data);
                Completion::new(buffer, len, TransferStatus::Completed)
            }
            Pipe::BulkIn => match state.send() {
                Some(payload) => {
                    let n = payload.len().min(len);
                    buffer[..n].copy_from_slice(&payload[..n]);
                    Completion::new(buffer, n, TransferStatus::Completed)
                }
                None => Completion::new(buffer, 0, TransferStatus::Failed("nothing to send".into())),
            },
            Pipe::Control => Completion::new(buffer, 0, TransferStatus::Failed("not a bulk pipe".into())),
        };
        state.completions.push((pipe, completion));
        Ok(())
    }

    fn next_complete(&mut self, pipe: Pipe) -> impl Future<Output = Completion> + Send + '_ {
        let ready = {
            let mut state = self.lock();
            state.events.push(SimEvent::Wait(pipe));
            state
                .completions
                .iter()
                .position(|(p, _)| *p == pipe)
                .map(|at| state.completions.remove(at).1)
        };
        async move {
            match ready {
                Some(completion) => completion,
                None => std::future::pending().await,
            }
        }
    }

    fn halt(&mut self, pipe: Pipe) {
        self.lock().events.push(SimEvent::Halt(pipe));
    }

    fn flush(&mut self, pipe: Pipe) {
        let mut state = self.lock();
        state.events.push(SimEvent::Flush(pipe));
        if state.hung.as_ref().is_some_and(|(p, _)| *p == pipe) {
            if let Some((_, buffer)) = state.hung.take() {
                state
                    .completions
                    .push((pipe, Completion::new(buffer, 0, TransferStatus::Cancelled)));
            }
        }
    }

    fn clear(&mut self, pipe: Pipe) -> impl Future<Output = Result<(), TransportError>> + Send + '_ {
        self.lock().events.push(SimEvent::Clear(pipe));
        async { Ok(()) }
    }
}

impl SimState {
    fn receive(&mut self, data: &[u8]) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::DataOut { tag, passed } => {
                self.phase = Phase::Status { tag, passed };
            }
            Phase::Idle if data.len() == CBW_SIZE => {
                let word = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
                if word(0) != CBW_SIGNATURE {
                    return;
                }
                let tag = word(4);
                let transfer_len = word(8) as usize;
                let data_in = data[12] & 0x80 != 0;
                let cdb_len = data[14] as usize;
                let cdb = data[15..15 + cdb_len.min(16)].to_vec();
                let (payload, passed) = self.execute(&cdb);
                self.phase = if transfer_len == 0 {
                    Phase::Status { tag, passed }
                } else if data_in {
                    let mut payload = payload.unwrap_or_default();
                    payload.truncate(transfer_len);
                    Phase::DataIn { payload, tag, passed }
                } else {
                    Phase::DataOut { tag, passed }
                };
            }
            other => self.phase = other,
        }
    }

    fn send(&mut self) -> Option<Vec<u8>> {
        if let Some(raw) = self.raw_in.pop_front() {
            return Some(raw);
        }
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::DataIn { payload, tag, passed } => {
                self.phase = Phase::Status { tag, passed };
                Some(payload)
            }
            Phase::Status { tag, passed } => {
                let tag = if std::mem::take(&mut self.corrupt_next_tag) {
                    tag.wrapping_add(1)
                } else {
                    tag
                };
                let mut csw = vec![0u8; CSW_SIZE];
                csw[..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
                csw[4..8].copy_from_slice(&tag.to_le_bytes());
                csw[12] = if passed { 0 } else { 1 };
                Some(csw)
            }
            other => {
                self.phase = other;
                None
            }
        }
    }

    fn fail(&mut self, key: u8, asc: u8, ascq: u8) -> (Option<Vec<u8>>, bool) {
        self.sense = (key, asc, ascq);
        (None, false)
    }

    fn not_present(&mut self) -> (Option<Vec<u8>>, bool) {
        let ascq = if self.tray_open { 0x02 } else { 0x01 };
        self.fail(0x02, 0x3a, ascq)
    }

    fn execute(&mut self, cdb: &[u8]) -> (Option<Vec<u8>>, bool) {
        let Some(&opcode) = cdb.first() else {
            return self.fail(0x05, 0x20, 0x00);
        };
        self.commands.push(opcode);
        let be16 = |at: usize| u16::from_be_bytes([cdb[at], cdb[at + 1]]) as usize;
        match opcode {
            // TEST UNIT READY
            0x00 => {
                if self.becoming_ready > 0 {
                    self.becoming_ready -= 1;
                    self.fail(0x02, 0x04, 0x01)
                } else if self.disc.is_none() {
                    self.not_present()
                } else {
                    (None, true)
                }
            }
            // REQUEST SENSE
            0x03 => {
                let (key, asc, ascq) = std::mem::take(&mut self.sense);
                let mut sense = vec![0u8; 18];
                sense[0] = 0x70;
                sense[2] = key;
                sense[7] = 10;
                sense[12] = asc;
                sense[13] = ascq;
                (Some(sense), true)
            }
            // INQUIRY
            0x12 => {
                let mut inquiry = vec![0u8; 36];
                inquiry[0] = 0x05;
                inquiry[1] = 0x80;
                inquiry[8..16].copy_from_slice(b"SIMDRIVE");
                inquiry[16..32].copy_from_slice(b"VIRTUAL CD-ROM  ");
                inquiry[32..36].copy_from_slice(b"1.00");
                (Some(inquiry), true)
            }
            // START STOP UNIT
            0x1b => {
                let start = cdb[4] & 0x01 != 0;
                let load_eject = cdb[4] & 0x02 != 0;
                if load_eject && !start {
                    self.disc = None;
                    self.tray_open = true;
                } else if load_eject {
                    self.tray_open = false;
                }
                (None, true)
            }
            // PREVENT ALLOW MEDIUM REMOVAL, SET CD SPEED
            0x1e | 0xbb => (None, true),
            // GET CONFIGURATION
            0x46 => {
                let profile = self.disc.as_ref().map(|d| d.profile).unwrap_or(0);
                let mut out = vec![0u8; 8];
                out[6..8].copy_from_slice(&profile.to_be_bytes());
                if be16(2) == 0x001e {
                    let flags = if self.cd_text_supported { 0x01 } else { 0x00 };
                    out.extend_from_slice(&[0x00, 0x1e, 0x0b, 0x04, flags, 0, 0, 0]);
                }
                let len = (out.len() - 4) as u32;
                out[..4].copy_from_slice(&len.to_be_bytes());
                (Some(out), true)
            }
            // READ DISC INFORMATION
            0x51 => {
                let Some(disc_type) = self.disc.as_ref().map(|d| d.disc_type) else {
                    return self.not_present();
                };
                let mut info = vec![0u8; 34];
                info[1] = 32;
                info[2] = 0x0e;
                info[8] = disc_type;
                (Some(info), true)
            }
            // READ TOC/PMA/ATIP
            0x43 => {
                let format = cdb[2] & 0x0f;
                let alloc = be16(7);
                if self.disc.is_none() {
                    return self.not_present();
                }
                if format == 0 && self.failing_tocs > 0 {
                    self.failing_tocs -= 1;
                    return self.fail(0x03, 0x11, 0x05);
                }
                let payload = match format {
                    0 => self.disc.as_ref().map(|d| d.toc.clone()),
                    5 => self.disc.as_ref().and_then(|d| d.cd_text.clone()),
                    _ => None,
                };
                match payload {
                    Some(mut payload) => {
                        payload.truncate(alloc);
                        (Some(payload), true)
                    }
                    None => self.fail(0x05, 0x24, 0x00),
                }
            }
            // READ CD
            0xbe => {
                if self.disc.is_none() {
                    return self.not_present();
                }
                if self.failing_reads > 0 {
                    self.failing_reads -= 1;
                    return self.fail(0x03, 0x11, 0x05);
                }
                let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]);
                let frames = u32::from_be_bytes([0, cdb[6], cdb[7], cdb[8]]) as usize;
                let fill = (lba & 0xff) as u8;
                (Some(vec![fill; frames * CD_DA_SECTOR_SIZE]), true)
            }
            _ => self.fail(0x05, 0x20, 0x00),
        }
    }
}

/// Builds a READ TOC format 0 response. `tracks` holds `(number, control, start_lba)`.
pub fn toc_bytes(tracks: &[(u8, u8, u32)], lead_out: u32) -> Vec<u8> {
    let mut out = vec![0u8; 4];
    out[2] = tracks.first().map(|t| t.0).unwrap_or(1);
    out[3] = tracks.last().map(|t| t.0).unwrap_or(1);
    let descriptors = tracks
        .iter()
        .copied()
        .chain(std::iter::once((0xaa, 0x00, lead_out)));
    for (number, control, lba) in descriptors {
        out.extend_from_slice(&[0x00, 0x10 | (control & 0x0f), number, 0x00]);
        out.extend_from_slice(&lba.to_be_bytes());
    }
    let len = (out.len() - 2) as u16;
    out[..2].copy_from_slice(&len.to_be_bytes());
    out
}

/// Encodes `strings` (index 0 = album, then one per track) as CD-Text packs of `kind`.
pub fn text_packs(kind: u8, strings: &[&str]) -> Vec<[u8; 18]> {
    let mut chars: Vec<(u8, u8)> = Vec::new();
    for (track, text) in strings.iter().enumerate() {
        for byte in text.bytes().chain(std::iter::once(0)) {
            chars.push((track as u8, byte));
        }
    }
    chars
        .chunks(12)
        .enumerate()
        .map(|(seq, chunk)| {
            let mut pack = [0u8; 18];
            pack[0] = kind;
            pack[1] = chunk[0].0;
            pack[2] = seq as u8;
            for (at, (_, byte)) in chunk.iter().enumerate() {
                pack[4 + at] = *byte;
            }
            pack
        })
        .collect()
}

/// Builds a READ TOC format 5 response out of raw packs.
pub fn cd_text_bytes(packs: &[[u8; 18]]) -> Vec<u8> {
    let mut out = vec![0u8; 4];
    for pack in packs {
        out.extend_from_slice(pack);
    }
    let len = (out.len() - 2) as u16;
    out[..2].copy_from_slice(&len.to_be_bytes());
    out
}
