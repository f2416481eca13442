//! Blocking control and bulk transfer primitives on top of a [`UsbBackend`].
//!
//! Every transfer is submitted to the backend and then awaited with a deadline.
//! When the deadline expires the pipe is halted, flushed and cleared, after which
//! the completion is awaited a second time: flushing guarantees a terminal
//! completion, so the second wait is unbounded. A transfer that ends in a timeout
//! or a STALL additionally triggers the Bulk-Only Mass Storage Reset Recovery
//! sequence (BOT section 5.3.4).

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace, warn};

/// Timeout applied to control transfers.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout applied to bulk transfers when the caller passes [`Duration::ZERO`].
pub const DEFAULT_BULK_TIMEOUT: Duration = Duration::from_secs(8);

/// `bRequest` of the class-specific Bulk-Only Mass Storage Reset.
pub const BULK_ONLY_RESET: u8 = 0xff;
/// `bRequest` of the class-specific Get Max LUN request.
pub const GET_MAX_LUN: u8 = 0xfe;

/// The three pipes a Bulk-Only device is driven through.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Pipe {
    Control,
    BulkIn,
    BulkOut,
}

/// The 8-byte setup stage of a control transfer (USB 2.0, section 9.3).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// Class request, interface recipient, host to device.
    pub const CLASS_INTERFACE_OUT: u8 = 0x21;
    /// Class request, interface recipient, device to host.
    pub const CLASS_INTERFACE_IN: u8 = 0xa1;

    /// Bulk-Only Mass Storage Reset addressed to `interface`.
    pub fn bulk_only_reset(interface: u8) -> Self {
        Self {
            request_type: Self::CLASS_INTERFACE_OUT,
            request: BULK_ONLY_RESET,
            value: 0,
            index: interface as u16,
            length: 0,
        }
    }

    /// Get Max LUN addressed to `interface`, answered with a single byte.
    pub fn get_max_lun(interface: u8) -> Self {
        Self {
            request_type: Self::CLASS_INTERFACE_IN,
            request: GET_MAX_LUN,
            value: 0,
            index: interface as u16,
            length: 1,
        }
    }

    /// True when the data stage flows from the device to the host.
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }
}

/// Terminal state of a submitted transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Stall,
    Cancelled,
    Disconnected,
    Failed(String),
}

/// A finished transfer handed back by the backend, together with the buffer it was
/// submitted with.
#[derive(Debug)]
pub struct Completion {
    pub buffer: Vec<u8>,
    pub actual_len: usize,
    pub status: TransferStatus,
}

impl Completion {
    pub fn new(buffer: Vec<u8>, actual_len: usize, status: TransferStatus) -> Self {
        Self {
            buffer,
            actual_len,
            status,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transfer timed out")]
    Timeout,
    #[error("endpoint stalled")]
    Stall,
    #[error("device disconnected")]
    Disconnected,
    #[error("short control transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },
    #[error("transfer submission failed: {0}")]
    Submit(String),
    #[error("transfer failed: {0}")]
    Failed(String),
}

/// A transfer the backend refused to queue, handing the caller's buffer back.
#[derive(Debug)]
pub struct SubmitError {
    pub buffer: Vec<u8>,
    pub error: TransportError,
}

impl SubmitError {
    pub fn new(buffer: Vec<u8>, reason: impl Into<String>) -> Self {
        Self {
            buffer,
            error: TransportError::Submit(reason.into()),
        }
    }
}

impl TransportError {
    /// Timeouts and stalls are the only outcomes that trigger automatic recovery.
    pub fn needs_recovery(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::Stall)
    }

    fn from_status(status: TransferStatus) -> Result<(), TransportError> {
        match status {
            TransferStatus::Completed => Ok(()),
            TransferStatus::Stall => Err(TransportError::Stall),
            TransferStatus::Disconnected => Err(TransportError::Disconnected),
            TransferStatus::Cancelled => Err(TransportError::Failed("transfer cancelled".into())),
            TransferStatus::Failed(reason) => Err(TransportError::Failed(reason)),
        }
    }
}

/// Host controller access for a single claimed mass storage interface.
///
/// Submission returns immediately; the completion is awaited separately through
/// [`UsbBackend::next_complete`], and only by the caller that submitted it.
pub trait UsbBackend: Send + 'static {
    /// `wMaxPacketSize` of the given pipe.
    fn max_packet_size(&self, pipe: Pipe) -> usize;

    /// Queue a control transfer. For host-to-device requests `buffer[..setup.length]`
    /// is the data stage.
    fn submit_control(&mut self, setup: SetupPacket, buffer: Vec<u8>) -> Result<(), SubmitError>;

    /// Queue a bulk transfer of `len` bytes. For [`Pipe::BulkOut`] `buffer[..len]` is
    /// the payload.
    fn submit_bulk(&mut self, pipe: Pipe, buffer: Vec<u8>, len: usize) -> Result<(), SubmitError>;

    /// Resolves when the oldest transfer submitted on `pipe` reaches a terminal state.
    fn next_complete(&mut self, pipe: Pipe) -> impl Future<Output = Completion> + Send + '_;

    /// Stop the pipe from starting further transfers.
    fn halt(&mut self, pipe: Pipe);

    /// Terminate every transfer pending on the pipe, each completes as cancelled.
    fn flush(&mut self, pipe: Pipe);

    /// Clear the halt condition on the pipe (CLEAR_FEATURE(ENDPOINT_HALT) for bulk pipes).
    fn clear(&mut self, pipe: Pipe) -> impl Future<Output = Result<(), TransportError>> + Send + '_;
}

/// Address and packet size of a bulk endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub max_packet_size: usize,
}

/// The open mass storage device: backend, claimed interface, bulk endpoints and the
/// single reusable transfer buffer.
///
/// The buffer grows on demand and never shrinks for the lifetime of the device.
pub struct USBDrive<B> {
    backend: B,
    interface: u8,
    bulk_in: EndpointInfo,
    bulk_out: EndpointInfo,
    buffer: Vec<u8>,
}

impl<B: UsbBackend> USBDrive<B> {
    pub fn new(backend: B, interface: u8, bulk_in: EndpointInfo, bulk_out: EndpointInfo) -> Self {
        let initial = bulk_in.max_packet_size.max(bulk_out.max_packet_size).max(64);
        Self {
            backend,
            interface,
            bulk_in,
            bulk_out,
            buffer: vec![0; initial],
        }
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }

    /// Current size of the transfer buffer.
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn ensure_buffer(&mut self, len: usize) {
        if self.buffer.len() < len {
            trace!(from = self.buffer.len(), to = len, "growing transfer buffer");
            self.buffer.resize(len, 0);
        }
    }

    /// Takes the transfer buffer back from a refused submission.
    fn reclaim(&mut self, submitted: Result<(), SubmitError>) -> Result<(), TransportError> {
        submitted.map_err(|SubmitError { buffer, error }| {
            self.buffer = buffer;
            error
        })
    }

    /// Issue a control transfer on the default pipe.
    ///
    /// `data` is the data stage: sent for host-to-device requests, filled for
    /// device-to-host ones. Returns the number of bytes moved in the data stage.
    #[tracing::instrument(level = "debug", skip(self, data), fields(request = setup.request))]
    pub async fn control_transfer(
        &mut self,
        setup: SetupPacket,
        data: &mut [u8],
    ) -> Result<usize, TransportError> {
        let result = self.control_inner(setup, data).await;
        if let Err(TransportError::Timeout) = result {
            self.reset_recovery().await;
        }
        result
    }

    async fn control_inner(
        &mut self,
        setup: SetupPacket,
        data: &mut [u8],
    ) -> Result<usize, TransportError> {
        let len = setup.length as usize;
        self.ensure_buffer(len);
        if !setup.is_in() {
            let n = len.min(data.len());
            self.buffer[..n].copy_from_slice(&data[..n]);
        }
        let buffer = std::mem::take(&mut self.buffer);
        let submitted = self.backend.submit_control(setup, buffer);
        self.reclaim(submitted)?;

        let completion = self.wait_for_completion(Pipe::Control, CONTROL_TIMEOUT).await?;
        TransportError::from_status(completion.status)?;
        if completion.actual_len < len {
            return Err(TransportError::ShortTransfer {
                expected: len,
                actual: completion.actual_len,
            });
        }
        if setup.is_in() {
            let n = completion.actual_len.min(data.len());
            data[..n].copy_from_slice(&self.buffer[..n]);
        }
        Ok(completion.actual_len)
    }

    /// Send `data` on the bulk OUT endpoint. Returns the number of bytes the device accepted.
    pub async fn bulk_out(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        self.ensure_buffer(data.len());
        self.buffer[..data.len()].copy_from_slice(data);
        self.bulk_transfer(Pipe::BulkOut, data.len(), timeout).await
    }

    /// Receive up to `data.len()` bytes from the bulk IN endpoint.
    ///
    /// The request is rounded up to a whole number of max-packet-size packets, since
    /// asking for less than a full packet is a protocol violation for bulk transfers.
    /// Returns the number of bytes the device actually sent, clamped to `data.len()`.
    pub async fn bulk_in(&mut self, data: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let packet = self.bulk_in.max_packet_size.max(1);
        let request = data.len().div_ceil(packet).max(1) * packet;
        self.ensure_buffer(request);
        let actual = self.bulk_transfer(Pipe::BulkIn, request, timeout).await?;
        let n = actual.min(data.len());
        data[..n].copy_from_slice(&self.buffer[..n]);
        Ok(n)
    }

    async fn bulk_transfer(
        &mut self,
        pipe: Pipe,
        len: usize,
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let timeout = if timeout.is_zero() {
            DEFAULT_BULK_TIMEOUT
        } else {
            timeout
        };
        let buffer = std::mem::take(&mut self.buffer);
        let submitted = self.backend.submit_bulk(pipe, buffer, len);
        self.reclaim(submitted)?;

        let result = match self.wait_for_completion(pipe, timeout).await {
            Ok(completion) => match completion.status {
                TransferStatus::Stall => {
                    warn!(?pipe, "bulk endpoint stalled");
                    self.halt_flush_clear(pipe).await;
                    Err(TransportError::Stall)
                }
                status => TransportError::from_status(status).map(|()| completion.actual_len),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            if e.needs_recovery() {
                self.reset_recovery().await;
            }
        }
        result
    }

    /// Awaits the completion of the transfer last submitted on `pipe`.
    ///
    /// On deadline expiry the pipe is halted, flushed and cleared and the completion is
    /// awaited once more, without a deadline, before [`TransportError::Timeout`] is
    /// returned. The buffer carried by the completion is always taken back.
    async fn wait_for_completion(
        &mut self,
        pipe: Pipe,
        timeout: Duration,
    ) -> Result<Completion, TransportError> {
        let waited = tokio::time::timeout(timeout, self.backend.next_complete(pipe)).await;
        match waited {
            Ok(mut completion) => {
                self.buffer = std::mem::take(&mut completion.buffer);
                Ok(completion)
            }
            Err(_) => {
                warn!(?pipe, ?timeout, "transfer timed out, flushing endpoint");
                self.halt_flush_clear(pipe).await;
                let mut completion = self.backend.next_complete(pipe).await;
                debug!(?pipe, status = ?completion.status, "flushed transfer returned");
                self.buffer = std::mem::take(&mut completion.buffer);
                Err(TransportError::Timeout)
            }
        }
    }

    async fn halt_flush_clear(&mut self, pipe: Pipe) {
        self.backend.halt(pipe);
        self.backend.flush(pipe);
        if let Err(e) = self.backend.clear(pipe).await {
            warn!(?pipe, error = %e, "failed to clear endpoint");
        }
    }

    /// Bulk-Only Mass Storage Reset followed by clearing HALT on both bulk endpoints.
    ///
    /// Best effort: failures are logged and swallowed, the transfer that triggered the
    /// recovery has already failed.
    pub async fn reset_recovery(&mut self) {
        debug!(interface = self.interface, "performing reset recovery");
        // Many devices have no data or status stage for this request, the result is ignored.
        if let Err(e) = self
            .control_inner(SetupPacket::bulk_only_reset(self.interface), &mut [])
            .await
        {
            debug!(error = %e, "bulk-only reset returned an error, ignoring");
        }
        for pipe in [Pipe::BulkIn, Pipe::BulkOut] {
            if let Err(e) = self.backend.clear(pipe).await {
                warn!(?pipe, error = %e, "failed to clear HALT during reset recovery");
            }
        }
    }
}
