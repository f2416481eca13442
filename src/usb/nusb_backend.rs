//! [`UsbBackend`] on top of a claimed `nusb` interface.

use std::future::Future;

use nusb::{Endpoint, Interface};
use nusb::transfer::{
    Buffer, Bulk, ControlIn, ControlOut, ControlType, In, Out, Recipient, TransferError,
};
use tokio::task::JoinHandle;
use tracing::trace;

use super::transport::{
    CONTROL_TIMEOUT, Completion, EndpointInfo, Pipe, SetupPacket, SubmitError, TransferStatus,
    TransportError, UsbBackend,
};

type ControlResult = Result<Vec<u8>, TransferError>;

/// A control transfer in flight. nusb runs control transfers as futures rather than
/// submit/complete pairs, so the transfer runs on its own task and is reaped here.
struct PendingControl {
    setup: SetupPacket,
    buffer: Vec<u8>,
    task: JoinHandle<ControlResult>,
}

pub struct NusbBackend {
    interface: Interface,
    bulk_in: Endpoint<Bulk, In>,
    bulk_out: Endpoint<Bulk, Out>,
    /// Caller buffers of in-flight bulk transfers, handed back on completion.
    parked_in: Option<Vec<u8>>,
    parked_out: Option<Vec<u8>>,
    control: Option<PendingControl>,
}

impl NusbBackend {
    pub fn new(
        interface: Interface,
        bulk_in: EndpointInfo,
        bulk_out: EndpointInfo,
    ) -> Result<Self, nusb::Error> {
        Ok(Self {
            bulk_in: interface.endpoint::<Bulk, In>(bulk_in.address)?,
            bulk_out: interface.endpoint::<Bulk, Out>(bulk_out.address)?,
            interface,
            parked_in: None,
            parked_out: None,
            control: None,
        })
    }
}

fn status_of(result: Result<(), TransferError>) -> TransferStatus {
    match result {
        Ok(()) => TransferStatus::Completed,
        Err(TransferError::Stall) => TransferStatus::Stall,
        Err(TransferError::Cancelled) => TransferStatus::Cancelled,
        Err(TransferError::Disconnected) => TransferStatus::Disconnected,
        Err(e) => TransferStatus::Failed(e.to_string()),
    }
}

fn control_type(request_type: u8) -> ControlType {
    match (request_type >> 5) & 0x03 {
        0 => ControlType::Standard,
        1 => ControlType::Class,
        _ => ControlType::Vendor,
    }
}

fn recipient(request_type: u8) -> Recipient {
    match request_type & 0x1f {
        0 => Recipient::Device,
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        _ => Recipient::Other,
    }
}

impl UsbBackend for NusbBackend {
    fn max_packet_size(&self, pipe: Pipe) -> usize {
        match pipe {
            Pipe::BulkIn => self.bulk_in.max_packet_size(),
            Pipe::BulkOut => self.bulk_out.max_packet_size(),
            Pipe::Control => 64,
        }
    }

    fn submit_control(&mut self, setup: SetupPacket, buffer: Vec<u8>) -> Result<(), SubmitError> {
        if self.control.is_some() {
            return Err(SubmitError::new(buffer, "a control transfer is already pending"));
        }
        let interface = self.interface.clone();
        let control_type = control_type(setup.request_type);
        let recipient = recipient(setup.request_type);
        let task = if setup.is_in() {
            tokio::spawn(async move {
                interface
                    .control_in(
                        ControlIn {
                            control_type,
                            recipient,
                            request: setup.request,
                            value: setup.value,
                            index: setup.index,
                            length: setup.length,
                        },
                        CONTROL_TIMEOUT,
                    )
                    .await
            })
        } else {
            let data = buffer[..(setup.length as usize).min(buffer.len())].to_vec();
            tokio::spawn(async move {
                let sent = interface
                    .control_out(
                        ControlOut {
                            control_type,
                            recipient,
                            request: setup.request,
                            value: setup.value,
                            index: setup.index,
                            data: &data,
                        },
                        CONTROL_TIMEOUT,
                    )
                    .await;
                sent.map(|()| data)
            })
        };
        self.control = Some(PendingControl { setup, buffer, task });
        Ok(())
    }

    fn submit_bulk(&mut self, pipe: Pipe, buffer: Vec<u8>, len: usize) -> Result<(), SubmitError> {
        match pipe {
            Pipe::BulkIn => {
                let transfer = self.bulk_in.allocate(len);
                self.bulk_in.submit(transfer);
                self.parked_in = Some(buffer);
            }
            Pipe::BulkOut => {
                let mut transfer: Buffer = self.bulk_out.allocate(len);
                transfer.extend_from_slice(&buffer[..len]);
                self.bulk_out.submit(transfer);
                self.parked_out = Some(buffer);
            }
            Pipe::Control => {
                return Err(SubmitError::new(buffer, "control pipe is not a bulk pipe"));
            }
        }
        Ok(())
    }

    fn next_complete(&mut self, pipe: Pipe) -> impl Future<Output = Completion> + Send + '_ {
        async move {
            match pipe {
                Pipe::BulkIn => {
                    let done = self.bulk_in.next_complete().await;
                    let mut buffer = self.parked_in.take().unwrap_or_default();
                    let n = done.actual_len.min(done.buffer.len());
                    if buffer.len() < n {
                        buffer.resize(n, 0);
                    }
                    buffer[..n].copy_from_slice(&done.buffer[..n]);
                    Completion::new(buffer, n, status_of(done.status))
                }
                Pipe::BulkOut => {
                    let done = self.bulk_out.next_complete().await;
                    let buffer = self.parked_out.take().unwrap_or_default();
                    Completion::new(buffer, done.actual_len, status_of(done.status))
                }
                Pipe::Control => {
                    let Some(pending) = self.control.as_mut() else {
                        return Completion::new(
                            Vec::new(),
                            0,
                            TransferStatus::Failed("no control transfer pending".into()),
                        );
                    };
                    // the handle stays parked until it resolves, so a flush can still abort it
                    let joined = (&mut pending.task).await;
                    let Some(PendingControl { setup, mut buffer, .. }) = self.control.take() else {
                        return Completion::new(Vec::new(), 0, TransferStatus::Cancelled);
                    };
                    match joined {
                        Ok(Ok(data)) => {
                            let n = if setup.is_in() { data.len() } else { setup.length as usize };
                            if setup.is_in() {
                                if buffer.len() < n {
                                    buffer.resize(n, 0);
                                }
                                buffer[..n].copy_from_slice(&data);
                            }
                            Completion::new(buffer, n, TransferStatus::Completed)
                        }
                        Ok(Err(e)) => Completion::new(buffer, 0, status_of(Err(e))),
                        Err(join) if join.is_cancelled() => {
                            Completion::new(buffer, 0, TransferStatus::Cancelled)
                        }
                        Err(join) => {
                            Completion::new(buffer, 0, TransferStatus::Failed(join.to_string()))
                        }
                    }
                }
            }
        }
    }

    fn halt(&mut self, pipe: Pipe) {
        // no host-side halt in nusb, flush and clear stop the pipe
        trace!(?pipe, "halt");
    }

    fn flush(&mut self, pipe: Pipe) {
        match pipe {
            Pipe::BulkIn => self.bulk_in.cancel_all(),
            Pipe::BulkOut => self.bulk_out.cancel_all(),
            Pipe::Control => {
                if let Some(pending) = &self.control {
                    pending.task.abort();
                }
            }
        }
    }

    fn clear(&mut self, pipe: Pipe) -> impl Future<Output = Result<(), TransportError>> + Send + '_ {
        async move {
            let cleared = match pipe {
                Pipe::BulkIn => self.bulk_in.clear_halt().await,
                Pipe::BulkOut => self.bulk_out.clear_halt().await,
                Pipe::Control => Ok(()),
            };
            cleared.map_err(|e| TransportError::Failed(e.to_string()))
        }
    }
}
