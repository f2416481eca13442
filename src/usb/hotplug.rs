//! Device discovery and the attach/detach lifecycle.
//!
//! When a drive is plugged in, the host looks at its device, configuration, interface
//! and endpoint descriptors to determine what kind of device it is. Drives speaking
//! Bulk-Only Transport use the mass storage class (0x08) and the bulk-only transport
//! protocol (0x50) on one of their interfaces, with two bulk endpoints: one for sending
//! data to the drive (OUT) and one for receiving data from it (IN). Get Max LUN and the
//! Bulk-Only reset are sent over the control endpoint.
//!
//! See <https://www.downtowndougbrown.com/2018/12/usb-mass-storage-with-embedded-devices-tips-and-quirks/>

use std::future::Future;
use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::{ensure, eyre};
use nusb::descriptors::TransferType;
use nusb::transfer::Direction;
use nusb::{DeviceId, DeviceInfo, list_devices};
use tracing::{debug, info, warn};

use super::nusb_backend::NusbBackend;
use super::slot::DriveSlot;
use super::transport::{EndpointInfo, SetupPacket, TransportError, USBDrive, UsbBackend};
use crate::scsi::SCSIDevice;

/// https://www.usb.org/defined-class-codes
const MASS_STORAGE_USB_CLASS: u8 = 0x08;
/// `bInterfaceProtocol` of Bulk-Only Transport (USB MSC overview, table 3).
const BULK_ONLY_PROTOCOL: u8 = 0x50;

/// Whether an interface with these codes speaks Bulk-Only Transport.
pub fn is_bulk_only(class: u8, protocol: u8) -> bool {
    class == MASS_STORAGE_USB_CLASS && protocol == BULK_ONLY_PROTOCOL
}

/// The number of the first Bulk-Only mass storage interface of the device.
fn bulk_only_interface(device: &DeviceInfo) -> Option<u8> {
    device
        .interfaces()
        .find(|interface| is_bulk_only(interface.class(), interface.protocol()))
        .map(|interface| interface.interface_number())
}

/// The first bulk IN and the first bulk OUT endpoint, other transfer types are skipped.
fn bulk_endpoints(
    endpoints: impl IntoIterator<Item = (TransferType, Direction, EndpointInfo)>,
) -> Option<(EndpointInfo, EndpointInfo)> {
    let mut bulk_in = None;
    let mut bulk_out = None;
    for (transfer_type, direction, info) in endpoints {
        if transfer_type != TransferType::Bulk {
            continue;
        }
        match direction {
            Direction::In => bulk_in = bulk_in.or(Some(info)),
            Direction::Out => bulk_out = bulk_out.or(Some(info)),
        }
    }
    bulk_in.zip(bulk_out)
}

/// Returns every USB device currently connected that exposes a Bulk-Only mass storage
/// interface.
pub async fn enumerate_usb_storage_devices() -> Result<Vec<DeviceInfo>> {
    let all_usb_devices = list_devices().await?;
    Ok(all_usb_devices
        .filter(|dev| {
            debug!("scanning usb device: {:04x}:{:04x}", dev.vendor_id(), dev.product_id());
            bulk_only_interface(dev).is_some()
        })
        .collect())
}

/// Opens the provided USB mass storage device.
///
/// Claims the Bulk-Only interface, locates its bulk endpoints and checks with Get Max
/// LUN that the device has a single logical unit.
#[tracing::instrument(skip(device_info), fields(vid = device_info.vendor_id(), pid = device_info.product_id()))]
pub async fn open_usb_device(device_info: &DeviceInfo) -> Result<USBDrive<NusbBackend>> {
    let number = bulk_only_interface(device_info)
        .ok_or_else(|| eyre!("device has no Bulk-Only mass storage interface"))?;

    // 1. Claim the interface, taking it from the OS storage driver if needed
    debug!(interface = number, "opening device");
    let device = device_info.open().await?;
    let interface = device.detach_and_claim_interface(number).await?;

    // 2. Find the bulk endpoints of the default alternate setting
    let configuration = device.active_configuration()?;
    let mut endpoints = Vec::new();
    for alt in configuration.interface_alt_settings() {
        if alt.interface_number() != number || alt.alternate_setting() != 0 {
            continue;
        }
        endpoints.extend(alt.endpoints().map(|endpoint| {
            let info = EndpointInfo {
                address: endpoint.address(),
                max_packet_size: endpoint.max_packet_size(),
            };
            (endpoint.transfer_type(), endpoint.direction(), info)
        }));
    }
    let (bulk_in, bulk_out) =
        bulk_endpoints(endpoints).ok_or_else(|| eyre!("could not find both bulk endpoints"))?;
    debug!(?bulk_in, ?bulk_out, "found bulk endpoints");

    let backend = NusbBackend::new(interface, bulk_in, bulk_out)?;
    let mut drive = USBDrive::new(backend, number, bulk_in, bulk_out);

    // 3. Request the maximum LUN
    check_single_lun(&mut drive).await?;
    Ok(drive)
}

/// Sends GET MAX LUN and refuses devices with more than one logical unit.
///
/// Devices with a single LUN may stall the request instead of answering it.
pub async fn check_single_lun<B: UsbBackend>(drive: &mut USBDrive<B>) -> Result<()> {
    let mut max_lun = [0u8; 1];
    match drive
        .control_transfer(SetupPacket::get_max_lun(drive.interface()), &mut max_lun)
        .await
    {
        Ok(_) => {}
        Err(TransportError::Stall) => debug!("GET MAX LUN stalled, assuming a single LUN"),
        Err(e) => return Err(e.into()),
    }
    ensure!(
        max_lun[0] == 0,
        "devices with more than one LUN are not supported (max LUN {})",
        max_lun[0]
    );
    Ok(())
}

/// The device filling the slot, and the devices that failed to open.
#[derive(Debug)]
struct Attachments<Id> {
    current: Option<Id>,
    rejected: Vec<Id>,
}

impl<Id: Copy + PartialEq> Attachments<Id> {
    fn new() -> Self {
        Self {
            current: None,
            rejected: Vec::new(),
        }
    }

    /// Brings `slot` in line with the devices `present` on the bus.
    ///
    /// A device that failed to open is not tried again until it has left the bus.
    async fn update<B, F, Fut>(&mut self, slot: &DriveSlot<B>, present: &[Id], open: F)
    where
        B: UsbBackend,
        F: FnOnce(Id) -> Fut,
        Fut: Future<Output = Result<USBDrive<B>>>,
    {
        self.rejected.retain(|id| present.contains(id));
        if let Some(id) = self.current {
            if !present.contains(&id) {
                info!("drive removed");
                slot.detach().await;
                self.current = None;
            }
        }
        if self.current.is_some() {
            return;
        }
        let Some(&id) = present.iter().find(|id| !self.rejected.contains(id)) else {
            return;
        };
        match open(id).await {
            Ok(drive) => {
                slot.attach(SCSIDevice::new(drive)).await;
                self.current = Some(id);
            }
            Err(e) => {
                warn!("could not open device: {e:#}");
                self.rejected.push(id);
            }
        }
    }
}

/// Polls the bus forever, opening the first Bulk-Only device into `slot` and detaching
/// it once it disappears.
pub async fn watch(slot: DriveSlot<NusbBackend>, poll: Duration) {
    let mut attachments: Attachments<DeviceId> = Attachments::new();
    loop {
        match enumerate_usb_storage_devices().await {
            Ok(devices) => {
                let present: Vec<DeviceId> = devices.iter().map(DeviceInfo::id).collect();
                let devices = &devices;
                attachments
                    .update(&slot, &present, |id| async move {
                        let info = devices
                            .iter()
                            .find(|d| d.id() == id)
                            .ok_or_else(|| eyre!("device left the bus"))?;
                        let drive = open_usb_device(info).await?;
                        info!(
                            vid = info.vendor_id(),
                            pid = info.product_id(),
                            "opened mass storage device"
                        );
                        Ok::<_, color_eyre::Report>(drive)
                    })
                    .await;
            }
            Err(e) => warn!("device enumeration failed: {e:#}"),
        }
        tokio::time::sleep(poll).await;
    }
}
