//! Interactions with USB mass storage devices
//!
//! The host sends a 31-byte command block wrapper (CBW) to the drive, optionally sends
//! or receives data depending on the command, and then reads a 13-byte command status
//! wrapper (CSW) containing the result. The CBW and CSW are wrappers around SCSI
//! commands, see [`crate::scsi`].
//!
//! Specifications:
//! - USB Mass Storage Class – Bulk Only Transport, revision 1.0
//!   <https://www.usb.org/sites/default/files/usbmassbulk_10.pdf>

pub mod cbw;
pub mod hotplug;
pub mod nusb_backend;
pub mod slot;
pub mod transport;

#[cfg(test)]
pub mod sim;

pub use transport::USBDrive;
