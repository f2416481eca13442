//! Stand-alone audio CD player for USB optical drives.
//!
//! [`usb`] speaks Bulk-Only Transport to the drive, [`scsi`] builds the MMC commands
//! on top of it, and [`player`] runs the Monitor and Playback loops.

pub mod config;
pub mod console;
pub mod player;
pub mod scsi;
pub mod settings;
pub mod sink;
pub mod usb;
