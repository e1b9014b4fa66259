//! µacm: firmware side of a full-speed USB 2.0 CDC-ACM device with a DFU
//! runtime interface and Microsoft OS 2.0 descriptors.
//!
//! `usb_desc` builds and resolves the descriptors, `usb_bd` moves bytes
//! through the controller's buffer descriptors. This crate ties them
//! together on endpoint 0.

#![no_std]

#[macro_use]
mod fmt;

pub mod control;
pub mod port;

pub use usb_bd;
pub use usb_desc;

pub use control::{RequestCode, SetupPacket};
pub use port::{PortEvent, UsbPort};
