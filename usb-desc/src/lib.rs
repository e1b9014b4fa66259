//! Descriptor side of the µacm full-speed USB device.
//!
//! `descriptor` and `bos` define the byte-exact wire layouts (§9.6 of
//! USB 2.0, the CDC 1.2 and DFU 1.1 class specifications and Microsoft
//! OS 2.0). `catalog` builds the immutable descriptor store at startup
//! and `resolve` answers `GET_DESCRIPTOR` lookups against it.

#![no_std]

#[macro_use]
mod fmt;

pub mod bos;
pub mod catalog;
pub mod descriptor;
pub mod resolve;
pub mod string;

pub use bos::*;
pub use catalog::{Catalog, CatalogError, Descriptors, Entry, ProvisionError, Provisioning};
pub use descriptor::*;
pub use resolve::NotFound;
pub use string::{StringDescriptor, StringError};

/// Descriptor type codes served or embedded by this device.
///
/// cf §9.4 Table 9-5 of USB 2.0, USB 3.x §9.4 for BOS.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::FromRepr)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,

    BinaryObjectStore = 0xF,
    DeviceCapability = 0x10,

    DfuFunctional = 0x21,
    ClassInterface = 0x24,
    ClassEndpoint = 0x25,
}

/// Interface class codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::FromRepr)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Class {
    FromInterface = 0x0,
    Cdc = 0x02,
    CdcData = 0x0A,
    ApplicationSpecific = 0xFE,
    VendorSpecific = 0xFF,
}

/// The type of transfer an endpoint uses, as encoded in `bmAttributes`.
///
/// cf §9.6.6 of USB 2.0
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::FromRepr)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TransferType {
    Control = 0x0,
    Isochronous = 0x1,
    Bulk = 0x2,
    Interrupt = 0x3,
}

/// Bit 7 is the direction, with OUT = 0 and IN = 1
pub const ENDPOINT_DIRECTION_MASK: u8 = 0x80;

/// Bits 3..0 are the endpoint number
pub const ENDPOINT_NUMBER_MASK: u8 = 0x0F;
