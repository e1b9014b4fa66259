//! Standard and class-specific descriptors carried in the device and
//! configuration descriptors.
//!
//! Each record serializes itself with `bytes()`: multi-byte fields go
//! out little-endian and nothing is padded, whatever the host alignment
//! rules. `bLength` and `bDescriptorType` are implied by the type.

use bitflags::bitflags;

use crate::{Class, DescriptorType, TransferType};

pub const USB_VERSION_2_0: u16 = 0x0200;

/// bmAttributes bit 7 is reserved and must be set (USB 1.0 "bus powered").
pub const CONFIG_ATTR_RESERVED: u8 = 0x80;

pub const CDC_SUBCLASS_ACM: u8 = 0x02;
pub const CDC_SUBTYPE_HEADER: u8 = 0x00;
pub const CDC_SUBTYPE_ACM: u8 = 0x02;
pub const CDC_SUBTYPE_UNION: u8 = 0x06;
pub const CDC_VERSION_1_10: u16 = 0x0110;

pub const DFU_SUBCLASS: u8 = 0x01;
pub const DFU_PROTOCOL_RUNTIME: u8 = 0x01;
pub const DFU_VERSION_1_1: u16 = 0x0101;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceDescriptor {
    pub bcd_usb: u16,
    pub b_device_class: u8,
    pub b_device_sub_class: u8,
    pub b_device_protocol: u8,
    pub b_max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub b_num_configurations: u8,
}

impl DeviceDescriptor {
    pub const LEN: usize = 18;

    pub const fn bytes(&self) -> [u8; Self::LEN] {
        let bcd_usb = self.bcd_usb.to_le_bytes();
        let vid = self.id_vendor.to_le_bytes();
        let pid = self.id_product.to_le_bytes();
        let bcd_device = self.bcd_device.to_le_bytes();
        [
            Self::LEN as u8,
            DescriptorType::Device as u8,
            bcd_usb[0],
            bcd_usb[1],
            self.b_device_class,
            self.b_device_sub_class,
            self.b_device_protocol,
            self.b_max_packet_size0,
            vid[0],
            vid[1],
            pid[0],
            pid[1],
            bcd_device[0],
            bcd_device[1],
            self.i_manufacturer,
            self.i_product,
            self.i_serial_number,
            self.b_num_configurations,
        ]
    }
}

/// Configuration header. `w_total_length` covers every sub-descriptor
/// that follows it in the composite blob.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigurationDescriptor {
    pub w_total_length: u16,
    pub b_num_interfaces: u8,
    pub b_configuration_value: u8,
    pub i_configuration: u8,
    pub bm_attributes: u8,
    pub b_max_power: u8,
}

impl ConfigurationDescriptor {
    pub const LEN: usize = 9;

    pub const fn bytes(&self) -> [u8; Self::LEN] {
        let total = self.w_total_length.to_le_bytes();
        [
            Self::LEN as u8,
            DescriptorType::Configuration as u8,
            total[0],
            total[1],
            self.b_num_interfaces,
            self.b_configuration_value,
            self.i_configuration,
            self.bm_attributes,
            self.b_max_power,
        ]
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InterfaceDescriptor {
    pub b_interface_number: u8,
    pub b_alternate_setting: u8,
    pub b_num_endpoints: u8,
    pub b_interface_class: u8,
    pub b_interface_sub_class: u8,
    pub b_interface_protocol: u8,
    pub i_interface: u8,
}

impl InterfaceDescriptor {
    pub const LEN: usize = 9;

    pub const fn bytes(&self) -> [u8; Self::LEN] {
        [
            Self::LEN as u8,
            DescriptorType::Interface as u8,
            self.b_interface_number,
            self.b_alternate_setting,
            self.b_num_endpoints,
            self.b_interface_class,
            self.b_interface_sub_class,
            self.b_interface_protocol,
            self.i_interface,
        ]
    }

    /// An interface the host has no class driver for, used to hide a
    /// function without changing the composite layout.
    pub const fn hidden(mut self) -> Self {
        self.b_interface_class = Class::VendorSpecific as u8;
        self.b_interface_sub_class = 0xFF;
        self.b_interface_protocol = 0xFF;
        self
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointDescriptor {
    pub b_endpoint_address: u8,
    pub bm_attributes: TransferType,
    pub w_max_packet_size: u16,
    pub b_interval: u8,
}

impl EndpointDescriptor {
    pub const LEN: usize = 7;

    pub const fn bytes(&self) -> [u8; Self::LEN] {
        let mps = self.w_max_packet_size.to_le_bytes();
        [
            Self::LEN as u8,
            DescriptorType::Endpoint as u8,
            self.b_endpoint_address,
            self.bm_attributes as u8,
            mps[0],
            mps[1],
            self.b_interval,
        ]
    }
}

/// CDC header functional descriptor (CDC 1.2 §5.2.3.1).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CdcHeaderDescriptor {
    pub bcd_cdc: u16,
}

impl CdcHeaderDescriptor {
    pub const LEN: usize = 5;

    pub const fn bytes(&self) -> [u8; Self::LEN] {
        let bcd = self.bcd_cdc.to_le_bytes();
        [
            Self::LEN as u8,
            DescriptorType::ClassInterface as u8,
            CDC_SUBTYPE_HEADER,
            bcd[0],
            bcd[1],
        ]
    }
}

/// Abstract Control Management functional descriptor (PSTN 1.2 §5.3.2).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CdcAcmDescriptor {
    pub bm_capabilities: u8,
}

impl CdcAcmDescriptor {
    pub const LEN: usize = 4;

    pub const fn bytes(&self) -> [u8; Self::LEN] {
        [
            Self::LEN as u8,
            DescriptorType::ClassInterface as u8,
            CDC_SUBTYPE_ACM,
            self.bm_capabilities,
        ]
    }
}

/// Union functional descriptor with a single subordinate interface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CdcUnionDescriptor {
    pub b_master_interface: u8,
    pub b_slave_interface: u8,
}

impl CdcUnionDescriptor {
    pub const LEN: usize = 5;

    pub const fn bytes(&self) -> [u8; Self::LEN] {
        [
            Self::LEN as u8,
            DescriptorType::ClassInterface as u8,
            CDC_SUBTYPE_UNION,
            self.b_master_interface,
            self.b_slave_interface,
        ]
    }
}

bitflags! {
    /// DFU functional descriptor `bmAttributes` (DFU 1.1 §4.1.3).
    pub struct DfuAttributes: u8 {
        const CAN_DNLOAD = 1 << 0;
        const CAN_UPLOAD = 1 << 1;
        const MANIFESTATION_TOLERANT = 1 << 2;
        const WILL_DETACH = 1 << 3;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DfuFunctionalDescriptor {
    pub bm_attributes: DfuAttributes,
    pub w_detach_timeout: u16,
    pub w_transfer_size: u16,
    pub bcd_dfu_version: u16,
}

impl DfuFunctionalDescriptor {
    pub const LEN: usize = 9;

    pub const fn bytes(&self) -> [u8; Self::LEN] {
        let detach = self.w_detach_timeout.to_le_bytes();
        let xfer = self.w_transfer_size.to_le_bytes();
        let version = self.bcd_dfu_version.to_le_bytes();
        [
            Self::LEN as u8,
            DescriptorType::DfuFunctional as u8,
            self.bm_attributes.bits(),
            detach[0],
            detach[1],
            xfer[0],
            xfer[1],
            version[0],
            version[1],
        ]
    }
}
