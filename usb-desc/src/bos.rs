//! Binary Object Store with the Microsoft OS 2.0 platform capability,
//! and the MS OS 2.0 descriptor set it points Windows at.
//!
//! The capability's `wMSOSDescriptorSetTotalLength` must equal the set's
//! own `wTotalLength`, otherwise Windows refuses the composite binding.

use crate::DescriptorType;

pub const CAPABILITY_PLATFORM: u8 = 0x05;

/// {D8DD60DF-4589-4CC7-9CD2-659D9E648A9F}, in wire order.
pub const MSOS20_PLATFORM_UUID: [u8; 16] = [
    0xdf, 0x60, 0xdd, 0xd8, 0x89, 0x45, 0xc7, 0x4c,
    0x9c, 0xd2, 0x65, 0x9d, 0x9e, 0x64, 0x8a, 0x9f,
];

pub const MSOS20_WIN_VER_8_1: u32 = 0x0603_0000;
pub const MSOS20_SET_HEADER_DESCRIPTOR: u16 = 0x00;
pub const MSOS20_FEATURE_COMPATIBLE_ID: u16 = 0x03;

/// `wIndex` of the vendor request that fetches the descriptor set.
pub const MSOS20_DESCRIPTOR_INDEX: u16 = 0x07;

pub const WINUSB_COMPATIBLE_ID: [u8; 8] = *b"WINUSB\0\0";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BosDescriptor {
    pub w_total_length: u16,
    pub b_num_device_caps: u8,
}

impl BosDescriptor {
    pub const LEN: usize = 5;

    pub const fn bytes(&self) -> [u8; Self::LEN] {
        let total = self.w_total_length.to_le_bytes();
        [
            Self::LEN as u8,
            DescriptorType::BinaryObjectStore as u8,
            total[0],
            total[1],
            self.b_num_device_caps,
        ]
    }
}

/// Platform device capability carrying the MS OS 2.0 payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MsOs20Capability {
    pub dw_windows_version: u32,
    pub w_msos_descriptor_set_total_length: u16,
    pub b_ms_vendor_code: u8,
    pub b_alt_enum_code: u8,
}

impl MsOs20Capability {
    /// 20-byte platform capability header plus the 8-byte payload.
    pub const LEN: usize = 28;

    /// Offset of `wMSOSDescriptorSetTotalLength` inside this record.
    pub const SET_LENGTH_OFFSET: usize = 24;

    pub const fn bytes(&self) -> [u8; Self::LEN] {
        let version = self.dw_windows_version.to_le_bytes();
        let set_len = self.w_msos_descriptor_set_total_length.to_le_bytes();
        let uuid = MSOS20_PLATFORM_UUID;
        [
            Self::LEN as u8,
            DescriptorType::DeviceCapability as u8,
            CAPABILITY_PLATFORM,
            0, // reserved
            uuid[0], uuid[1], uuid[2], uuid[3],
            uuid[4], uuid[5], uuid[6], uuid[7],
            uuid[8], uuid[9], uuid[10], uuid[11],
            uuid[12], uuid[13], uuid[14], uuid[15],
            version[0],
            version[1],
            version[2],
            version[3],
            set_len[0],
            set_len[1],
            self.b_ms_vendor_code,
            self.b_alt_enum_code,
        ]
    }
}

/// MS OS 2.0 descriptor set header. Unlike USB descriptors, MS OS 2.0
/// records use 16-bit `wLength` and `wDescriptorType` fields.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MsOs20SetHeader {
    pub dw_windows_version: u32,
    pub w_total_length: u16,
}

impl MsOs20SetHeader {
    pub const LEN: usize = 10;

    pub const fn bytes(&self) -> [u8; Self::LEN] {
        let len = (Self::LEN as u16).to_le_bytes();
        let ty = MSOS20_SET_HEADER_DESCRIPTOR.to_le_bytes();
        let version = self.dw_windows_version.to_le_bytes();
        let total = self.w_total_length.to_le_bytes();
        [
            len[0], len[1],
            ty[0], ty[1],
            version[0], version[1], version[2], version[3],
            total[0], total[1],
        ]
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MsOs20CompatibleId {
    pub compatible_id: [u8; 8],
    pub sub_compatible_id: [u8; 8],
}

impl MsOs20CompatibleId {
    pub const LEN: usize = 20;

    pub const fn bytes(&self) -> [u8; Self::LEN] {
        let len = (Self::LEN as u16).to_le_bytes();
        let ty = MSOS20_FEATURE_COMPATIBLE_ID.to_le_bytes();
        let id = self.compatible_id;
        let sub = self.sub_compatible_id;
        [
            len[0], len[1],
            ty[0], ty[1],
            id[0], id[1], id[2], id[3], id[4], id[5], id[6], id[7],
            sub[0], sub[1], sub[2], sub[3], sub[4], sub[5], sub[6], sub[7],
        ]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn platform_capability_layout() {
        let cap = MsOs20Capability {
            dw_windows_version: MSOS20_WIN_VER_8_1,
            w_msos_descriptor_set_total_length: 30,
            b_ms_vendor_code: 0x20,
            b_alt_enum_code: 0,
        };
        let bytes = cap.bytes();
        assert_eq!(&bytes[..4], &[28, 0x10, 0x05, 0x00]);
        assert_eq!(&bytes[4..20], &MSOS20_PLATFORM_UUID);
        assert_eq!(&bytes[20..24], &[0x00, 0x00, 0x03, 0x06]);
        let set_len = MsOs20Capability::SET_LENGTH_OFFSET;
        assert_eq!(&bytes[set_len..set_len + 2], &[30, 0]);
        assert_eq!(&bytes[26..], &[0x20, 0x00]);
    }

    #[test]
    fn compatible_id_is_winusb() {
        let feat = MsOs20CompatibleId {
            compatible_id: WINUSB_COMPATIBLE_ID,
            sub_compatible_id: [0; 8],
        };
        let bytes = feat.bytes();
        assert_eq!(&bytes[..4], &[20, 0, 3, 0]);
        assert_eq!(&bytes[4..12], b"WINUSB\0\0");
        assert!(bytes[12..].iter().all(|b| *b == 0));
    }

    #[test]
    fn set_header_layout() {
        let hdr = MsOs20SetHeader { dw_windows_version: MSOS20_WIN_VER_8_1, w_total_length: 30 };
        assert_eq!(hdr.bytes(), [10, 0, 0, 0, 0x00, 0x00, 0x03, 0x06, 30, 0]);
    }
}
