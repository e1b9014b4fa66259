//! Control requests as carried by the 8-byte SETUP packet.
//!
//! cf §9.3 and §9.4 of USB 2.0

use usb_desc::DescriptorType;

pub const SETUP_PACKET_LEN: usize = 8;

/// Data stage direction, bit 7 of `bmRequestType`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    Out,
    In,
}

/// Bits 6..5 of `bmRequestType`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::FromRepr)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RequestKind {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

/// Bits 4..0 of `bmRequestType`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::FromRepr)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RequestRecipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RequestType(u8);

impl RequestType {
    pub const fn new(direction: Direction, kind: RequestKind, recipient: RequestRecipient) -> Self {
        let dir = match direction {
            Direction::Out => 0,
            Direction::In => 0x80,
        };
        RequestType(dir | (kind as u8) << 5 | recipient as u8)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn direction(self) -> Direction {
        if self.0 & 0x80 == 0 {
            Direction::Out
        } else {
            Direction::In
        }
    }

    pub fn kind(self) -> RequestKind {
        RequestKind::from_repr((self.0 >> 5) & 0x3).unwrap_or(RequestKind::Reserved)
    }

    /// `None` for the reserved recipient codes 4..31.
    pub fn recipient(self) -> Option<RequestRecipient> {
        RequestRecipient::from_repr(self.0 & 0x1f)
    }
}

impl From<u8> for RequestType {
    fn from(bits: u8) -> Self {
        RequestType(bits)
    }
}

/// Standard request codes.
///
/// cf §9.4 Table 9-4 of USB 2.0
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::FromRepr)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RequestCode {
    GetStatus = 0,
    ClearFeature = 1,
    SetFeature = 3,
    SetAddress = 5,
    GetDescriptor = 6,
    SetDescriptor = 7,
    GetConfiguration = 8,
    SetConfiguration = 9,
    GetInterface = 10,
    SetInterface = 11,
    SynchFrame = 12,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WValue(u16);

impl WValue {
    pub fn from_lo_hi(lo: u8, hi: u8) -> Self {
        WValue(u16::from_le_bytes([lo, hi]))
    }

    pub fn lo(self) -> u8 {
        self.0 as u8
    }

    pub fn hi(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    /// `GET_DESCRIPTOR` puts the type in the high byte and the index in
    /// the low byte.
    pub fn descriptor(self) -> (u8, u8) {
        (self.hi(), self.lo())
    }
}

impl From<u16> for WValue {
    fn from(bits: u16) -> Self {
        WValue(bits)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    pub request_type: RequestType,
    pub request: u8,
    pub value: WValue,
    pub index: u16,
    /// Bytes in the data stage, zero when there is none.
    pub length: u16,
}

impl SetupPacket {
    pub fn from_bytes(raw: [u8; SETUP_PACKET_LEN]) -> Self {
        SetupPacket {
            request_type: RequestType(raw[0]),
            request: raw[1],
            value: WValue::from_lo_hi(raw[2], raw[3]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; SETUP_PACKET_LEN] {
        let [v0, v1] = self.value.bits().to_le_bytes();
        let [i0, i1] = self.index.to_le_bytes();
        let [l0, l1] = self.length.to_le_bytes();
        [self.request_type.bits(), self.request, v0, v1, i0, i1, l0, l1]
    }

    pub fn get_descriptor(ty: DescriptorType, index: u8, lang_id: u16, length: u16) -> Self {
        SetupPacket {
            request_type: RequestType::new(Direction::In, RequestKind::Standard, RequestRecipient::Device),
            request: RequestCode::GetDescriptor as u8,
            value: WValue::from_lo_hi(index, ty as u8),
            index: lang_id,
            length,
        }
    }

    /// The standard request this packet carries, if it is one.
    pub fn standard_request(&self) -> Option<RequestCode> {
        match self.request_type.kind() {
            RequestKind::Standard => RequestCode::from_repr(self.request),
            _ => None,
        }
    }

    pub fn direction(&self) -> Direction {
        self.request_type.direction()
    }

    pub fn has_data_stage(&self) -> bool {
        self.length != 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode_get_descriptor() {
        let setup = SetupPacket::from_bytes([0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0xff, 0x00]);
        assert_eq!(setup.direction(), Direction::In);
        assert_eq!(setup.request_type.kind(), RequestKind::Standard);
        assert_eq!(setup.request_type.recipient(), Some(RequestRecipient::Device));
        assert_eq!(setup.standard_request(), Some(RequestCode::GetDescriptor));
        assert_eq!(setup.value.descriptor(), (DescriptorType::Configuration as u8, 0));
        assert_eq!(setup.length, 255);
        assert!(setup.has_data_stage());
    }

    #[test]
    fn vendor_request_is_not_standard() {
        // same bRequest as GET_DESCRIPTOR, only the type bits differ
        let setup = SetupPacket::from_bytes([0xc0, 0x06, 0x00, 0x00, 0x07, 0x00, 0x1e, 0x00]);
        assert_eq!(setup.request_type.kind(), RequestKind::Vendor);
        assert_eq!(setup.standard_request(), None);
        assert_eq!(setup.index, 7);
    }

    #[test]
    fn build_get_descriptor() {
        let setup = SetupPacket::get_descriptor(DescriptorType::String, 3, 0x0409, 64);
        assert_eq!(setup.to_bytes(), [0x80, 0x06, 0x03, 0x03, 0x09, 0x04, 0x40, 0x00]);
    }

    #[test]
    fn request_type_fields() {
        let rt = RequestType::new(Direction::Out, RequestKind::Class, RequestRecipient::Interface);
        assert_eq!(rt.bits(), 0x21);
        assert_eq!(RequestType::from(0x9f).recipient(), None);
        assert_eq!(RequestType::from(0x02).recipient(), Some(RequestRecipient::Endpoint));
    }
}
