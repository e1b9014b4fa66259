//! String descriptors in fixed-size UTF-16LE slots.
//!
//! Every slot reserves room for `MAX_STRING_UNITS` code units so that a
//! string can be re-provisioned (serial number, product name) without
//! moving anything; `bLength` tracks the logical string and the unused
//! tail stays zeroed.

use crate::DescriptorType;

pub const MAX_STRING_UNITS: usize = 16;

pub const LANG_ID_EN_US: u16 = 0x0409;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StringError {
    /// More than `MAX_STRING_UNITS` UTF-16 code units.
    TooLong,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StringDescriptor {
    buf: [u8; Self::CAPACITY],
}

impl StringDescriptor {
    pub const CAPACITY: usize = 2 + 2 * MAX_STRING_UNITS;

    /// String index 0: the supported LANGIDs.
    pub fn languages(ids: &[u16]) -> Result<Self, StringError> {
        Self::from_units(ids.iter().copied())
    }

    pub fn new(s: &str) -> Result<Self, StringError> {
        Self::from_units(s.encode_utf16())
    }

    fn from_units(units: impl Iterator<Item = u16>) -> Result<Self, StringError> {
        let mut buf = [0u8; Self::CAPACITY];
        let mut len = 2;
        for unit in units {
            let dst = buf.get_mut(len..len + 2).ok_or(StringError::TooLong)?;
            dst.copy_from_slice(&unit.to_le_bytes());
            len += 2;
        }
        buf[0] = len as u8;
        buf[1] = DescriptorType::String as u8;
        Ok(Self { buf })
    }

    /// `bLength`: header plus the logical string, not the slot size.
    pub fn len(&self) -> usize {
        self.buf[0] as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 2
    }

    /// The bytes served on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len()]
    }

    /// The whole slot including zero padding.
    pub fn slot(&self) -> &[u8; Self::CAPACITY] {
        &self.buf
    }

    pub fn units(&self) -> impl Iterator<Item = u16> + '_ {
        self.as_bytes()[2..]
            .chunks_exact(2)
            .map(|unit| u16::from_le_bytes([unit[0], unit[1]]))
    }
}
