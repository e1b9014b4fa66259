//! Controller register map.
//!
//! ```text
//! 0x000  CSR    pull-up, pending events, device address
//! 0x004  AR     event acknowledge
//! 0x008  EVT    transfer event
//! 0x400  EP[n]  0x400 + (n & 0xf) * 64 + (IN ? 32 : 0)
//!        +0x00  EP CSR
//!        +0x10  BD0 CSR, +0x14 BD0 PTR
//!        +0x18  BD1 CSR, +0x1c BD1 PTR
//! ```

use bitflags::bitflags;
use usb_desc::{TransferType, ENDPOINT_DIRECTION_MASK, ENDPOINT_NUMBER_MASK};

bitflags! {
    pub struct UsbCsr: u32 {
        const PU_ENA = 1 << 15;
        const EVT_PENDING = 1 << 14;
        const CEL_ACTIVE = 1 << 13;
        const CEL_ENA = 1 << 12;
        const BUS_SUSPEND = 1 << 11;
        const BUS_RST = 1 << 10;
        const BUS_RST_PENDING = 1 << 9;
        const SOF_PENDING = 1 << 8;
        const ADDR_MATCH = 1 << 7;
        const ADDR = 0x7f;
    }
}

bitflags! {
    pub struct UsbAr: u32 {
        const CEL_RELEASE = 1 << 13;
        const BUS_RST_CLEAR = 1 << 9;
        const SOF_CLEAR = 1 << 8;
    }
}

/// Endpoint type field, bits 2..0 of the EP CSR.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::FromRepr)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum EpType {
    None = 0x0,
    Isochronous = 0x1,
    Interrupt = 0x2,
    Bulk = 0x4,
    Control = 0x6,
}

impl EpType {
    /// Bulk, control and interrupt endpoints reuse bit 0 as HALTED.
    pub const fn can_halt(self) -> bool {
        (self as u8) & 0x6 != 0
    }
}

impl From<TransferType> for EpType {
    fn from(v: TransferType) -> Self {
        match v {
            TransferType::Control => Self::Control,
            TransferType::Isochronous => Self::Isochronous,
            TransferType::Bulk => Self::Bulk,
            TransferType::Interrupt => Self::Interrupt,
        }
    }
}

bitflags! {
    pub struct EpFlags: u32 {
        /// Alternate between BD0 and BD1.
        const BD_DUAL = 0x10;
        /// SETUP into BD1, DATA into BD0.
        const BD_CTRL = 0x20;
        /// BD the controller services next.
        const BD_IDX = 0x40;
        /// Data toggle of the next packet.
        const DT = 0x80;
    }
}

const EP_TYPE_MASK: u32 = 0x7;
const EP_HALTED: u32 = 0x1;

/// Endpoint control word.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EpCsr(u32);

impl EpCsr {
    pub const DISABLED: Self = Self(0);

    pub const fn new(ty: EpType, flags: EpFlags) -> Self {
        Self(ty as u32 | flags.bits())
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn ep_type(self) -> EpType {
        let ty = self.0 & EP_TYPE_MASK;
        let ty = if ty & 0x6 != 0 { ty & !EP_HALTED } else { ty };
        EpType::from_repr(ty as u8).unwrap_or(EpType::None)
    }

    pub fn is_halted(self) -> bool {
        let ty = self.0 & EP_TYPE_MASK;
        ty & 0x6 != 0 && ty & EP_HALTED != 0
    }

    /// No effect on isochronous or disabled endpoints.
    #[must_use]
    pub fn with_halted(self, halted: bool) -> Self {
        match self.ep_type() {
            ty if ty.can_halt() && halted => Self(self.0 | EP_HALTED),
            ty if ty.can_halt() => Self(self.0 & !EP_HALTED),
            _ => self,
        }
    }

    pub fn flags(self) -> EpFlags {
        EpFlags::from_bits_truncate(self.0)
    }

    #[must_use]
    pub fn with_flags(self, flags: EpFlags, on: bool) -> Self {
        if on {
            Self(self.0 | flags.bits())
        } else {
            Self(self.0 & !flags.bits())
        }
    }
}

/// BD ownership state, bits 15..13 of the BD CSR.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::FromRepr)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum BdState {
    None = 0x0000,
    /// Owned by the controller, waiting for a data packet.
    RdyData = 0x4000,
    /// Owned by the controller, answering STALL.
    RdyStall = 0x6000,
    DoneOk = 0x8000,
    /// CRC, bit stuffing or babble error.
    DoneErr = 0xa000,
}

impl BdState {
    pub fn is_ready(self) -> bool {
        matches!(self, BdState::RdyData | BdState::RdyStall)
    }

    pub fn is_done(self) -> bool {
        matches!(self, BdState::DoneOk | BdState::DoneErr)
    }
}

/// Buffer descriptor control word.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BdCsr(u32);

impl BdCsr {
    pub const STATE_MASK: u32 = 0xe000;
    pub const IS_SETUP: u32 = 0x1000;
    pub const LEN_MASK: u32 = 0x03ff;

    pub const NONE: Self = Self(BdState::None as u32);

    pub const fn new(state: BdState, len: u16) -> Self {
        Self(state as u32 | (len as u32 & Self::LEN_MASK))
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Flags a completed OUT buffer as carrying a SETUP token.
    #[must_use]
    pub const fn with_setup(self) -> Self {
        Self(self.0 | Self::IS_SETUP)
    }

    /// `None` for the reserved encodings 0x2000, 0xc000 and 0xe000.
    pub fn state(self) -> Option<BdState> {
        BdState::from_repr(self.0 & Self::STATE_MASK)
    }

    pub const fn is_setup(self) -> bool {
        self.0 & Self::IS_SETUP != 0
    }

    /// Requested length while ready, transferred length once done.
    pub const fn len(self) -> u16 {
        (self.0 & Self::LEN_MASK) as u16
    }
}

/// Endpoint address, direction in bit 7.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EpAddr(u8);

impl EpAddr {
    pub const fn new(addr: u8) -> Self {
        Self(addr & (ENDPOINT_DIRECTION_MASK | ENDPOINT_NUMBER_MASK))
    }

    pub const fn out(num: u8) -> Self {
        Self::new(num)
    }

    pub const fn r#in(num: u8) -> Self {
        Self::new(num | ENDPOINT_DIRECTION_MASK)
    }

    pub const fn addr(self) -> u8 {
        self.0
    }

    pub const fn number(self) -> u8 {
        self.0 & ENDPOINT_NUMBER_MASK
    }

    pub const fn is_in(self) -> bool {
        self.0 & ENDPOINT_DIRECTION_MASK != 0
    }

    /// Position in the endpoint register array: OUT and IN interleaved.
    pub const fn index(self) -> usize {
        ((self.number() as usize) << 1) | self.is_in() as usize
    }

    /// Byte offset of the EP CSR from the controller base.
    pub const fn csr_offset(self) -> usize {
        1024 + ((self.0 as usize & 0xf) << 6) + ((self.0 as usize & 0x80) >> 2)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BdSlot {
    Bd0 = 0,
    Bd1 = 1,
}

impl BdSlot {
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn other(self) -> Self {
        match self {
            BdSlot::Bd0 => BdSlot::Bd1,
            BdSlot::Bd1 => BdSlot::Bd0,
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct BdRegs {
    pub csr: u32,
    pub ptr: u32,
}

// 32 bytes per endpoint direction.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct EpRegs {
    pub csr: u32,
    _reserved: [u32; 3],
    pub bd: [BdRegs; 2],
}

#[repr(C)]
pub struct UsbRegs {
    pub csr: u32,
    pub ar: u32,
    pub evt: u32,
    _reserved: [u32; 253],
    pub ep: [EpRegs; 32],
}

impl UsbRegs {
    pub const fn zeroed() -> Self {
        const BD: BdRegs = BdRegs { csr: 0, ptr: 0 };
        const EP: EpRegs = EpRegs { csr: 0, _reserved: [0; 3], bd: [BD; 2] };
        Self {
            csr: 0,
            ar: 0,
            evt: 0,
            _reserved: [0; 253],
            ep: [EP; 32],
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_block_sizes() {
        assert_eq!(core::mem::size_of::<BdRegs>(), 8, "BD register pair size.");
        assert_eq!(core::mem::size_of::<EpRegs>(), 32, "Endpoint register block size.");
        assert_eq!(core::mem::size_of::<UsbRegs>(), 2048, "Controller register block size.");
    }

    #[test]
    fn register_offsets() {
        let regs = UsbRegs::zeroed();
        let base = &regs as *const _ as usize;

        assert_offset("CSR", &regs.csr, base, 0x000);
        assert_offset("AR", &regs.ar, base, 0x004);
        assert_offset("EVT", &regs.evt, base, 0x008);
        for addr in [0x00, 0x80, 0x02, 0x82, 0x83, 0x0f, 0x8f] {
            let ep = EpAddr::new(addr);
            let regs_ep = &regs.ep[ep.index()];
            assert_offset("EP CSR", &regs_ep.csr, base, ep.csr_offset());
            assert_offset("BD0 CSR", &regs_ep.bd[0].csr, base, ep.csr_offset() + 16);
            assert_offset("BD0 PTR", &regs_ep.bd[0].ptr, base, ep.csr_offset() + 20);
            assert_offset("BD1 CSR", &regs_ep.bd[1].csr, base, ep.csr_offset() + 24);
            assert_offset("BD1 PTR", &regs_ep.bd[1].ptr, base, ep.csr_offset() + 28);
        }
    }

    #[test]
    fn ep_csr_offsets() {
        assert_eq!(EpAddr::out(0).csr_offset(), 1024);
        assert_eq!(EpAddr::r#in(0).csr_offset(), 1056);
        assert_eq!(EpAddr::r#in(3).csr_offset(), 1024 + 3 * 64 + 32);
    }

    #[test]
    fn ep_csr_halted_bit() {
        let csr = EpCsr::new(EpType::Bulk, EpFlags::BD_DUAL);
        assert_eq!(csr.bits(), 0x14);
        let halted = csr.with_halted(true);
        assert_eq!(halted.bits(), 0x15);
        assert!(halted.is_halted());
        assert_eq!(halted.ep_type(), EpType::Bulk);
        assert!(!halted.with_halted(false).is_halted());

        // bit 0 of an isochronous endpoint is part of its type
        let iso = EpCsr::new(EpType::Isochronous, EpFlags::empty());
        assert!(!iso.is_halted());
        assert_eq!(iso.with_halted(true), iso);
        assert_eq!(iso.ep_type(), EpType::Isochronous);
    }

    #[test]
    fn bd_csr_fields() {
        let csr = BdCsr::new(BdState::DoneOk, 8).with_setup();
        assert_eq!(csr.bits(), 0x9008);
        assert_eq!(csr.state(), Some(BdState::DoneOk));
        assert!(csr.is_setup());
        assert_eq!(csr.len(), 8);

        assert_eq!(BdCsr::new(BdState::RdyData, 0x7ff).len(), 0x3ff);
        assert_eq!(BdCsr::from_bits(0xc000).state(), None);
        assert_eq!(BdCsr::from_bits(0xa040).state(), Some(BdState::DoneErr));
    }

    fn assert_offset<T>(name: &str, field: &T, base: usize, offset: usize) {
        let ptr = field as *const _ as usize;
        assert_eq!(ptr - base, offset, "{} register offset.", name);
    }
}
