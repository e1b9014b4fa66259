//! `UsbCore` over the memory-mapped controller.
//!
//! Packet memory is only reachable as 32-bit little-endian words, so
//! packets are packed and unpacked a word at a time.

use core::ptr::{addr_of, addr_of_mut, read_volatile, write_volatile};

use enumset::EnumSet;

use crate::regs::{BdCsr, BdSlot, EpAddr, EpCsr, UsbAr, UsbCsr, UsbRegs};
use crate::{DeviceEvent, UsbCore, PKT_MEM_LEN};

const PKT_MEM_WORDS: usize = PKT_MEM_LEN / 4;

pub struct Mmio {
    regs: *mut UsbRegs,
    tx: *mut u32,
    rx: *const u32,
}

// The controller is only ever driven from the one firmware thread.
unsafe impl Send for Mmio {}

impl Mmio {
    /// # Safety
    ///
    /// `regs` must point at the controller register block, `tx` and `rx`
    /// at its `PKT_MEM_LEN` byte packet buffers. All three must stay valid
    /// and must not be accessed by anything else while this `Mmio` lives.
    pub const unsafe fn new(regs: *mut UsbRegs, tx: *mut u32, rx: *const u32) -> Self {
        Self { regs, tx, rx }
    }

    fn csr(&self) -> UsbCsr {
        UsbCsr::from_bits_truncate(unsafe { read_volatile(addr_of!((*self.regs).csr)) })
    }

    fn set_csr(&mut self, csr: UsbCsr) {
        unsafe { write_volatile(addr_of_mut!((*self.regs).csr), csr.bits()) }
    }

    fn ack(&mut self, ar: UsbAr) {
        unsafe { write_volatile(addr_of_mut!((*self.regs).ar), ar.bits()) }
    }
}

impl UsbCore for Mmio {
    fn ep_csr(&self, ep: EpAddr) -> EpCsr {
        EpCsr::from_bits(unsafe { read_volatile(addr_of!((*self.regs).ep[ep.index()].csr)) })
    }

    fn set_ep_csr(&mut self, ep: EpAddr, csr: EpCsr) {
        unsafe { write_volatile(addr_of_mut!((*self.regs).ep[ep.index()].csr), csr.bits()) }
    }

    fn bd_csr(&self, ep: EpAddr, slot: BdSlot) -> BdCsr {
        BdCsr::from_bits(unsafe { read_volatile(addr_of!((*self.regs).ep[ep.index()].bd[slot.index()].csr)) })
    }

    fn set_bd_csr(&mut self, ep: EpAddr, slot: BdSlot, csr: BdCsr) {
        unsafe { write_volatile(addr_of_mut!((*self.regs).ep[ep.index()].bd[slot.index()].csr), csr.bits()) }
    }

    fn bd_ptr(&self, ep: EpAddr, slot: BdSlot) -> u16 {
        let ptr = unsafe { read_volatile(addr_of!((*self.regs).ep[ep.index()].bd[slot.index()].ptr)) };
        ptr as u16
    }

    fn set_bd_ptr(&mut self, ep: EpAddr, slot: BdSlot, ptr: u16) {
        unsafe { write_volatile(addr_of_mut!((*self.regs).ep[ep.index()].bd[slot.index()].ptr), ptr as u32) }
    }

    fn write_packet(&mut self, ptr: u16, data: &[u8]) {
        let first = ptr as usize / 4;
        for (i, chunk) in data.chunks(4).enumerate() {
            if first + i >= PKT_MEM_WORDS {
                warn!("TX packet memory overrun at {=u16}", ptr);
                break;
            }
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            unsafe { write_volatile(self.tx.add(first + i), u32::from_le_bytes(word)) }
        }
    }

    fn read_packet(&self, ptr: u16, buf: &mut [u8]) {
        let first = ptr as usize / 4;
        for (i, chunk) in buf.chunks_mut(4).enumerate() {
            if first + i >= PKT_MEM_WORDS {
                warn!("RX packet memory overrun at {=u16}", ptr);
                break;
            }
            let word = unsafe { read_volatile(self.rx.add(first + i)) }.to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }

    fn set_pullup(&mut self, enabled: bool) {
        // only the pull-up and address bits are writable
        let mut csr = self.csr() & UsbCsr::ADDR;
        csr.set(UsbCsr::PU_ENA, enabled);
        self.set_csr(csr);
        debug!("USB pull-up {=bool}", enabled);
    }

    fn take_events(&mut self) -> EnumSet<DeviceEvent> {
        let csr = self.csr();
        let mut events = EnumSet::new();
        let mut ack = UsbAr::empty();

        if csr.contains(UsbCsr::BUS_RST_PENDING) {
            events.insert(DeviceEvent::BusReset);
            ack |= UsbAr::BUS_RST_CLEAR;
        }
        if csr.contains(UsbCsr::SOF_PENDING) {
            events.insert(DeviceEvent::StartOfFrame);
            ack |= UsbAr::SOF_CLEAR;
        }
        if csr.contains(UsbCsr::EVT_PENDING) {
            events.insert(DeviceEvent::Transfer);
            // reading EVT pops the transfer event
            let _ = unsafe { read_volatile(addr_of!((*self.regs).evt)) };
        }
        if !ack.is_empty() {
            self.ack(ack);
        }
        events
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::regs::{BdState, EpFlags, EpType};

    struct Ram {
        regs: UsbRegs,
        tx: [u32; PKT_MEM_WORDS],
        rx: [u32; PKT_MEM_WORDS],
    }

    impl Ram {
        fn new() -> Self {
            Self { regs: UsbRegs::zeroed(), tx: [0; PKT_MEM_WORDS], rx: [0; PKT_MEM_WORDS] }
        }

        fn mmio(&mut self) -> Mmio {
            unsafe { Mmio::new(&mut self.regs, self.tx.as_mut_ptr(), self.rx.as_ptr()) }
        }
    }

    #[test]
    fn endpoint_registers_land_at_their_offsets() {
        let mut ram = Ram::new();
        let mut mmio = ram.mmio();
        let ep = EpAddr::r#in(2);
        mmio.set_ep_csr(ep, EpCsr::new(EpType::Bulk, EpFlags::BD_DUAL | EpFlags::DT));
        mmio.set_bd_csr(ep, BdSlot::Bd1, BdCsr::new(BdState::RdyData, 64));
        mmio.set_bd_ptr(ep, BdSlot::Bd1, 0x40);
        assert_eq!(mmio.bd_ptr(ep, BdSlot::Bd1), 0x40);
        assert_eq!(mmio.bd_csr(ep, BdSlot::Bd1).state(), Some(BdState::RdyData));

        assert_eq!(ram.regs.ep[5].csr, 0x94);
        assert_eq!(ram.regs.ep[5].bd[1].csr, 0x4040);
        assert_eq!(ram.regs.ep[5].bd[1].ptr, 0x40);
        assert_eq!(ram.regs.ep[4].csr, 0);
    }

    #[test]
    fn packets_are_packed_little_endian() {
        let mut ram = Ram::new();
        let mut mmio = ram.mmio();
        mmio.write_packet(8, &[1, 2, 3, 4, 5]);
        assert_eq!(ram.tx[2], 0x0403_0201);
        assert_eq!(ram.tx[3], 0x0000_0005);
        assert_eq!(ram.tx[1], 0);

        ram.rx[16] = 0x4433_2211;
        ram.rx[17] = 0x0000_0055;
        let mmio = ram.mmio();
        let mut buf = [0u8; 5];
        mmio.read_packet(64, &mut buf);
        assert_eq!(buf, [0x11, 0x22, 0x33, 0x44, 0x55]);
    }

    #[test]
    fn events_are_acknowledged() {
        let mut ram = Ram::new();
        ram.regs.csr = (UsbCsr::BUS_RST_PENDING | UsbCsr::SOF_PENDING | UsbCsr::EVT_PENDING).bits();
        let mut mmio = ram.mmio();
        let events = mmio.take_events();
        assert!(events.contains(DeviceEvent::BusReset));
        assert!(events.contains(DeviceEvent::StartOfFrame));
        assert!(events.contains(DeviceEvent::Transfer));
        assert_eq!(ram.regs.ar, (UsbAr::BUS_RST_CLEAR | UsbAr::SOF_CLEAR).bits());
    }

    #[test]
    fn pullup_keeps_address() {
        let mut ram = Ram::new();
        ram.regs.csr = 0x2a | UsbCsr::SOF_PENDING.bits();
        let mut mmio = ram.mmio();
        mmio.set_pullup(true);
        assert_eq!(ram.regs.csr, 0x802a);
        let mut mmio = ram.mmio();
        mmio.set_pullup(false);
        assert_eq!(ram.regs.csr, 0x2a);
    }
}
