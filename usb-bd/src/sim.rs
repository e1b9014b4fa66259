//! RAM model of the controller, driven from the host side of the bus.
//!
//! Plays the part of the controller's BD engine: a host token picks the
//! BD the endpoint's addressing mode selects, moves bytes between packet
//! memory and the bus, then completes the BD, advances `BD_IDX` and
//! flips `DT` exactly as the silicon does.

use enumset::EnumSet;
use heapless::Vec;

use crate::regs::{BdCsr, BdSlot, BdState, EpAddr, EpCsr, EpFlags, EpType, UsbCsr, UsbRegs};
use crate::ring::DataToggle;
use crate::{DeviceEvent, UsbCore, MAX_PACKET_SIZE, PKT_MEM_LEN};

// How many NAKed tokens the host tolerates before giving up.
const NAK_LIMIT: usize = 15;

const MPS: usize = MAX_PACKET_SIZE as usize;

/// Device answer to a host token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Handshake<T> {
    Ack(T),
    Nak,
    Stall,
    /// Corrupted packet, or no answer at all.
    Error,
}

/// A data packet the device sent for an IN token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InPacket {
    pub data: Vec<u8, MPS>,
    pub toggle: DataToggle,
}

/// Result of a host-driven IN transfer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostRead<const N: usize> {
    pub data: Vec<u8, N>,
    pub packets: usize,
    /// The transfer ended on a zero-length packet.
    pub zlp: bool,
}

pub struct SimCore {
    regs: UsbRegs,
    tx: [u8; PKT_MEM_LEN],
    rx: [u8; PKT_MEM_LEN],
    events: EnumSet<DeviceEvent>,
    corrupt: Option<EpAddr>,
}

impl Default for SimCore {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCore {
    pub fn new() -> Self {
        Self {
            regs: UsbRegs::zeroed(),
            tx: [0; PKT_MEM_LEN],
            rx: [0; PKT_MEM_LEN],
            events: EnumSet::new(),
            corrupt: None,
        }
    }

    pub fn pullup(&self) -> bool {
        self.regs.csr & UsbCsr::PU_ENA.bits() != 0
    }

    pub fn bd_state(&self, ep: EpAddr, slot: BdSlot) -> Option<BdState> {
        self.bd_csr(ep, slot).state()
    }

    /// The next packet moved on `ep` fails its CRC.
    pub fn corrupt_next(&mut self, ep: EpAddr) {
        self.corrupt = Some(ep);
    }

    pub fn bus_reset(&mut self) {
        self.regs.csr &= !UsbCsr::ADDR.bits();
        self.events.insert(DeviceEvent::BusReset);
    }

    pub fn start_of_frame(&mut self) {
        self.events.insert(DeviceEvent::StartOfFrame);
    }

    fn take_corruption(&mut self, ep: EpAddr) -> bool {
        if self.corrupt == Some(ep) {
            self.corrupt = None;
            true
        } else {
            false
        }
    }

    /// An endpoint the host can talk to: attached and configured.
    fn endpoint(&self, ep: EpAddr) -> Option<EpCsr> {
        let csr = self.ep_csr(ep);
        (self.pullup() && csr.ep_type() != EpType::None).then(|| csr)
    }

    fn service_slot(csr: EpCsr) -> BdSlot {
        let flags = csr.flags();
        if flags.contains(EpFlags::BD_DUAL | EpFlags::BD_IDX) {
            BdSlot::Bd1
        } else {
            BdSlot::Bd0
        }
    }

    fn complete(&mut self, ep: EpAddr, slot: BdSlot, bd: BdCsr) {
        self.set_bd_csr(ep, slot, bd);
        let mut csr = self.ep_csr(ep);
        if bd.state() == Some(BdState::DoneOk) {
            let flags = csr.flags();
            if !bd.is_setup() {
                csr = csr.with_flags(EpFlags::DT, !flags.contains(EpFlags::DT));
            }
            if flags.contains(EpFlags::BD_DUAL) {
                csr = csr.with_flags(EpFlags::BD_IDX, !flags.contains(EpFlags::BD_IDX));
            }
        }
        self.set_ep_csr(ep, csr);
        self.events.insert(DeviceEvent::Transfer);
    }

    /// One IN token on endpoint `num`.
    pub fn host_in(&mut self, num: u8) -> Handshake<InPacket> {
        let ep = EpAddr::r#in(num);
        let csr = match self.endpoint(ep) {
            Some(csr) => csr,
            None => return Handshake::Error,
        };
        if csr.is_halted() {
            return Handshake::Stall;
        }
        let slot = Self::service_slot(csr);
        let bd = self.bd_csr(ep, slot);
        match bd.state() {
            Some(BdState::RdyStall) => Handshake::Stall,
            Some(BdState::RdyData) => {
                if self.take_corruption(ep) {
                    self.complete(ep, slot, BdCsr::new(BdState::DoneErr, 0));
                    return Handshake::Error;
                }
                let ptr = self.bd_ptr(ep, slot) as usize;
                let len = (bd.len() as usize).min(MPS);
                let data = match self.tx.get(ptr..ptr + len).map(Vec::from_slice) {
                    Some(Ok(data)) => data,
                    _ => return Handshake::Error,
                };
                let toggle = DataToggle::from_csr(csr);
                self.complete(ep, slot, BdCsr::new(BdState::DoneOk, len as u16));
                Handshake::Ack(InPacket { data, toggle })
            }
            _ => Handshake::Nak,
        }
    }

    /// One OUT token plus data packet on endpoint `num`.
    pub fn host_out(&mut self, num: u8, data: &[u8], toggle: DataToggle) -> Handshake<()> {
        let ep = EpAddr::out(num);
        let csr = match self.endpoint(ep) {
            Some(csr) => csr,
            None => return Handshake::Error,
        };
        if csr.is_halted() {
            return Handshake::Stall;
        }
        let slot = Self::service_slot(csr);
        let bd = self.bd_csr(ep, slot);
        match bd.state() {
            Some(BdState::RdyStall) => Handshake::Stall,
            Some(BdState::RdyData) => {
                if self.take_corruption(ep) {
                    self.complete(ep, slot, BdCsr::new(BdState::DoneErr, 0));
                    return Handshake::Error;
                }
                if toggle != DataToggle::from_csr(csr) {
                    // retransmission of a packet already taken: ACK, drop
                    return Handshake::Ack(());
                }
                let ptr = self.bd_ptr(ep, slot) as usize;
                if data.len() > bd.len() as usize || ptr + data.len() > PKT_MEM_LEN {
                    // babble
                    self.complete(ep, slot, BdCsr::new(BdState::DoneErr, 0));
                    return Handshake::Error;
                }
                self.rx[ptr..ptr + data.len()].copy_from_slice(data);
                self.complete(ep, slot, BdCsr::new(BdState::DoneOk, data.len() as u16));
                Handshake::Ack(())
            }
            _ => Handshake::Nak,
        }
    }

    /// SETUP token plus its 8-byte DATA0 packet. Goes through a halt or a
    /// STALL, but is NAKed while the SETUP slot is not armed.
    pub fn host_setup(&mut self, num: u8, packet: [u8; 8]) -> Handshake<()> {
        let ep = EpAddr::out(num);
        let csr = match self.endpoint(ep) {
            Some(csr) => csr,
            None => return Handshake::Error,
        };
        if csr.ep_type() != EpType::Control {
            return Handshake::Error;
        }
        let slot = if csr.flags().contains(EpFlags::BD_CTRL) {
            BdSlot::Bd1
        } else {
            Self::service_slot(csr)
        };
        if self.bd_state(ep, slot) != Some(BdState::RdyData) {
            return Handshake::Nak;
        }
        let ptr = self.bd_ptr(ep, slot) as usize;
        if ptr + packet.len() > PKT_MEM_LEN {
            return Handshake::Error;
        }
        self.rx[ptr..ptr + packet.len()].copy_from_slice(&packet);
        self.complete(ep, slot, BdCsr::new(BdState::DoneOk, packet.len() as u16).with_setup());
        Handshake::Ack(())
    }

    /// Issue IN tokens until a short packet ends the transfer or
    /// `requested` bytes arrived. `service` runs firmware before each
    /// token. A packet repeating the previous toggle is dropped, as a
    /// host does after a lost ACK.
    pub fn read_in<const N: usize>(
        &mut self,
        num: u8,
        mps: usize,
        requested: usize,
        mut service: impl FnMut(&mut Self),
    ) -> Result<HostRead<N>, Handshake<()>> {
        let mut read = HostRead::default();
        let mut last = None;
        let mut naks = 0;
        while naks < NAK_LIMIT {
            service(self);
            match self.host_in(num) {
                Handshake::Ack(packet) => {
                    if last == Some(packet.toggle) {
                        continue;
                    }
                    last = Some(packet.toggle);
                    read.packets += 1;
                    read.data.extend_from_slice(&packet.data).map_err(|_| Handshake::Error)?;
                    if packet.data.len() < mps {
                        read.zlp = packet.data.is_empty();
                        return Ok(read);
                    }
                    if read.data.len() >= requested {
                        return Ok(read);
                    }
                }
                Handshake::Nak => naks += 1,
                Handshake::Stall => return Err(Handshake::Stall),
                Handshake::Error => return Err(Handshake::Error),
            }
        }
        Err(Handshake::Nak)
    }

    /// Send `data` as OUT packets starting at `toggle`, followed by a
    /// zero-length packet when `zlp` is set. Returns the toggle of the
    /// next packet.
    pub fn write_out(
        &mut self,
        num: u8,
        mps: usize,
        data: &[u8],
        zlp: bool,
        mut toggle: DataToggle,
        mut service: impl FnMut(&mut Self),
    ) -> Result<DataToggle, Handshake<()>> {
        let chunks = data.chunks(mps).chain(zlp.then(|| &data[data.len()..]));
        for chunk in chunks {
            let mut naks = 0;
            loop {
                service(self);
                match self.host_out(num, chunk, toggle) {
                    Handshake::Ack(()) => break,
                    Handshake::Nak if naks < NAK_LIMIT => naks += 1,
                    other => return Err(other),
                }
            }
            toggle = toggle.flip();
        }
        Ok(toggle)
    }
}

impl UsbCore for SimCore {
    fn ep_csr(&self, ep: EpAddr) -> EpCsr {
        EpCsr::from_bits(self.regs.ep[ep.index()].csr)
    }

    fn set_ep_csr(&mut self, ep: EpAddr, csr: EpCsr) {
        self.regs.ep[ep.index()].csr = csr.bits();
    }

    fn bd_csr(&self, ep: EpAddr, slot: BdSlot) -> BdCsr {
        BdCsr::from_bits(self.regs.ep[ep.index()].bd[slot.index()].csr)
    }

    fn set_bd_csr(&mut self, ep: EpAddr, slot: BdSlot, csr: BdCsr) {
        self.regs.ep[ep.index()].bd[slot.index()].csr = csr.bits();
    }

    fn bd_ptr(&self, ep: EpAddr, slot: BdSlot) -> u16 {
        self.regs.ep[ep.index()].bd[slot.index()].ptr as u16
    }

    fn set_bd_ptr(&mut self, ep: EpAddr, slot: BdSlot, ptr: u16) {
        self.regs.ep[ep.index()].bd[slot.index()].ptr = ptr as u32;
    }

    fn write_packet(&mut self, ptr: u16, data: &[u8]) {
        let ptr = ptr as usize;
        if let Some(dst) = self.tx.get_mut(ptr..ptr + data.len()) {
            dst.copy_from_slice(data);
        }
    }

    fn read_packet(&self, ptr: u16, buf: &mut [u8]) {
        let ptr = ptr as usize;
        if let Some(src) = self.rx.get(ptr..ptr + buf.len()) {
            buf.copy_from_slice(src);
        }
    }

    fn set_pullup(&mut self, enabled: bool) {
        if enabled {
            self.regs.csr |= UsbCsr::PU_ENA.bits();
        } else {
            self.regs.csr &= !UsbCsr::PU_ENA.bits();
        }
    }

    fn take_events(&mut self) -> EnumSet<DeviceEvent> {
        core::mem::take(&mut self.events)
    }
}
