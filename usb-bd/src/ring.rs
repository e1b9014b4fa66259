//! The two buffer descriptors of one endpoint direction.
//!
//! Firmware arms a BD (`RDY_DATA`), the controller fills or drains it and
//! hands it back (`DONE_OK` / `DONE_ERR`), firmware collects it and the BD
//! goes back to `NONE` until re-armed. The slot to arm next and the data
//! toggle are tracked separately: the slot follows the controller's
//! `BD_IDX`, the toggle mirrors its `DT` bit and only moves on `DONE_OK`.

use crate::error::XferError;
use crate::regs::{BdCsr, BdSlot, BdState, EpAddr, EpCsr, EpFlags, EpType};
use crate::{UsbCore, MAX_PACKET_SIZE, PKT_MEM_LEN};

/// Length armed into the SETUP slot of a control OUT endpoint.
pub const SETUP_LEN: u16 = 8;

/// How the controller picks a BD for the next packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BdMode {
    /// BD0 only.
    Single,
    /// BD0 and BD1 alternately, starting from BD0.
    Dual,
    /// Control OUT: SETUP packets land in BD1, data packets in BD0.
    Control,
}

impl BdMode {
    fn flags(self) -> EpFlags {
        match self {
            BdMode::Single => EpFlags::empty(),
            BdMode::Dual => EpFlags::BD_DUAL,
            BdMode::Control => EpFlags::BD_CTRL,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataToggle {
    Data0,
    Data1,
}

impl DataToggle {
    #[must_use]
    pub fn flip(self) -> Self {
        match self {
            DataToggle::Data0 => DataToggle::Data1,
            DataToggle::Data1 => DataToggle::Data0,
        }
    }

    pub fn from_csr(csr: EpCsr) -> Self {
        if csr.flags().contains(EpFlags::DT) {
            DataToggle::Data1
        } else {
            DataToggle::Data0
        }
    }
}

/// A BD the controller handed back.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Completion {
    pub slot: BdSlot,
    /// Packet memory offset of the payload.
    pub ptr: u16,
    /// Bytes actually transferred.
    pub len: u16,
    pub ok: bool,
    pub setup: bool,
}

pub struct BdRing {
    ep: EpAddr,
    ty: EpType,
    mode: BdMode,
    ptr: [u16; 2],
    mps: u16,
    toggle: DataToggle,
    // Dual mode only: next slot to arm, next slot to complete.
    head: BdSlot,
    tail: BdSlot,
    /// Armed length of every controller-owned slot.
    armed: [Option<u16>; 2],
    stalled: bool,
    halted: bool,
}

impl BdRing {
    /// `buf` is the packet memory offset of BD0, BD1 sits `mps` bytes
    /// after it.
    pub const fn new(ep: EpAddr, ty: EpType, mode: BdMode, buf: u16, mps: u16) -> Self {
        assert!(mps >= SETUP_LEN && mps <= MAX_PACKET_SIZE && mps % 4 == 0);
        assert!(buf % 4 == 0 && buf as usize + 2 * mps as usize <= PKT_MEM_LEN);
        Self {
            ep,
            ty,
            mode,
            ptr: [buf, buf + mps],
            mps,
            toggle: DataToggle::Data0,
            head: BdSlot::Bd0,
            tail: BdSlot::Bd0,
            armed: [None; 2],
            stalled: false,
            halted: false,
        }
    }

    pub fn ep(&self) -> EpAddr {
        self.ep
    }

    pub fn mode(&self) -> BdMode {
        self.mode
    }

    pub fn mps(&self) -> u16 {
        self.mps
    }

    /// Toggle of the next data packet.
    pub fn toggle(&self) -> DataToggle {
        self.toggle
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// No BD is owned by the controller.
    pub fn is_idle(&self) -> bool {
        self.armed.iter().all(Option::is_none)
    }

    pub fn setup_armed(&self) -> bool {
        self.mode == BdMode::Control && self.armed[BdSlot::Bd1.index()].is_some()
    }

    /// Program the endpoint: type, addressing mode, BD pointers, DATA0,
    /// nothing armed and not halted.
    pub fn configure<H: UsbCore>(&mut self, hw: &mut H) {
        for slot in [BdSlot::Bd0, BdSlot::Bd1] {
            hw.set_bd_csr(self.ep, slot, BdCsr::NONE);
            hw.set_bd_ptr(self.ep, slot, self.ptr[slot.index()]);
        }
        self.halted = false;
        self.reset(hw, DataToggle::Data0);
        debug!("EP {=u8:#x} configured as {}, {=u16} bytes", self.ep.addr(), self.ty, self.mps);
    }

    /// Take back every BD, clear a STALL and restart the slot sequence
    /// at BD0 with the given toggle. Any in-flight packet is lost.
    pub fn reset<H: UsbCore>(&mut self, hw: &mut H, toggle: DataToggle) {
        for slot in [BdSlot::Bd0, BdSlot::Bd1] {
            hw.set_bd_csr(self.ep, slot, BdCsr::NONE);
        }
        self.armed = [None; 2];
        self.head = BdSlot::Bd0;
        self.tail = BdSlot::Bd0;
        self.stalled = false;
        self.toggle = toggle;
        hw.set_ep_csr(self.ep, self.csr());
    }

    fn csr(&self) -> EpCsr {
        EpCsr::new(self.ty, self.mode.flags())
            .with_flags(EpFlags::DT, self.toggle == DataToggle::Data1)
            .with_halted(self.halted)
    }

    fn data_slot(&self) -> BdSlot {
        match self.mode {
            BdMode::Single | BdMode::Control => BdSlot::Bd0,
            BdMode::Dual => self.head,
        }
    }

    /// A data slot is free to arm.
    pub fn can_arm(&self) -> bool {
        !self.stalled && self.armed[self.data_slot().index()].is_none()
    }

    fn take_slot(&mut self) -> Result<BdSlot, XferError> {
        if self.stalled {
            return Err(XferError::Stalled);
        }
        let slot = self.data_slot();
        if self.armed[slot.index()].is_some() {
            return Err(XferError::Busy);
        }
        if self.mode == BdMode::Dual {
            self.head = slot.other();
        }
        Ok(slot)
    }

    fn arm<H: UsbCore>(&mut self, hw: &mut H, slot: BdSlot, len: u16) {
        self.armed[slot.index()] = Some(len);
        hw.set_bd_csr(self.ep, slot, BdCsr::new(BdState::RdyData, len));
        trace!("EP {=u8:#x} BD{=usize} armed, {=u16} bytes", self.ep.addr(), slot.index(), len);
    }

    /// Queue one IN packet, possibly empty.
    pub fn arm_tx<H: UsbCore>(&mut self, hw: &mut H, data: &[u8]) -> Result<BdSlot, XferError> {
        if data.len() > self.mps as usize {
            return Err(XferError::Length);
        }
        let slot = self.take_slot()?;
        hw.write_packet(self.ptr[slot.index()], data);
        self.arm(hw, slot, data.len() as u16);
        Ok(slot)
    }

    /// Offer one max-packet-size buffer to the host.
    pub fn arm_rx<H: UsbCore>(&mut self, hw: &mut H) -> Result<BdSlot, XferError> {
        let slot = self.take_slot()?;
        self.arm(hw, slot, self.mps);
        Ok(slot)
    }

    /// Arm the SETUP slot. Unaffected by a STALL on the data slot.
    pub fn arm_setup<H: UsbCore>(&mut self, hw: &mut H) -> Result<(), XferError> {
        if self.mode != BdMode::Control {
            return Err(XferError::BadState);
        }
        if self.armed[BdSlot::Bd1.index()].is_some() {
            return Err(XferError::Busy);
        }
        self.arm(hw, BdSlot::Bd1, SETUP_LEN);
        Ok(())
    }

    /// Collect the next BD the controller is done with, in arming order.
    /// A pending SETUP is collected before data.
    pub fn poll<H: UsbCore>(&mut self, hw: &mut H) -> Result<Option<Completion>, XferError> {
        match self.mode {
            BdMode::Single => self.collect(hw, BdSlot::Bd0),
            BdMode::Dual => self.collect(hw, self.tail),
            BdMode::Control => match self.collect(hw, BdSlot::Bd1)? {
                Some(setup) => Ok(Some(setup)),
                None => self.collect(hw, BdSlot::Bd0),
            },
        }
    }

    fn collect<H: UsbCore>(&mut self, hw: &mut H, slot: BdSlot) -> Result<Option<Completion>, XferError> {
        let csr = hw.bd_csr(self.ep, slot);
        let state = csr.state().ok_or(XferError::BadState)?;
        if !state.is_done() {
            return Ok(None);
        }
        let armed = self.armed[slot.index()].ok_or(XferError::BadState)?;
        let done = Completion {
            slot,
            ptr: self.ptr[slot.index()],
            len: csr.len(),
            ok: state == BdState::DoneOk,
            setup: csr.is_setup(),
        };

        if !done.ok && !self.ep.is_in() {
            // the host retransmits into the same buffer
            warn!("EP {=u8:#x} BD{=usize} receive error, re-armed", self.ep.addr(), slot.index());
            self.arm(hw, slot, armed);
            return Ok(None);
        }

        hw.set_bd_csr(self.ep, slot, BdCsr::NONE);
        self.armed[slot.index()] = None;
        if self.mode == BdMode::Dual {
            self.tail = slot.other();
        }
        if done.ok && !done.setup {
            self.toggle = self.toggle.flip();
        }
        if done.ok {
            trace!("EP {=u8:#x} BD{=usize} done, {=u16} bytes", self.ep.addr(), slot.index(), done.len);
        } else {
            warn!("EP {=u8:#x} BD{=usize} transmit error", self.ep.addr(), slot.index());
        }
        Ok(Some(done))
    }

    /// Answer every data token with STALL until the next `reset`.
    /// The SETUP slot of a control endpoint stays armed.
    pub fn stall<H: UsbCore>(&mut self, hw: &mut H) {
        let slots: &[BdSlot] = match self.mode {
            BdMode::Single | BdMode::Control => &[BdSlot::Bd0],
            BdMode::Dual => &[BdSlot::Bd0, BdSlot::Bd1],
        };
        for &slot in slots {
            hw.set_bd_csr(self.ep, slot, BdCsr::new(BdState::RdyStall, 0));
            self.armed[slot.index()] = None;
        }
        self.stalled = true;
        debug!("EP {=u8:#x} stalled", self.ep.addr());
    }

    /// Set or clear the endpoint HALTED feature. Clearing it restarts
    /// the data toggle at DATA0.
    pub fn set_halt<H: UsbCore>(&mut self, hw: &mut H, halted: bool) {
        self.halted = halted;
        let mut csr = hw.ep_csr(self.ep).with_halted(halted);
        if !halted {
            self.toggle = DataToggle::Data0;
            csr = csr.with_flags(EpFlags::DT, false);
        }
        hw.set_ep_csr(self.ep, csr);
        debug!("EP {=u8:#x} halted {=bool}", self.ep.addr(), halted);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{Handshake, SimCore};

    fn bulk_in() -> BdRing {
        BdRing::new(EpAddr::r#in(2), EpType::Bulk, BdMode::Dual, 0, 64)
    }

    fn bulk_out() -> BdRing {
        BdRing::new(EpAddr::out(2), EpType::Bulk, BdMode::Dual, 128, 64)
    }

    fn sim() -> SimCore {
        let mut sim = SimCore::new();
        sim.set_pullup(true);
        sim
    }

    #[test]
    fn configure_programs_endpoint() {
        let mut sim = sim();
        let mut ring = bulk_in();
        ring.configure(&mut sim);
        let csr = sim.ep_csr(EpAddr::r#in(2));
        assert_eq!(csr, EpCsr::new(EpType::Bulk, EpFlags::BD_DUAL));
        assert_eq!(sim.bd_ptr(EpAddr::r#in(2), BdSlot::Bd0), 0);
        assert_eq!(sim.bd_ptr(EpAddr::r#in(2), BdSlot::Bd1), 64);
        assert!(ring.is_idle());
    }

    #[test]
    fn done_is_never_skipped() {
        let mut sim = sim();
        let mut ring = bulk_in();
        ring.configure(&mut sim);
        ring.arm_tx(&mut sim, &[1, 2, 3]).unwrap();
        assert_eq!(sim.bd_state(EpAddr::r#in(2), BdSlot::Bd0), Some(BdState::RdyData));

        assert!(matches!(sim.host_in(2), Handshake::Ack(_)));
        assert_eq!(sim.bd_state(EpAddr::r#in(2), BdSlot::Bd0), Some(BdState::DoneOk));
        // nothing re-arms behind firmware's back
        assert_eq!(sim.host_in(2), Handshake::Nak);
        assert_eq!(sim.bd_state(EpAddr::r#in(2), BdSlot::Bd0), Some(BdState::DoneOk));

        let done = ring.poll(&mut sim).unwrap().unwrap();
        assert_eq!(done, Completion { slot: BdSlot::Bd0, ptr: 0, len: 3, ok: true, setup: false });
        assert_eq!(sim.bd_state(EpAddr::r#in(2), BdSlot::Bd0), Some(BdState::None));
        assert_eq!(ring.poll(&mut sim), Ok(None));
    }

    #[test]
    fn dual_slots_alternate_in_order() {
        let mut sim = sim();
        let mut ring = bulk_in();
        ring.configure(&mut sim);
        assert_eq!(ring.arm_tx(&mut sim, &[0xa; 64]), Ok(BdSlot::Bd0));
        assert_eq!(ring.arm_tx(&mut sim, &[0xb; 10]), Ok(BdSlot::Bd1));
        assert_eq!(ring.arm_tx(&mut sim, &[0xc]), Err(XferError::Busy));
        assert!(!ring.can_arm());

        let first = match sim.host_in(2) {
            Handshake::Ack(p) => p,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(first.data.len(), 64);
        assert_eq!(first.toggle, DataToggle::Data0);
        assert_eq!(ring.poll(&mut sim).unwrap().map(|c| c.slot), Some(BdSlot::Bd0));

        // refill BD0 while BD1 is still owned by the controller
        assert_eq!(ring.arm_tx(&mut sim, &[0xc; 4]), Ok(BdSlot::Bd0));

        let second = match sim.host_in(2) {
            Handshake::Ack(p) => p,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(&second.data[..], &[0xb; 10]);
        assert_eq!(second.toggle, DataToggle::Data1);
        assert_eq!(ring.poll(&mut sim).unwrap().map(|c| c.slot), Some(BdSlot::Bd1));

        let third = match sim.host_in(2) {
            Handshake::Ack(p) => p,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(&third.data[..], &[0xc; 4]);
        assert_eq!(third.toggle, DataToggle::Data0);
        assert!(ring.poll(&mut sim).unwrap().is_some());
        assert!(ring.is_idle());
    }

    #[test]
    fn toggle_mirrors_controller() {
        let mut sim = sim();
        let mut ring = bulk_in();
        ring.configure(&mut sim);
        for n in 0..5u8 {
            ring.arm_tx(&mut sim, &[n]).unwrap();
            assert!(matches!(sim.host_in(2), Handshake::Ack(_)));
            ring.poll(&mut sim).unwrap();
            assert_eq!(ring.toggle(), DataToggle::from_csr(sim.ep_csr(EpAddr::r#in(2))));
        }
        assert_eq!(ring.toggle(), DataToggle::Data1);
    }

    #[test]
    fn out_error_rearms_same_slot() {
        let mut sim = sim();
        let mut ring = bulk_out();
        ring.configure(&mut sim);
        ring.arm_rx(&mut sim).unwrap();

        sim.corrupt_next(EpAddr::out(2));
        assert_eq!(sim.host_out(2, &[1, 2, 3], DataToggle::Data0), Handshake::Error);
        assert_eq!(sim.bd_state(EpAddr::out(2), BdSlot::Bd0), Some(BdState::DoneErr));
        assert_eq!(ring.poll(&mut sim), Ok(None));
        assert_eq!(sim.bd_state(EpAddr::out(2), BdSlot::Bd0), Some(BdState::RdyData));

        // retransmission lands in the same buffer with the same toggle
        assert_eq!(sim.host_out(2, &[1, 2, 3], DataToggle::Data0), Handshake::Ack(()));
        let done = ring.poll(&mut sim).unwrap().unwrap();
        assert_eq!((done.slot, done.len, done.ok), (BdSlot::Bd0, 3, true));
        assert_eq!(ring.toggle(), DataToggle::Data1);
    }

    #[test]
    fn in_error_is_surfaced() {
        let mut sim = sim();
        let mut ring = bulk_in();
        ring.configure(&mut sim);
        ring.arm_tx(&mut sim, &[9; 8]).unwrap();
        sim.corrupt_next(EpAddr::r#in(2));
        assert_eq!(sim.host_in(2), Handshake::Error);
        let done = ring.poll(&mut sim).unwrap().unwrap();
        assert!(!done.ok);
        assert_eq!(ring.toggle(), DataToggle::Data0);
    }

    #[test]
    fn stall_until_reset() {
        let mut sim = sim();
        let mut ring = bulk_in();
        ring.configure(&mut sim);
        ring.arm_tx(&mut sim, &[1]).unwrap();
        ring.stall(&mut sim);
        assert_eq!(sim.host_in(2), Handshake::Stall);
        assert_eq!(sim.host_in(2), Handshake::Stall);
        assert_eq!(ring.arm_tx(&mut sim, &[1]), Err(XferError::Stalled));

        ring.reset(&mut sim, DataToggle::Data0);
        assert_eq!(sim.host_in(2), Handshake::Nak);
        assert!(ring.arm_tx(&mut sim, &[1]).is_ok());
    }

    #[test]
    fn halt_and_clear_resets_toggle() {
        let mut sim = sim();
        let mut ring = bulk_out();
        ring.configure(&mut sim);
        ring.arm_rx(&mut sim).unwrap();
        assert_eq!(sim.host_out(2, &[1], DataToggle::Data0), Handshake::Ack(()));
        ring.poll(&mut sim).unwrap();
        assert_eq!(ring.toggle(), DataToggle::Data1);

        ring.set_halt(&mut sim, true);
        ring.arm_rx(&mut sim).unwrap();
        assert_eq!(sim.host_out(2, &[2], DataToggle::Data1), Handshake::Stall);

        ring.set_halt(&mut sim, false);
        assert!(!sim.ep_csr(EpAddr::out(2)).is_halted());
        assert_eq!(ring.toggle(), DataToggle::Data0);
        assert_eq!(sim.host_out(2, &[3], DataToggle::Data0), Handshake::Ack(()));
        assert_eq!(ring.poll(&mut sim).unwrap().map(|c| c.len), Some(1));
    }

    #[test]
    fn control_setup_lands_in_bd1() {
        let mut sim = sim();
        let mut ring = BdRing::new(EpAddr::out(0), EpType::Control, BdMode::Control, 0, 64);
        ring.configure(&mut sim);
        ring.arm_setup(&mut sim).unwrap();
        ring.arm_rx(&mut sim).unwrap();
        assert!(ring.setup_armed());

        let setup = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00];
        assert_eq!(sim.host_setup(0, setup), Handshake::Ack(()));
        assert_eq!(sim.bd_state(EpAddr::out(0), BdSlot::Bd1), Some(BdState::DoneOk));
        assert_eq!(sim.bd_state(EpAddr::out(0), BdSlot::Bd0), Some(BdState::RdyData));

        let done = ring.poll(&mut sim).unwrap().unwrap();
        assert_eq!((done.slot, done.len, done.setup), (BdSlot::Bd1, 8, true));
        let mut bytes = [0u8; 8];
        sim.read_packet(done.ptr, &mut bytes);
        assert_eq!(bytes, setup);
        // SETUP does not move the data toggle
        assert_eq!(ring.toggle(), DataToggle::Data0);
        assert!(!ring.setup_armed());
    }

    #[test]
    fn oversized_packet_rejected() {
        let mut sim = sim();
        let mut ring = BdRing::new(EpAddr::r#in(3), EpType::Interrupt, BdMode::Single, 512, 8);
        ring.configure(&mut sim);
        assert_eq!(ring.arm_tx(&mut sim, &[0; 9]), Err(XferError::Length));
        assert_eq!(ring.arm_tx(&mut sim, &[0; 8]), Ok(BdSlot::Bd0));
        assert_eq!(ring.arm_tx(&mut sim, &[0; 1]), Err(XferError::Busy));
        assert_eq!(ring.arm_setup(&mut sim), Err(XferError::BadState));
    }
}
