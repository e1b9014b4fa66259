//! Whole transfers over a `BdRing`.
//!
//! Nothing here waits on the controller: every call arms what it can,
//! collects what completed and returns `WouldBlock` until the transfer
//! is over. Call `poll` again whenever the controller reports
//! `DeviceEvent::Transfer`.

use heapless::Vec;

use crate::error::XferError;
use crate::ring::{BdMode, BdRing, DataToggle};
use crate::{UsbCore, MAX_PACKET_SIZE};

/// Bytes of an IN transfer: borrowed for as long as the sender, or a
/// copy of at most one packet.
enum Payload<'d> {
    Borrowed(&'d [u8]),
    Copied(Vec<u8, { MAX_PACKET_SIZE as usize }>),
}

impl<'d> Payload<'d> {
    fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Borrowed(data) => data,
            Payload::Copied(data) => data,
        }
    }
}

/// IN transfer engine: clips, splits into packets, adds the ZLP.
pub struct Sender<'d> {
    ring: BdRing,
    data: Payload<'d>,
    /// Bytes handed to the ring.
    queued: usize,
    /// Bytes the host acknowledged.
    acked: usize,
    /// A zero-length packet is still to be queued.
    zlp: bool,
    active: bool,
}

impl<'d> Sender<'d> {
    pub const fn new(ring: BdRing) -> Self {
        Self { ring, data: Payload::Borrowed(&[]), queued: 0, acked: 0, zlp: false, active: false }
    }

    pub fn ring(&self) -> &BdRing {
        &self.ring
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn configure<H: UsbCore>(&mut self, hw: &mut H) {
        self.ring.configure(hw);
        self.clear();
    }

    /// Send at most `requested` bytes of `data`. When the clipped length
    /// is a multiple of the max packet size and falls short of
    /// `requested`, a zero-length packet tells the host the data ended.
    pub fn start<H: UsbCore>(&mut self, hw: &mut H, data: &'d [u8], requested: u16) -> Result<(), XferError> {
        if self.active {
            return Err(XferError::Busy);
        }
        let len = data.len().min(requested as usize);
        self.begin(hw, Payload::Borrowed(&data[..len]), data.len(), requested)
    }

    /// Like `start`, for data that does not outlive the call. The clipped
    /// data is copied and must fit in one max-size packet.
    pub fn start_copied<H: UsbCore>(&mut self, hw: &mut H, data: &[u8], requested: u16) -> Result<(), XferError> {
        if self.active {
            return Err(XferError::Busy);
        }
        let len = data.len().min(requested as usize);
        let copy = Vec::from_slice(&data[..len]).map_err(|_| XferError::Length)?;
        self.begin(hw, Payload::Copied(copy), data.len(), requested)
    }

    fn begin<H: UsbCore>(
        &mut self,
        hw: &mut H,
        data: Payload<'d>,
        available: usize,
        requested: u16,
    ) -> Result<(), XferError> {
        let requested = requested as usize;
        let len = data.as_slice().len();
        let mps = self.ring.mps() as usize;

        self.data = data;
        self.queued = 0;
        self.acked = 0;
        self.zlp = len % mps == 0 && (len < requested || len == 0);
        self.active = true;
        debug!(
            "EP {=u8:#x} IN {=usize} of {=usize} bytes, host wants {=usize}",
            self.ring.ep().addr(), len, available, requested
        );
        if let Err(err) = self.fill(hw) {
            self.clear();
            return Err(err);
        }
        Ok(())
    }

    fn fill<H: UsbCore>(&mut self, hw: &mut H) -> Result<(), XferError> {
        let mps = self.ring.mps() as usize;
        while self.ring.can_arm() {
            let data = self.data.as_slice();
            let chunk = (data.len() - self.queued).min(mps);
            if chunk == 0 {
                if !self.zlp {
                    break;
                }
                self.zlp = false;
            }
            self.ring.arm_tx(hw, &data[self.queued..self.queued + chunk])?;
            self.queued += chunk;
        }
        Ok(())
    }

    /// `Ok(n)` once the host acknowledged every packet, `n` being the
    /// payload bytes sent. An IN error drops the transfer with `Aborted`
    /// and leaves the endpoint idle at the failed packet's toggle.
    pub fn poll<H: UsbCore>(&mut self, hw: &mut H) -> nb::Result<usize, XferError> {
        if !self.active {
            return Err(nb::Error::Other(XferError::Idle));
        }
        while let Some(done) = self.ring.poll(hw).map_err(nb::Error::Other)? {
            if !done.ok {
                warn!("EP {=u8:#x} IN transfer aborted after {=usize} bytes", self.ring.ep().addr(), self.acked);
                let toggle = self.ring.toggle();
                self.abort(hw, toggle);
                return Err(nb::Error::Other(XferError::Aborted));
            }
            self.acked += done.len as usize;
        }
        self.fill(hw).map_err(nb::Error::Other)?;

        if self.queued == self.data.as_slice().len() && !self.zlp && self.ring.is_idle() {
            debug!("EP {=u8:#x} IN done, {=usize} bytes", self.ring.ep().addr(), self.acked);
            let sent = self.acked;
            self.clear();
            Ok(sent)
        } else {
            Err(nb::Error::WouldBlock)
        }
    }

    /// Drop whatever is in flight and restart the endpoint at `toggle`.
    pub fn abort<H: UsbCore>(&mut self, hw: &mut H, toggle: DataToggle) {
        if self.active {
            debug!("EP {=u8:#x} IN cancelled", self.ring.ep().addr());
        }
        self.ring.reset(hw, toggle);
        self.clear();
    }

    pub fn stall<H: UsbCore>(&mut self, hw: &mut H) {
        self.ring.stall(hw);
        self.clear();
    }

    pub fn set_halt<H: UsbCore>(&mut self, hw: &mut H, halted: bool) {
        self.ring.set_halt(hw, halted);
    }

    fn clear(&mut self) {
        self.data = Payload::Borrowed(&[]);
        self.queued = 0;
        self.acked = 0;
        self.zlp = false;
        self.active = false;
    }
}

/// What an OUT endpoint delivered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Received<const N: usize> {
    Setup([u8; 8]),
    /// A complete OUT transfer, possibly empty.
    Data(Vec<u8, N>),
}

/// OUT transfer engine: keeps the ring armed and reassembles packets
/// until a short packet, or the expected length, ends the transfer.
pub struct Receiver<const N: usize> {
    ring: BdRing,
    buf: Vec<u8, N>,
    limit: usize,
}

impl<const N: usize> Receiver<N> {
    pub const fn new(ring: BdRing) -> Self {
        Self { ring, buf: Vec::new(), limit: N }
    }

    pub fn ring(&self) -> &BdRing {
        &self.ring
    }

    pub fn configure<H: UsbCore>(&mut self, hw: &mut H) -> Result<(), XferError> {
        self.ring.configure(hw);
        self.buf.clear();
        self.limit = N;
        self.arm(hw)
    }

    /// Arm every free slot, the SETUP slot included.
    pub fn arm<H: UsbCore>(&mut self, hw: &mut H) -> Result<(), XferError> {
        if self.ring.mode() == BdMode::Control && !self.ring.setup_armed() {
            self.ring.arm_setup(hw)?;
        }
        while self.ring.can_arm() {
            self.ring.arm_rx(hw)?;
        }
        Ok(())
    }

    /// Drop any partial transfer and re-arm from scratch at `toggle`.
    pub fn restart<H: UsbCore>(&mut self, hw: &mut H, toggle: DataToggle) -> Result<(), XferError> {
        self.ring.reset(hw, toggle);
        self.buf.clear();
        self.limit = N;
        self.arm(hw)
    }

    /// End the current transfer after `limit` bytes even without a short
    /// packet, as for a control data stage of known `wLength`.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.min(N);
    }

    pub fn stall<H: UsbCore>(&mut self, hw: &mut H) {
        self.ring.stall(hw);
        self.buf.clear();
    }

    pub fn set_halt<H: UsbCore>(&mut self, hw: &mut H, halted: bool) {
        self.ring.set_halt(hw, halted);
    }

    pub fn poll<H: UsbCore>(&mut self, hw: &mut H) -> nb::Result<Received<N>, XferError> {
        while let Some(done) = self.ring.poll(hw).map_err(nb::Error::Other)? {
            if done.setup {
                let mut setup = [0u8; 8];
                hw.read_packet(done.ptr, &mut setup);
                self.buf.clear();
                self.limit = N;
                self.arm(hw).map_err(nb::Error::Other)?;
                return Ok(Received::Setup(setup));
            }

            let mut packet = [0u8; MAX_PACKET_SIZE as usize];
            let len = (done.len as usize).min(packet.len());
            hw.read_packet(done.ptr, &mut packet[..len]);
            self.arm(hw).map_err(nb::Error::Other)?;

            if self.buf.len() + len > self.limit || self.buf.extend_from_slice(&packet[..len]).is_err() {
                warn!("EP {=u8:#x} OUT overflow, {=usize} bytes dropped", self.ring.ep().addr(), self.buf.len() + len);
                self.buf.clear();
                self.limit = N;
                return Err(nb::Error::Other(XferError::Overflow));
            }
            if len < self.ring.mps() as usize || self.buf.len() >= self.limit {
                trace!("EP {=u8:#x} OUT done, {=usize} bytes", self.ring.ep().addr(), self.buf.len());
                self.limit = N;
                return Ok(Received::Data(core::mem::take(&mut self.buf)));
            }
        }
        Err(nb::Error::WouldBlock)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::regs::{EpAddr, EpType};
    use crate::sim::{Handshake, HostRead, SimCore};

    const EP_IN: u8 = 2;
    const EP_OUT: u8 = 2;

    fn sim() -> SimCore {
        let mut sim = SimCore::new();
        sim.set_pullup(true);
        sim
    }

    fn sender<'d>(sim: &mut SimCore) -> Sender<'d> {
        let mut tx = Sender::new(BdRing::new(EpAddr::r#in(EP_IN), EpType::Bulk, BdMode::Dual, 0, 64));
        tx.configure(sim);
        tx
    }

    fn receiver<const N: usize>(sim: &mut SimCore) -> Receiver<N> {
        let mut rx = Receiver::new(BdRing::new(EpAddr::out(EP_OUT), EpType::Bulk, BdMode::Dual, 0, 64));
        rx.configure(sim).unwrap();
        rx
    }

    /// Host reads what `tx` sends and writes it back out to `rx`.
    fn loopback(payload: &[u8], requested: u16) -> (HostRead<512>, Vec<u8, 512>) {
        let mut sim = sim();
        let mut tx = sender(&mut sim);
        let mut rx: Receiver<512> = receiver(&mut sim);

        tx.start(&mut sim, payload, requested).unwrap();
        let mut sent = None;
        let read = sim
            .read_in::<512>(EP_IN, 64, requested as usize, |sim| {
                if let Ok(n) = tx.poll(sim) {
                    sent = Some(n);
                }
            })
            .unwrap();
        while sent.is_none() {
            match tx.poll(&mut sim) {
                Ok(n) => sent = Some(n),
                Err(nb::Error::WouldBlock) => break,
                Err(e) => panic!("{:?}", e),
            }
        }
        assert_eq!(sent, Some(read.data.len()));

        // the host announced the length, as a class request would
        rx.set_limit(read.data.len());
        let mut echoed = Vec::new();
        sim.write_out(EP_OUT, 64, &read.data, read.zlp, DataToggle::Data0, |sim| {
            if let Ok(Received::Data(data)) = rx.poll(sim) {
                echoed.extend_from_slice(&data).unwrap();
            }
        })
        .unwrap();
        if let Ok(Received::Data(data)) = rx.poll(&mut sim) {
            echoed.extend_from_slice(&data).unwrap();
        }
        (read, echoed)
    }

    #[test]
    fn round_trip_short_tail() {
        let payload: [u8; 100] = core::array::from_fn(|i| i as u8);
        let (read, echoed) = loopback(&payload, 255);
        assert_eq!(read.packets, 2);
        assert!(!read.zlp);
        assert_eq!(&echoed[..], &payload[..]);
    }

    #[test]
    fn round_trip_with_zlp() {
        let payload: [u8; 128] = core::array::from_fn(|i| (i * 3) as u8);
        let (read, echoed) = loopback(&payload, 129);
        assert_eq!(read.packets, 3);
        assert!(read.zlp);
        assert_eq!(&read.data[..], &payload[..]);
        assert_eq!(&echoed[..], &payload[..]);
    }

    #[test]
    fn exact_request_needs_no_zlp() {
        let payload = [7u8; 64];
        let (read, echoed) = loopback(&payload, 64);
        assert_eq!(read.packets, 1);
        assert!(!read.zlp);
        assert_eq!(&echoed[..], &payload[..]);
    }

    #[test]
    fn clipped_to_request() {
        let payload = [1u8; 80];
        let (read, _) = loopback(&payload, 9);
        assert_eq!(read.data.len(), 9);
        assert_eq!(read.packets, 1);
    }

    #[test]
    fn empty_transfer_is_one_zlp() {
        let mut sim = sim();
        let mut tx = sender(&mut sim);
        tx.start(&mut sim, &[], 0).unwrap();
        match sim.host_in(EP_IN) {
            Handshake::Ack(packet) => assert!(packet.data.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(tx.poll(&mut sim), Ok(0));
        assert_eq!(tx.poll(&mut sim), Err(nb::Error::Other(XferError::Idle)));
    }

    #[test]
    fn toggles_alternate_across_packets() {
        let mut sim = sim();
        let mut tx = sender(&mut sim);
        let payload = [0x55u8; 200];
        tx.start(&mut sim, &payload, 200).unwrap();
        let mut toggles = [DataToggle::Data0; 4];
        for toggle in toggles.iter_mut() {
            match sim.host_in(EP_IN) {
                Handshake::Ack(packet) => *toggle = packet.toggle,
                other => panic!("unexpected {:?}", other),
            }
            let _ = tx.poll(&mut sim);
        }
        use DataToggle::*;
        assert_eq!(toggles, [Data0, Data1, Data0, Data1]);
        assert!(!tx.is_active());
    }

    #[test]
    fn busy_while_in_flight() {
        let mut sim = sim();
        let mut tx = sender(&mut sim);
        tx.start(&mut sim, &[1, 2, 3], 64).unwrap();
        assert_eq!(tx.start(&mut sim, &[4], 64), Err(XferError::Busy));
        assert_eq!(tx.poll(&mut sim), Err(nb::Error::WouldBlock));
    }

    #[test]
    fn in_error_aborts_transfer() {
        let mut sim = sim();
        let mut tx = sender(&mut sim);
        let payload = [3u8; 150];
        tx.start(&mut sim, &payload, 150).unwrap();
        assert!(matches!(sim.host_in(EP_IN), Handshake::Ack(_)));
        assert_eq!(tx.poll(&mut sim), Err(nb::Error::WouldBlock));

        sim.corrupt_next(EpAddr::r#in(EP_IN));
        assert_eq!(sim.host_in(EP_IN), Handshake::Error);
        assert_eq!(tx.poll(&mut sim), Err(nb::Error::Other(XferError::Aborted)));
        assert!(!tx.is_active());
        assert!(tx.ring().is_idle());
        // nothing left for the host
        assert_eq!(sim.host_in(EP_IN), Handshake::Nak);

        // endpoint takes a fresh transfer
        tx.start(&mut sim, &payload[..10], 10).unwrap();
        assert!(matches!(sim.host_in(EP_IN), Handshake::Ack(_)));
        assert_eq!(tx.poll(&mut sim), Ok(10));
    }

    #[test]
    fn copied_data_outlives_caller_buffer() {
        let mut sim = sim();
        let mut tx = sender(&mut sim);
        {
            let reply: [u8; 7] = [0x00, 0xc2, 0x01, 0x00, 0x00, 0x00, 0x08];
            tx.start_copied(&mut sim, &reply, 64).unwrap();
        }
        match sim.host_in(EP_IN) {
            Handshake::Ack(packet) => assert_eq!(&packet.data[..], &[0x00, 0xc2, 0x01, 0x00, 0x00, 0x00, 0x08]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(tx.poll(&mut sim), Ok(7));

        // clipped first, so only the request has to fit
        let long = [4u8; 100];
        tx.start_copied(&mut sim, &long, 10).unwrap();
        assert!(matches!(sim.host_in(EP_IN), Handshake::Ack(_)));
        assert_eq!(tx.poll(&mut sim), Ok(10));
        assert_eq!(tx.start_copied(&mut sim, &long, 100), Err(XferError::Length));
        assert!(!tx.is_active());
    }

    #[test]
    fn out_error_is_retried_transparently() {
        let mut sim = sim();
        let mut rx: Receiver<64> = receiver(&mut sim);
        sim.corrupt_next(EpAddr::out(EP_OUT));
        assert_eq!(sim.host_out(EP_OUT, b"hello", DataToggle::Data0), Handshake::Error);
        assert_eq!(rx.poll(&mut sim), Err(nb::Error::WouldBlock));
        assert_eq!(sim.host_out(EP_OUT, b"hello", DataToggle::Data0), Handshake::Ack(()));
        match rx.poll(&mut sim) {
            Ok(Received::Data(data)) => assert_eq!(&data[..], b"hello"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn receive_limit_ends_transfer() {
        let mut sim = sim();
        let mut rx: Receiver<256> = receiver(&mut sim);
        rx.set_limit(64);
        assert_eq!(sim.host_out(EP_OUT, &[9; 64], DataToggle::Data0), Handshake::Ack(()));
        match rx.poll(&mut sim) {
            Ok(Received::Data(data)) => assert_eq!(data.len(), 64),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn receive_overflow() {
        let mut sim = sim();
        let mut rx: Receiver<100> = receiver(&mut sim);
        assert_eq!(sim.host_out(EP_OUT, &[1; 64], DataToggle::Data0), Handshake::Ack(()));
        assert_eq!(rx.poll(&mut sim), Err(nb::Error::WouldBlock));
        assert_eq!(sim.host_out(EP_OUT, &[2; 64], DataToggle::Data1), Handshake::Ack(()));
        assert_eq!(rx.poll(&mut sim), Err(nb::Error::Other(XferError::Overflow)));
    }

    #[test]
    fn stalled_receiver_still_takes_setup() {
        let mut sim = sim();
        let mut rx: Receiver<64> =
            Receiver::new(BdRing::new(EpAddr::out(0), EpType::Control, BdMode::Control, 0, 64));
        rx.configure(&mut sim).unwrap();
        rx.stall(&mut sim);
        assert_eq!(sim.host_out(0, &[], DataToggle::Data1), Handshake::Stall);

        let setup = [0x00, 0x05, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(sim.host_setup(0, setup), Handshake::Ack(()));
        assert_eq!(rx.poll(&mut sim), Ok(Received::Setup(setup)));

        rx.restart(&mut sim, DataToggle::Data1).unwrap();
        assert_eq!(sim.host_out(0, &[], DataToggle::Data1), Handshake::Ack(()));
        assert_eq!(rx.poll(&mut sim), Ok(Received::Data(Vec::new())));
    }
}
