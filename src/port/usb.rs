//! Endpoint 0 of the device.
//!
//! Serves `GET_DESCRIPTOR` and the MS OS 2.0 vendor request straight from
//! the catalog. Every other request is handed back to the caller as a
//! `PortEvent::Setup`, to be answered with `send` or `stall`.

use heapless::Vec;

use usb_bd::{
    BdMode, BdRing, DataToggle, DeviceEvent, EpAddr, EpType, Received, Receiver, Sender, UsbCore, XferError,
};
use usb_desc::catalog::EP0_MAX_PACKET_SIZE;
use usb_desc::{Catalog, NotFound};

use crate::control::{Direction, RequestCode, RequestKind, SetupPacket};

const EP0_MPS: u16 = EP0_MAX_PACKET_SIZE as u16;

/// Packet memory of endpoint 0, at the bottom of both TX and RX memory.
const EP0_IN_BUF: u16 = 0;
const EP0_OUT_BUF: u16 = 0;

pub type Ep0Packet = Vec<u8, { EP0_MAX_PACKET_SIZE as usize }>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortEvent {
    /// The host reset the bus; endpoint 0 was re-initialised.
    Reset,
    /// A request the port does not answer itself.
    Setup(SetupPacket),
    /// OUT payload, either a data stage or unsolicited.
    Data(Ep0Packet),
    /// An IN data or status stage was acknowledged.
    Sent(usize),
    /// An IN stage failed on the bus and was dropped.
    Aborted,
    /// The current request was answered with STALL.
    Stalled,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Stage {
    Idle,
    DataIn,
    /// Bytes still expected from the host.
    DataOut(u16),
    /// Waiting for the host's zero-length OUT.
    StatusOut,
    /// Waiting for the caller to `send` the zero-length IN.
    StatusIn,
}

pub struct UsbPort<'d> {
    catalog: Catalog<'d>,
    ep0_in: Sender<'d>,
    ep0_out: Receiver<{ EP0_MAX_PACKET_SIZE as usize }>,
    stage: Stage,
}

impl<'d> UsbPort<'d> {
    pub fn new(catalog: Catalog<'d>) -> Self {
        UsbPort {
            catalog,
            ep0_in: Sender::new(BdRing::new(EpAddr::r#in(0), EpType::Control, BdMode::Dual, EP0_IN_BUF, EP0_MPS)),
            ep0_out: Receiver::new(BdRing::new(
                EpAddr::out(0),
                EpType::Control,
                BdMode::Control,
                EP0_OUT_BUF,
                EP0_MPS,
            )),
            stage: Stage::Idle,
        }
    }

    /// Configure endpoint 0, then connect to the bus.
    pub fn start<H: UsbCore>(&mut self, hw: &mut H) -> Result<(), XferError> {
        self.configure(hw)?;
        hw.set_pullup(true);
        info!("USB port connected");
        Ok(())
    }

    /// Disconnect from the bus.
    pub fn stop<H: UsbCore>(&mut self, hw: &mut H) {
        hw.set_pullup(false);
        self.ep0_in.abort(hw, DataToggle::Data0);
        self.stage = Stage::Idle;
    }

    fn configure<H: UsbCore>(&mut self, hw: &mut H) -> Result<(), XferError> {
        self.ep0_in.configure(hw);
        self.ep0_out.configure(hw)?;
        self.stage = Stage::Idle;
        Ok(())
    }

    /// Drive endpoint 0. Call on every controller event, or just often.
    pub fn poll<H: UsbCore>(&mut self, hw: &mut H) -> Result<Option<PortEvent>, XferError> {
        let events = hw.take_events();
        if events.contains(DeviceEvent::BusReset) {
            debug!("bus reset");
            self.configure(hw)?;
            return Ok(Some(PortEvent::Reset));
        }

        // a SETUP overrides whatever IN stage is pending
        match self.ep0_out.poll(hw) {
            Ok(Received::Setup(raw)) => return self.handle_setup(hw, SetupPacket::from_bytes(raw)),
            Ok(Received::Data(data)) => {
                if let Some(event) = self.handle_out(hw, data) {
                    return Ok(Some(event));
                }
            }
            Err(nb::Error::WouldBlock) => {}
            Err(nb::Error::Other(XferError::Overflow)) => {
                self.stall(hw);
                return Ok(Some(PortEvent::Stalled));
            }
            Err(nb::Error::Other(err)) => return Err(err),
        }

        if !self.ep0_in.is_active() {
            return Ok(None);
        }
        match self.ep0_in.poll(hw) {
            Ok(sent) => {
                self.stage = match self.stage {
                    Stage::DataIn => Stage::StatusOut,
                    _ => Stage::Idle,
                };
                Ok(Some(PortEvent::Sent(sent)))
            }
            Err(nb::Error::WouldBlock) => Ok(None),
            Err(nb::Error::Other(XferError::Aborted)) => {
                self.stage = Stage::Idle;
                Ok(Some(PortEvent::Aborted))
            }
            Err(nb::Error::Other(err)) => Err(err),
        }
    }

    fn handle_setup<H: UsbCore>(&mut self, hw: &mut H, setup: SetupPacket) -> Result<Option<PortEvent>, XferError> {
        trace!("SETUP {}", setup);
        // data and status stages both start at DATA1
        self.ep0_in.abort(hw, DataToggle::Data1);
        self.ep0_out.restart(hw, DataToggle::Data1)?;

        let found = match self.lookup(&setup) {
            Some(found) => found,
            None => {
                self.stage = match setup.direction() {
                    _ if !setup.has_data_stage() => Stage::StatusIn,
                    Direction::In => Stage::DataIn,
                    Direction::Out => {
                        self.ep0_out.set_limit(setup.length as usize);
                        Stage::DataOut(setup.length)
                    }
                };
                return Ok(Some(PortEvent::Setup(setup)));
            }
        };

        match found.map_err(XferError::from).and_then(|data| self.ep0_in.start(hw, data, setup.length)) {
            Ok(()) => {
                // with wLength 0 the ZLP is the status stage
                self.stage = if setup.has_data_stage() { Stage::DataIn } else { Stage::StatusIn };
                Ok(None)
            }
            Err(XferError::Stalled) => {
                self.stall(hw);
                Ok(Some(PortEvent::Stalled))
            }
            Err(err) => Err(err),
        }
    }

    /// `None` when the request is not a descriptor fetch.
    fn lookup(&self, setup: &SetupPacket) -> Option<Result<&'d [u8], NotFound>> {
        if setup.direction() != Direction::In {
            return None;
        }
        match setup.request_type.kind() {
            RequestKind::Standard if setup.standard_request() == Some(RequestCode::GetDescriptor) => {
                let (ty, index) = setup.value.descriptor();
                Some(self.catalog.resolve(ty, index, setup.index))
            }
            RequestKind::Vendor if setup.request == self.catalog.ms_vendor_code() => {
                Some(self.catalog.resolve_ms_os_20(setup.request, setup.index))
            }
            _ => None,
        }
    }

    fn handle_out<H: UsbCore>(&mut self, hw: &mut H, data: Ep0Packet) -> Option<PortEvent> {
        match self.stage {
            Stage::DataIn | Stage::StatusOut if data.is_empty() => {
                trace!("status OUT");
                self.stage = Stage::Idle;
                // the IN completion may still be waiting in the ring
                match self.ep0_in.poll(hw) {
                    Ok(sent) => Some(PortEvent::Sent(sent)),
                    Err(nb::Error::WouldBlock) => {
                        debug!("host ended IN data stage early");
                        self.ep0_in.abort(hw, DataToggle::Data1);
                        None
                    }
                    Err(nb::Error::Other(XferError::Aborted)) => Some(PortEvent::Aborted),
                    Err(nb::Error::Other(_)) => None,
                }
            }
            Stage::StatusOut => {
                // host aborted the IN data stage early
                self.ep0_in.abort(hw, DataToggle::Data1);
                self.stage = Stage::Idle;
                Some(PortEvent::Data(data))
            }
            Stage::DataOut(left) => {
                let left = left.saturating_sub(data.len() as u16);
                if left == 0 || data.len() < EP0_MPS as usize {
                    self.stage = Stage::StatusIn;
                } else {
                    self.ep0_out.set_limit(left as usize);
                    self.stage = Stage::DataOut(left);
                }
                Some(PortEvent::Data(data))
            }
            _ => Some(PortEvent::Data(data)),
        }
    }

    /// Answer the pending request with at most `requested` bytes of
    /// `data`. An empty `data` is the status stage of a request without
    /// data stage.
    ///
    /// `data` stays borrowed until the transfer ends, so it must live as
    /// long as the catalog. Use `reply` for answers built on the stack.
    pub fn send<H: UsbCore>(&mut self, hw: &mut H, data: &'d [u8], requested: u16) -> Result<(), XferError> {
        self.ep0_in.start(hw, data, requested)?;
        self.sending();
        Ok(())
    }

    /// Like `send`, but copies `data`. At most one packet once clipped to
    /// `requested`, otherwise `XferError::Length`.
    pub fn reply<H: UsbCore>(&mut self, hw: &mut H, data: &[u8], requested: u16) -> Result<(), XferError> {
        self.ep0_in.start_copied(hw, data, requested)?;
        self.sending();
        Ok(())
    }

    fn sending(&mut self) {
        if self.stage != Stage::StatusIn {
            self.stage = Stage::DataIn;
        }
    }

    /// Refuse the pending request. The next SETUP clears the STALL.
    pub fn stall<H: UsbCore>(&mut self, hw: &mut H) {
        debug!("EP0 stalled");
        self.ep0_in.stall(hw);
        self.ep0_out.stall(hw);
        self.stage = Stage::Idle;
    }
}
