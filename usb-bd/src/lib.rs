//! Endpoint side of the µacm full-speed USB core.
//!
//! Every endpoint direction owns two hardware buffer descriptors (BDs).
//! A BD in a `RDY_*` state belongs to the controller, a BD in a `DONE_*`
//! state is handed back to firmware. `ring` owns that handshake for one
//! endpoint direction, `xfer` chunks whole transfers into it.
//!
//! The controller itself is reached through the `UsbCore` trait: `Mmio`
//! drives the real register block, `sim::SimCore` models the controller
//! and the host side of the bus in RAM.

#![no_std]

#[macro_use]
mod fmt;

pub mod error;
pub mod mmio;
pub mod regs;
pub mod ring;
pub mod xfer;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

use enumset::EnumSet;

pub use error::XferError;
pub use mmio::Mmio;
pub use regs::{BdCsr, BdSlot, BdState, EpAddr, EpCsr, EpFlags, EpType};
pub use ring::{BdMode, BdRing, Completion, DataToggle};
pub use xfer::{Received, Receiver, Sender};

/// Largest packet a full-speed control or bulk endpoint may carry.
pub const MAX_PACKET_SIZE: u16 = 64;

/// Bytes of TX and of RX packet memory.
pub const PKT_MEM_LEN: usize = 1024;

/// Device-level conditions reported by the controller.
#[derive(Debug, enumset::EnumSetType)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceEvent {
    BusReset,
    StartOfFrame,
    /// At least one BD moved to a `DONE_*` state.
    Transfer,
}

/// Firmware view of the controller: endpoint and BD registers, packet
/// memory, D+ pull-up and pending device events.
pub trait UsbCore {
    fn ep_csr(&self, ep: EpAddr) -> EpCsr;

    fn set_ep_csr(&mut self, ep: EpAddr, csr: EpCsr);

    fn bd_csr(&self, ep: EpAddr, slot: BdSlot) -> BdCsr;

    fn set_bd_csr(&mut self, ep: EpAddr, slot: BdSlot, csr: BdCsr);

    /// Packet memory byte offset the BD points at.
    fn bd_ptr(&self, ep: EpAddr, slot: BdSlot) -> u16;

    fn set_bd_ptr(&mut self, ep: EpAddr, slot: BdSlot, ptr: u16);

    /// Copy a packet into TX memory. `ptr` is word aligned.
    fn write_packet(&mut self, ptr: u16, data: &[u8]);

    /// Copy a packet out of RX memory. `ptr` is word aligned.
    fn read_packet(&self, ptr: u16, buf: &mut [u8]);

    fn set_pullup(&mut self, enabled: bool);

    /// Pending events, acknowledged by the read.
    fn take_events(&mut self) -> EnumSet<DeviceEvent>;
}
