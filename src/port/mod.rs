pub mod usb;

pub use usb::{Ep0Packet, PortEvent, UsbPort};
