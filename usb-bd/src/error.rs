use usb_desc::NotFound;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum XferError {
    /// No free BD slot, or a transfer is already in flight.
    Busy,
    /// Polled with no transfer in flight.
    Idle,
    /// An IN packet completed with `DONE_ERR`; the transfer was dropped.
    Aborted,
    /// Received more bytes than the transfer buffer holds.
    Overflow,
    /// Packet larger than the endpoint max packet size.
    Length,
    /// A BD carries a state encoding firmware never armed.
    BadState,
    /// The endpoint answers with STALL.
    Stalled,
}

/// A descriptor miss ends up as a protocol STALL.
impl From<NotFound> for XferError {
    fn from(_: NotFound) -> Self {
        XferError::Stalled
    }
}
