//! `GET_DESCRIPTOR` lookups.

use crate::bos::MSOS20_DESCRIPTOR_INDEX;
use crate::catalog::Catalog;

/// No catalog entry matches; the control pipe answers with STALL.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NotFound;

impl<'d> Catalog<'d> {
    /// Find the descriptor for a `(type, index)` pair. The LANGID is not
    /// consulted since only one language is served.
    ///
    /// The returned slice is the full descriptor; truncating it to the
    /// host's `wLength` is the transfer layer's business.
    pub fn resolve(&self, ty: u8, index: u8, lang_id: u16) -> Result<&'d [u8], NotFound> {
        let _ = lang_id;
        match self.entries().find(|e| e.ty == ty && e.index == index) {
            Some(e) => Ok(e.data),
            None => {
                debug!("no descriptor type {=u8:#x} index {=u8}", ty, index);
                Err(NotFound)
            }
        }
    }

    /// The MS OS 2.0 descriptor set, fetched with a vendor request rather
    /// than `GET_DESCRIPTOR`.
    pub fn resolve_ms_os_20(&self, vendor_code: u8, w_index: u16) -> Result<&'d [u8], NotFound> {
        if vendor_code == self.ms_vendor_code && w_index == MSOS20_DESCRIPTOR_INDEX {
            Ok(self.msos20)
        } else {
            Err(NotFound)
        }
    }
}
