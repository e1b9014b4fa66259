//! The descriptor catalog.
//!
//! `Provisioning` is the one place the descriptor content can change:
//! IDs, strings and whether the DFU runtime function is visible. `build`
//! serializes everything into a `Descriptors` store and self-checks it.
//! From then on the store is only ever borrowed shared, and a `Catalog`
//! is a table of `(index, type, length, bytes)` entries into it,
//! terminated by an all-zero sentinel.

use crate::bos::*;
use crate::descriptor::*;
use crate::string::{StringDescriptor, StringError, LANG_ID_EN_US};
use crate::{Class, DescriptorType, TransferType};

pub const VENDOR_ID: u16 = 0x1d50;
pub const PRODUCT_ID: u16 = 0x6159;
/// v0.1
pub const DEVICE_RELEASE: u16 = 0x0001;

pub const EP0_MAX_PACKET_SIZE: u8 = 64;

pub const STR_LANGUAGES: u8 = 0;
pub const STR_SERIAL: u8 = 1;
pub const STR_MANUFACTURER: u8 = 2;
pub const STR_PRODUCT: u8 = 3;
pub const STR_DFU_INTERFACE: u8 = 4;
pub const STRING_COUNT: usize = 5;

pub const INTF_DFU: u8 = 0;
pub const INTF_CDC_CONTROL: u8 = 1;
pub const INTF_CDC_DATA: u8 = 2;
pub const NUM_INTERFACES: u8 = 3;

pub const EP_CDC_NOTIFY: u8 = 0x83;
pub const EP_CDC_DATA_OUT: u8 = 0x02;
pub const EP_CDC_DATA_IN: u8 = 0x82;
pub const CDC_NOTIFY_MAX_PACKET_SIZE: u16 = 8;
pub const CDC_DATA_MAX_PACKET_SIZE: u16 = 64;

pub const DFU_DETACH_TIMEOUT_MS: u16 = 1000;
pub const DFU_TRANSFER_SIZE: u16 = 4096;

/// `bRequest` of the vendor request serving the MS OS 2.0 set.
pub const MS_VENDOR_CODE: u8 = 0x20;

/// Byte size of the composite configuration descriptor.
pub const CONFIG_LEN: usize = ConfigurationDescriptor::LEN
    // DFU runtime
    + InterfaceDescriptor::LEN
    + DfuFunctionalDescriptor::LEN
    // CDC control
    + InterfaceDescriptor::LEN
    + CdcHeaderDescriptor::LEN
    + CdcAcmDescriptor::LEN
    + CdcUnionDescriptor::LEN
    + EndpointDescriptor::LEN
    // CDC data
    + InterfaceDescriptor::LEN
    + 2 * EndpointDescriptor::LEN;

pub const BOS_LEN: usize = BosDescriptor::LEN + MsOs20Capability::LEN;

pub const MSOS20_SET_LEN: usize = MsOs20SetHeader::LEN + MsOs20CompatibleId::LEN;

const _: () = assert!(CONFIG_LEN == 80);
const _: () = assert!(BOS_LEN == 33);
const _: () = assert!(MSOS20_SET_LEN == 30);
const _: () = assert!(CONFIG_LEN <= u16::MAX as usize);

/// Device, configuration, BOS and every string, plus the sentinel.
pub const CATALOG_LEN: usize = 3 + STRING_COUNT + 1;

/// A layout defect found by the startup self-check.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CatalogError {
    /// A record ran past the end of its buffer while composing.
    Truncated,
    /// `bLength` is too small or runs past the containing blob.
    DescriptorLength { ty: u8, index: u8 },
    /// `bDescriptorType` differs from the catalog entry type.
    DescriptorType { ty: u8, index: u8 },
    /// `wTotalLength` of a composite differs from its byte count.
    TotalLength { ty: u8 },
    /// `bNumInterfaces` differs from the distinct interface count.
    NumInterfaces,
    /// A CDC union references an interface that is not present.
    BadUnion,
    /// BOS `wMSOSDescriptorSetTotalLength` differs from the served set.
    MsOsLength,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProvisionError {
    String { index: u8, err: StringError },
    Catalog(CatalogError),
}

impl From<CatalogError> for ProvisionError {
    fn from(err: CatalogError) -> Self {
        ProvisionError::Catalog(err)
    }
}

/// Provisioning-time configuration. Everything here is applied before
/// enumeration; nothing changes once `build` has returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Provisioning<'a> {
    vendor_id: u16,
    product_id: u16,
    manufacturer: &'a str,
    product: &'a str,
    serial: &'a str,
    dfu_runtime: bool,
    ms_vendor_code: u8,
}

impl Default for Provisioning<'_> {
    fn default() -> Self {
        Self {
            vendor_id: VENDOR_ID,
            product_id: PRODUCT_ID,
            manufacturer: "Nitro FPGA",
            product: "\u{03bc}acm",
            serial: "0000000000000000",
            dfu_runtime: true,
            ms_vendor_code: MS_VENDOR_CODE,
        }
    }
}

impl<'a> Provisioning<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vendor_id(mut self, vid: u16) -> Self {
        self.vendor_id = vid;
        self
    }

    pub fn product_id(mut self, pid: u16) -> Self {
        self.product_id = pid;
        self
    }

    pub fn manufacturer(mut self, s: &'a str) -> Self {
        self.manufacturer = s;
        self
    }

    pub fn product(mut self, s: &'a str) -> Self {
        self.product = s;
        self
    }

    pub fn serial(mut self, s: &'a str) -> Self {
        self.serial = s;
        self
    }

    /// Hide the DFU runtime interface from the host. The interface stays
    /// in the configuration so no offset or count changes.
    pub fn dfu_runtime(mut self, enabled: bool) -> Self {
        self.dfu_runtime = enabled;
        self
    }

    pub fn ms_vendor_code(mut self, code: u8) -> Self {
        self.ms_vendor_code = code;
        self
    }

    pub fn build(&self) -> Result<Descriptors, ProvisionError> {
        let string = |index: u8, s: &str| {
            StringDescriptor::new(s).map_err(|err| ProvisionError::String { index, err })
        };
        let descs = Descriptors {
            device: self.device().bytes(),
            config: self.configuration()?,
            bos: self.bos()?,
            msos20: self.ms_os_20()?,
            ms_vendor_code: self.ms_vendor_code,
            strings: [
                StringDescriptor::languages(&[LANG_ID_EN_US])
                    .map_err(|err| ProvisionError::String { index: STR_LANGUAGES, err })?,
                string(STR_SERIAL, self.serial)?,
                string(STR_MANUFACTURER, self.manufacturer)?,
                string(STR_PRODUCT, self.product)?,
                string(STR_DFU_INTERFACE, "DFU rt")?,
            ],
        };

        if let Err(err) = descs.catalog().self_check() {
            error!("USB descriptor self-check failed: {}", err);
            return Err(err.into());
        }
        debug!("USB descriptors provisioned, vid {=u16:x} pid {=u16:x}", self.vendor_id, self.product_id);
        Ok(descs)
    }

    fn device(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            bcd_usb: USB_VERSION_2_0,
            b_device_class: Class::FromInterface as u8,
            b_device_sub_class: 0,
            b_device_protocol: 0,
            b_max_packet_size0: EP0_MAX_PACKET_SIZE,
            id_vendor: self.vendor_id,
            id_product: self.product_id,
            bcd_device: DEVICE_RELEASE,
            i_manufacturer: STR_MANUFACTURER,
            i_product: STR_PRODUCT,
            i_serial_number: STR_SERIAL,
            b_num_configurations: 1,
        }
    }

    fn configuration(&self) -> Result<[u8; CONFIG_LEN], CatalogError> {
        let mut buf = [0u8; CONFIG_LEN];
        let mut w = Writer::new(&mut buf);

        w.put(&ConfigurationDescriptor {
            w_total_length: CONFIG_LEN as u16,
            b_num_interfaces: NUM_INTERFACES,
            b_configuration_value: 1,
            i_configuration: 0,
            bm_attributes: CONFIG_ATTR_RESERVED,
            b_max_power: 0x32, // 100 mA
        }.bytes())?;

        let dfu = InterfaceDescriptor {
            b_interface_number: INTF_DFU,
            b_alternate_setting: 0,
            b_num_endpoints: 0,
            b_interface_class: Class::ApplicationSpecific as u8,
            b_interface_sub_class: DFU_SUBCLASS,
            b_interface_protocol: DFU_PROTOCOL_RUNTIME,
            i_interface: STR_DFU_INTERFACE,
        };
        let dfu = if self.dfu_runtime { dfu } else { dfu.hidden() };
        w.put(&dfu.bytes())?;
        w.put(&DfuFunctionalDescriptor {
            bm_attributes: DfuAttributes::CAN_DNLOAD
                | DfuAttributes::MANIFESTATION_TOLERANT
                | DfuAttributes::WILL_DETACH,
            w_detach_timeout: DFU_DETACH_TIMEOUT_MS,
            w_transfer_size: DFU_TRANSFER_SIZE,
            bcd_dfu_version: DFU_VERSION_1_1,
        }.bytes())?;

        w.put(&InterfaceDescriptor {
            b_interface_number: INTF_CDC_CONTROL,
            b_alternate_setting: 0,
            b_num_endpoints: 1,
            b_interface_class: Class::Cdc as u8,
            b_interface_sub_class: CDC_SUBCLASS_ACM,
            b_interface_protocol: 0x00,
            i_interface: 0,
        }.bytes())?;
        w.put(&CdcHeaderDescriptor { bcd_cdc: CDC_VERSION_1_10 }.bytes())?;
        // Pure pipe, no line coding or break support
        w.put(&CdcAcmDescriptor { bm_capabilities: 0x00 }.bytes())?;
        w.put(&CdcUnionDescriptor {
            b_master_interface: INTF_CDC_CONTROL,
            b_slave_interface: INTF_CDC_DATA,
        }.bytes())?;
        w.put(&EndpointDescriptor {
            b_endpoint_address: EP_CDC_NOTIFY,
            bm_attributes: TransferType::Interrupt,
            w_max_packet_size: CDC_NOTIFY_MAX_PACKET_SIZE,
            b_interval: 0x40,
        }.bytes())?;

        w.put(&InterfaceDescriptor {
            b_interface_number: INTF_CDC_DATA,
            b_alternate_setting: 0,
            b_num_endpoints: 2,
            b_interface_class: Class::CdcData as u8,
            b_interface_sub_class: 0x00,
            b_interface_protocol: 0x00,
            i_interface: 0,
        }.bytes())?;
        for address in [EP_CDC_DATA_OUT, EP_CDC_DATA_IN] {
            w.put(&EndpointDescriptor {
                b_endpoint_address: address,
                bm_attributes: TransferType::Bulk,
                w_max_packet_size: CDC_DATA_MAX_PACKET_SIZE,
                b_interval: 0x00,
            }.bytes())?;
        }

        w.finish()?;
        Ok(buf)
    }

    fn bos(&self) -> Result<[u8; BOS_LEN], CatalogError> {
        let mut buf = [0u8; BOS_LEN];
        let mut w = Writer::new(&mut buf);
        w.put(&BosDescriptor { w_total_length: BOS_LEN as u16, b_num_device_caps: 1 }.bytes())?;
        w.put(&MsOs20Capability {
            dw_windows_version: MSOS20_WIN_VER_8_1,
            w_msos_descriptor_set_total_length: MSOS20_SET_LEN as u16,
            b_ms_vendor_code: self.ms_vendor_code,
            b_alt_enum_code: 0x00,
        }.bytes())?;
        w.finish()?;
        Ok(buf)
    }

    fn ms_os_20(&self) -> Result<[u8; MSOS20_SET_LEN], CatalogError> {
        let mut buf = [0u8; MSOS20_SET_LEN];
        let mut w = Writer::new(&mut buf);
        w.put(&MsOs20SetHeader {
            dw_windows_version: MSOS20_WIN_VER_8_1,
            w_total_length: MSOS20_SET_LEN as u16,
        }.bytes())?;
        w.put(&MsOs20CompatibleId {
            compatible_id: WINUSB_COMPATIBLE_ID,
            sub_compatible_id: [0; 8],
        }.bytes())?;
        w.finish()?;
        Ok(buf)
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), CatalogError> {
        let end = self.pos + bytes.len();
        let dst = self.buf.get_mut(self.pos..end).ok_or(CatalogError::Truncated)?;
        dst.copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    /// Every byte of the destination must have been written.
    fn finish(self) -> Result<(), CatalogError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(CatalogError::Truncated)
        }
    }
}

/// Serialized descriptors, owned. Borrow it through `catalog()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Descriptors {
    device: [u8; DeviceDescriptor::LEN],
    config: [u8; CONFIG_LEN],
    bos: [u8; BOS_LEN],
    msos20: [u8; MSOS20_SET_LEN],
    ms_vendor_code: u8,
    strings: [StringDescriptor; STRING_COUNT],
}

impl Descriptors {
    pub fn device(&self) -> &[u8] {
        &self.device
    }

    pub fn configuration(&self) -> &[u8] {
        &self.config
    }

    pub fn bos(&self) -> &[u8] {
        &self.bos
    }

    pub fn ms_os_20_set(&self) -> &[u8] {
        &self.msos20
    }

    pub fn string(&self, index: u8) -> Option<&StringDescriptor> {
        self.strings.get(index as usize)
    }

    pub fn catalog(&self) -> Catalog<'_> {
        let mut table: [Entry<'_>; CATALOG_LEN] = [Entry::END; CATALOG_LEN];
        table[0] = Entry::whole(DescriptorType::Device, &self.device);
        table[1] = Entry::whole(DescriptorType::Configuration, &self.config);
        table[2] = Entry::whole(DescriptorType::BinaryObjectStore, &self.bos);
        for (i, s) in self.strings.iter().enumerate() {
            table[3 + i] = Entry {
                index: i as u8,
                ty: DescriptorType::String as u8,
                len: s.len() as u16,
                data: s.as_bytes(),
            };
        }

        Catalog { table, msos20: &self.msos20, ms_vendor_code: self.ms_vendor_code }
    }
}

/// One catalog row. `data` is exactly `len` bytes long.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Entry<'d> {
    pub index: u8,
    pub ty: u8,
    pub len: u16,
    pub data: &'d [u8],
}

impl<'d> Entry<'d> {
    /// End-of-table marker, never matched by a lookup.
    pub const END: Self = Entry { index: 0, ty: 0, len: 0, data: &[] };

    /// Index 0 entry served as the whole blob.
    fn whole(ty: DescriptorType, data: &'d [u8]) -> Self {
        Entry { index: 0, ty: ty as u8, len: data.len() as u16, data }
    }

    pub fn is_end(&self) -> bool {
        self.index == 0 && self.ty == 0 && self.len == 0
    }

    /// Configuration and BOS descriptors carry their sub-descriptors, so
    /// their served length is `wTotalLength`, not `bLength`.
    pub fn is_composite(&self) -> bool {
        self.ty == DescriptorType::Configuration as u8 || self.ty == DescriptorType::BinaryObjectStore as u8
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Catalog<'d> {
    pub(crate) table: [Entry<'d>; CATALOG_LEN],
    pub(crate) msos20: &'d [u8],
    pub(crate) ms_vendor_code: u8,
}

impl<'d> Catalog<'d> {
    /// Entries up to, not including, the sentinel.
    pub fn entries(&self) -> impl Iterator<Item = &Entry<'d>> + '_ {
        self.table.iter().take_while(|e| !e.is_end())
    }

    pub fn ms_vendor_code(&self) -> u8 {
        self.ms_vendor_code
    }

    /// Structural check run once by `Provisioning::build`, before the
    /// device ever connects to the bus.
    pub fn self_check(&self) -> Result<(), CatalogError> {
        for e in self.entries() {
            check_entry(e)?;
            if e.ty == DescriptorType::Configuration as u8 {
                check_configuration(e.data)?;
            }
            if e.ty == DescriptorType::BinaryObjectStore as u8 {
                check_bos(e.data, self.msos20)?;
            }
        }
        Ok(())
    }
}

fn le16(bytes: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes([*bytes.get(at)?, *bytes.get(at + 1)?]))
}

fn check_entry(e: &Entry<'_>) -> Result<(), CatalogError> {
    let bad_len = CatalogError::DescriptorLength { ty: e.ty, index: e.index };
    if e.data.len() != e.len as usize || e.data.len() < 2 {
        return Err(bad_len);
    }
    if e.data[1] != e.ty {
        return Err(CatalogError::DescriptorType { ty: e.ty, index: e.index });
    }
    let declared = if e.is_composite() {
        le16(e.data, 2).ok_or(bad_len)?
    } else {
        u16::from(e.data[0])
    };
    if declared != e.len {
        return Err(if e.is_composite() { CatalogError::TotalLength { ty: e.ty } } else { bad_len });
    }
    Ok(())
}

/// Walks every sub-descriptor of a composite configuration.
fn check_configuration(config: &[u8]) -> Result<(), CatalogError> {
    let ty = DescriptorType::Configuration as u8;
    let total = le16(config, 2).ok_or(CatalogError::TotalLength { ty })?;
    if total as usize != config.len() {
        return Err(CatalogError::TotalLength { ty });
    }

    // interface numbers seen, as a bitmask
    let mut interfaces: u32 = 0;
    let mut pos = 0;
    while pos < config.len() {
        let len = config[pos] as usize;
        let end = pos + len;
        if len < 2 || end > config.len() {
            return Err(CatalogError::DescriptorLength { ty: config.get(pos + 1).copied().unwrap_or(0), index: 0 });
        }
        if config[pos + 1] == DescriptorType::Interface as u8 {
            let number = *config.get(pos + 2).ok_or(CatalogError::DescriptorLength { ty: config[pos + 1], index: 0 })?;
            if number >= 32 {
                return Err(CatalogError::NumInterfaces);
            }
            interfaces |= 1 << number;
        }
        pos = end;
    }
    if interfaces.count_ones() != u32::from(config[4]) {
        return Err(CatalogError::NumInterfaces);
    }

    let mut pos = 0;
    while pos < config.len() {
        let len = config[pos] as usize;
        let desc = &config[pos..pos + len];
        if desc[1] == DescriptorType::ClassInterface as u8 && desc.get(2) == Some(&CDC_SUBTYPE_UNION) {
            let members = desc.get(3..).ok_or(CatalogError::BadUnion)?;
            if members.is_empty() || members.iter().any(|i| *i >= 32 || interfaces & (1 << *i) == 0) {
                return Err(CatalogError::BadUnion);
            }
        }
        pos += len;
    }
    Ok(())
}

fn check_bos(bos: &[u8], msos20: &[u8]) -> Result<(), CatalogError> {
    let ty = DescriptorType::BinaryObjectStore as u8;
    if le16(bos, 2) != Some(bos.len() as u16) {
        return Err(CatalogError::TotalLength { ty });
    }
    let cap = BosDescriptor::LEN;
    if bos.get(cap).map(|l| *l as usize) != Some(MsOs20Capability::LEN) || bos.len() != cap + MsOs20Capability::LEN {
        return Err(CatalogError::DescriptorLength { ty: DescriptorType::DeviceCapability as u8, index: 0 });
    }
    let advertised = le16(bos, cap + MsOs20Capability::SET_LENGTH_OFFSET);
    let own_total = le16(msos20, 8);
    if advertised != own_total || own_total != Some(msos20.len() as u16) {
        return Err(CatalogError::MsOsLength);
    }
    Ok(())
}
