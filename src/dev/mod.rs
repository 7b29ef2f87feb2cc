//! Device model: handles, capabilities, type selection, autodetect

pub(crate) mod port;

use std::{fmt, path::Path, str::FromStr};

use port::Port;

use crate::{
    ata::SmartRequest,
    error::DeviceError,
    scsi,
    tunnel::{
        Dialect, SatCdbLen, ThreeWareGen, TunnelDevice, cciss::CcissPort, cypress, highpoint,
        jmicron,
        usbtable::{self, BridgeKind},
    },
};

bitflags::bitflags! {
    /// Command families a handle can carry
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub(crate) struct Capability: u8 {
        /// ATA taskfile commands
        const ATA = 1 << 0;
        /// SCSI CDBs
        const SCSI = 1 << 1;
    }
}

/// SCSI-capable device handle wrapping a platform port
pub(crate) struct ScsiHandle {
    /// Platform port shipping the CDBs
    port: Box<dyn Port>,
    /// Device pathname, informational
    path: String,
    /// Type the user asked for
    requested_type: String,
    /// Type in effect, may differ after autodetect
    effective_type: String,
    /// Open/closed lifecycle flag
    open: bool,
    /// Last error seen on this handle
    last_error: Option<DeviceError>,
}

impl ScsiHandle {
    /// Wrap an open port in a handle
    pub(crate) fn new(port: Box<dyn Port>, path: &str, requested_type: &str) -> Self {
        Self {
            port,
            path: path.to_owned(),
            requested_type: requested_type.to_owned(),
            effective_type: "scsi".to_owned(),
            open: true,
            last_error: None,
        }
    }

    /// Device pathname
    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    /// Type the user asked for
    pub(crate) fn requested_type(&self) -> &str {
        &self.requested_type
    }

    /// Effective type after autodetect
    pub(crate) fn effective_type(&self) -> &str {
        &self.effective_type
    }

    /// Borrow the platform port
    pub(crate) fn port_mut(&mut self) -> &mut dyn Port {
        self.port.as_mut()
    }

    /// Record and return an error seen on this handle
    pub(crate) fn set_err(&mut self, err: DeviceError) -> DeviceError {
        self.last_error = Some(err.clone());
        err
    }

    /// Last error recorded on this handle
    pub(crate) fn last_error(&self) -> Option<&DeviceError> {
        self.last_error.as_ref()
    }

    /// Close the handle; a second close is a no-op success
    pub(crate) fn close(&mut self) -> Result<(), DeviceError> {
        if self.open {
            self.open = false;
            self.port.close()?;
        }
        Ok(())
    }
}

impl fmt::Display for ScsiHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.path, self.effective_type)
    }
}

impl Drop for ScsiHandle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Polymorphic device handle. A tunnel's outer capability is ATA while
/// it owns a SCSI inner handle; only the outermost handle is returned
/// to callers.
pub(crate) enum Device {
    /// Plain SCSI device
    Scsi(ScsiHandle),
    /// ATA device tunnelled over SCSI
    Ata(TunnelDevice),
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scsi(_) => f.write_str("Device::Scsi(..)"),
            Self::Ata(_) => f.write_str("Device::Ata(..)"),
        }
    }
}

impl Device {
    /// Command family of the outermost handle
    pub(crate) fn capability(&self) -> Capability {
        match self {
            Self::Scsi(_) => Capability::SCSI,
            Self::Ata(_) => Capability::ATA,
        }
    }

    /// Device pathname
    pub(crate) fn path(&self) -> &str {
        match self {
            Self::Scsi(handle) => handle.path(),
            Self::Ata(tunnel) => tunnel.path(),
        }
    }

    /// Close the handle, cascading through tunnels
    pub(crate) fn close(&mut self) -> Result<(), DeviceError> {
        match self {
            Self::Scsi(handle) => handle.close(),
            Self::Ata(tunnel) => tunnel.close(),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scsi(handle) => handle.fmt(f),
            Self::Ata(tunnel) => tunnel.fmt(f),
        }
    }
}

/// Requested device type, from `-d TYPE`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) enum DeviceType {
    /// Probe the device to refine the type
    #[default]
    Auto,
    /// Plain ATA disk (SAT pass-through on this platform)
    Ata,
    /// Plain SCSI device
    Scsi,
    /// SAT with a chosen CDB length
    Sat {
        /// 12 or 16 byte CDBs
        cdb_len: SatCdbLen,
    },
    /// Marvell SATA controller, carried over SAT here
    Marvell,
    /// Cypress USB bridge
    UsbCypress {
        /// Vendor signature byte
        signature: u8,
    },
    /// JMicron USB bridge
    UsbJMicron {
        /// Bridge port, autodetected when absent
        bridge_port: Option<u8>,
    },
    /// SunplusIT USB bridge
    UsbSunplus,
    /// 3ware RAID enclosure
    ThreeWare {
        /// Disk behind the controller
        unit: u8,
    },
    /// Highpoint RAID enclosure
    Highpoint {
        /// Controller number, 1-based
        controller: u8,
        /// Channel number, 1-based
        channel: u8,
        /// Port multiplier port
        pmport: u8,
    },
    /// HP Smart Array pass-through
    Cciss {
        /// Physical disk number
        disk: u8,
    },
}

impl FromStr for DeviceType {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || DeviceError::InvalidArgument(format!("unknown device type {s:?}"));
        let (base, arg) = match s.split_once(',') {
            Some((base, arg)) => (base, Some(arg)),
            None => (s, None),
        };
        match (base, arg) {
            ("auto", None) => Ok(Self::Auto),
            ("ata", None) => Ok(Self::Ata),
            ("scsi", None) => Ok(Self::Scsi),
            ("sat", None) => Ok(Self::Sat {
                cdb_len: SatCdbLen::Len16,
            }),
            ("sat", Some("12")) => Ok(Self::Sat {
                cdb_len: SatCdbLen::Len12,
            }),
            ("sat", Some("16")) => Ok(Self::Sat {
                cdb_len: SatCdbLen::Len16,
            }),
            ("marvell", None) => Ok(Self::Marvell),
            ("usbcypress", None) => Ok(Self::UsbCypress {
                signature: cypress::DEFAULT_SIGNATURE,
            }),
            ("usbcypress", Some(sig)) => {
                let signature = sig
                    .strip_prefix("0x")
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                    .ok_or_else(bad)?;
                Ok(Self::UsbCypress { signature })
            }
            ("usbjmicron", None) => Ok(Self::UsbJMicron { bridge_port: None }),
            ("usbjmicron", Some(p)) => {
                let bridge_port = p.parse::<u8>().ok().filter(|p| *p <= 1).ok_or_else(bad)?;
                Ok(Self::UsbJMicron {
                    bridge_port: Some(bridge_port),
                })
            }
            ("usbsunplus", None) => Ok(Self::UsbSunplus),
            ("3ware", Some(n)) => {
                let unit = n.parse::<u8>().ok().filter(|n| *n <= 31).ok_or_else(|| {
                    DeviceError::InvalidArgument(
                        "option '-d 3ware,<n>' requires <n> to be 0-31".to_owned(),
                    )
                })?;
                Ok(Self::ThreeWare { unit })
            }
            ("hpt", Some(spec)) => {
                let mut parts = spec.splitn(3, '/');
                let controller = parts
                    .next()
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(bad)?;
                let channel = parts
                    .next()
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(bad)?;
                let pmport = match parts.next() {
                    Some(p) => p.parse().map_err(|_| bad())?,
                    None => 1,
                };
                Ok(Self::Highpoint {
                    controller,
                    channel,
                    pmport,
                })
            }
            ("cciss", Some(n)) => {
                let disk = n.parse::<u8>().map_err(|_| bad())?;
                Ok(Self::Cciss { disk })
            }
            _ => Err(bad()),
        }
    }
}

/// USB ids provided by the OS device enumeration
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct UsbIds {
    /// Vendor id
    pub vendor_id: u16,
    /// Product id
    pub product_id: u16,
    /// bcdDevice version when the OS reports one
    pub version: Option<u16>,
}

/// 3ware generation from the controller device node name
fn threeware_generation(path: &Path) -> ThreeWareGen {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if name.starts_with("twe") {
        ThreeWareGen::Gen678K
    } else {
        ThreeWareGen::Gen9000
    }
}

/// Open a device with an explicit or autodetected type.
/// For `Auto`, the INQUIRY-based probe chain of [`autodetect`] decides
/// whether the plain SCSI handle is replaced by a tunnelled variant.
pub(crate) fn open(
    path: &Path,
    device_type: &DeviceType,
    usb_ids: Option<UsbIds>,
) -> Result<Device, DeviceError> {
    let path_str = path.display().to_string();
    let port: Box<dyn Port> = match device_type {
        DeviceType::Cciss { disk } => {
            let port = CcissPort::open(path, *disk)?;
            let mut handle =
                ScsiHandle::new(Box::new(port), &path_str, &format!("cciss,{disk}"));
            handle.effective_type = format!("cciss,{disk}");
            return Ok(Device::Scsi(handle));
        }
        // RAID enclosures talk through their controller char device
        DeviceType::ThreeWare { .. } => Box::new(port::VendorPort::open(path, b'T', 1)?),
        DeviceType::Highpoint { .. } => Box::new(port::VendorPort::open(path, b'H', 1)?),
        _ => Box::new(port::SgPort::open(path)?),
    };
    let handle = ScsiHandle::new(port, &path_str, &type_request_name(device_type));
    build_device(handle, path, device_type, usb_ids)
}

/// `-d` style name for a requested type
fn type_request_name(device_type: &DeviceType) -> String {
    match device_type {
        DeviceType::Auto => "auto".to_owned(),
        DeviceType::Ata => "ata".to_owned(),
        DeviceType::Scsi => "scsi".to_owned(),
        DeviceType::Sat {
            cdb_len: SatCdbLen::Len16,
        } => "sat".to_owned(),
        DeviceType::Sat {
            cdb_len: SatCdbLen::Len12,
        } => "sat,12".to_owned(),
        DeviceType::Marvell => "marvell".to_owned(),
        DeviceType::UsbCypress { .. } => "usbcypress".to_owned(),
        DeviceType::UsbJMicron { .. } => "usbjmicron".to_owned(),
        DeviceType::UsbSunplus => "usbsunplus".to_owned(),
        DeviceType::ThreeWare { unit } => format!("3ware,{unit}"),
        DeviceType::Highpoint {
            controller,
            channel,
            pmport,
        } => format!("hpt,{controller}/{channel}/{pmport}"),
        DeviceType::Cciss { disk } => format!("cciss,{disk}"),
    }
}

/// Wrap an open handle per the requested type
pub(crate) fn build_device(
    mut handle: ScsiHandle,
    path: &Path,
    device_type: &DeviceType,
    usb_ids: Option<UsbIds>,
) -> Result<Device, DeviceError> {
    match device_type {
        DeviceType::Auto => autodetect(handle, usb_ids),
        DeviceType::Scsi => {
            handle.effective_type = "scsi".to_owned();
            Ok(Device::Scsi(handle))
        }
        // plain ATA disks reach the drive through SAT on this platform
        DeviceType::Ata
        | DeviceType::Sat {
            cdb_len: SatCdbLen::Len16,
        } => Ok(tunnel(handle, Dialect::Sat {
            cdb_len: SatCdbLen::Len16,
        })),
        DeviceType::Sat {
            cdb_len: SatCdbLen::Len12,
        } => Ok(tunnel(handle, Dialect::Sat {
            cdb_len: SatCdbLen::Len12,
        })),
        DeviceType::Marvell => {
            let mut device = tunnel(handle, Dialect::Sat {
                cdb_len: SatCdbLen::Len16,
            });
            if let Device::Ata(t) = &mut device {
                t.inner_mut().effective_type = "marvell".to_owned();
            }
            Ok(device)
        }
        DeviceType::UsbCypress { signature } => Ok(tunnel(handle, Dialect::Cypress {
            signature: *signature,
        })),
        DeviceType::UsbJMicron { bridge_port } => {
            let bridge_port = match bridge_port {
                Some(p) => *p,
                // no port given: ask the bridge which one is populated
                None => match jmicron::detect_port(handle.port_mut()) {
                    Ok(p) => p,
                    Err(e) => return Err(handle.set_err(e)),
                },
            };
            Ok(tunnel(handle, Dialect::JMicron { port: bridge_port }))
        }
        DeviceType::UsbSunplus => Ok(tunnel(handle, Dialect::Sunplus)),
        DeviceType::ThreeWare { unit } => Ok(tunnel(handle, Dialect::ThreeWare {
            generation: threeware_generation(path),
            unit: *unit,
        })),
        DeviceType::Highpoint {
            controller,
            channel,
            pmport,
        } => {
            let device_id =
                match highpoint::resolve_device_id(handle.port_mut(), *controller, *channel, *pmport)
                {
                    Ok(id) => id,
                    Err(e) => return Err(handle.set_err(e)),
                };
            Ok(tunnel(handle, Dialect::Highpoint { device_id }))
        }
        DeviceType::Cciss { .. } => Err(DeviceError::InvalidArgument(
            "cciss devices are opened through their controller node".to_owned(),
        )),
    }
}

/// Wrap a handle in a tunnel dialect, setting the effective type
fn tunnel(mut handle: ScsiHandle, dialect: Dialect) -> Device {
    handle.effective_type = dialect.type_name();
    Device::Ata(TunnelDevice::new(handle, dialect))
}

/// Probe an unspecified SCSI device and refine its type:
/// INQUIRY text, then SAT probe, then the USB bridge table.
fn autodetect(mut handle: ScsiHandle, usb_ids: Option<UsbIds>) -> Result<Device, DeviceError> {
    let mut inq = [0_u8; 64];
    let mut inq_len = 36_usize;
    if let Err(first_err) = scsi::inquiry(handle.port_mut(), &mut inq[..36]) {
        // some bridges only answer 64-byte INQUIRY
        log::debug!("36-byte INQUIRY failed ({first_err}), retrying with 64 bytes");
        if scsi::inquiry(handle.port_mut(), &mut inq).is_err() {
            return Err(handle.set_err(first_err));
        }
        inq_len = 64;
    }

    let vendor = inq.get(8..16).unwrap_or_default();
    let product = inq.get(16..32).unwrap_or_default();
    let text = |bytes: &[u8]| String::from_utf8_lossy(bytes).to_string();
    // 3ware exports the logical RAID volume here, not the disks
    if vendor.starts_with(b"3ware") || vendor.starts_with(b"AMCC") {
        return Err(handle.set_err(DeviceError::InvalidArgument(format!(
            "{} is a 3ware RAID volume, specify '-d 3ware,N' and the controller device instead",
            handle.path()
        ))));
    }
    if inq_len >= 42 && inq.get(36..42) == Some(b"MVSATA".as_slice()) {
        log::debug!("{}: Marvell controller detected", handle.path());
        let mut device = tunnel(handle, Dialect::Sat {
            cdb_len: SatCdbLen::Len16,
        });
        if let Device::Ata(t) = &mut device {
            t.inner_mut().effective_type = "marvell".to_owned();
        }
        return Ok(device);
    }
    if vendor == b"ATA     ".as_slice() {
        // SATA disk behind a SAT layer; confirm with an IDENTIFY probe
        let mut tentative = TunnelDevice::new(handle, Dialect::Sat {
            cdb_len: SatCdbLen::Len16,
        });
        let mut identify = [0_u8; 512];
        match tentative.ata_pass_through(&SmartRequest::Identify.command(), &mut identify) {
            Ok(_) => {
                log::debug!("{}: SAT pass-through confirmed", tentative.path());
                let mut inner = tentative.into_inner();
                inner.effective_type = "sat".to_owned();
                return Ok(Device::Ata(TunnelDevice::new(inner, Dialect::Sat {
                    cdb_len: SatCdbLen::Len16,
                })));
            }
            Err(e) => {
                log::debug!("SAT probe failed ({e}), keeping plain SCSI");
                handle = tentative.into_inner();
            }
        }
    } else {
        log::trace!(
            "INQUIRY vendor {:?}, product {:?}",
            text(vendor),
            text(product)
        );
    }
    if let Some(ids) = usb_ids {
        let kind = usbtable::lookup(ids.vendor_id, ids.product_id, ids.version)?;
        let dialect = match kind {
            BridgeKind::Sat => Dialect::Sat {
                cdb_len: SatCdbLen::Len16,
            },
            BridgeKind::Cypress => Dialect::Cypress {
                signature: cypress::DEFAULT_SIGNATURE,
            },
            BridgeKind::JMicron => {
                let port = jmicron::detect_port(handle.port_mut())?;
                Dialect::JMicron { port }
            }
            BridgeKind::Sunplus => Dialect::Sunplus,
            BridgeKind::Unsupported => unreachable!("lookup rejects unsupported bridges"),
        };
        return Ok(tunnel(handle, dialect));
    }
    handle.effective_type = "scsi".to_owned();
    Ok(Device::Scsi(handle))
}
