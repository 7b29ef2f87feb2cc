//! USB bridge detection table

use crate::error::DeviceError;

/// Dialect family a USB bridge speaks
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum BridgeKind {
    /// Standard SAT pass-through
    Sat,
    /// Cypress ATACB
    #[strum(serialize = "usbcypress")]
    Cypress,
    /// JMicron vendor CDB
    #[strum(serialize = "usbjmicron")]
    JMicron,
    /// SunplusIT vendor CDB
    #[strum(serialize = "usbsunplus")]
    Sunplus,
    /// Known bridge without any pass-through
    Unsupported,
}

/// One table row: ids, optional bcd version, dialect
struct UsbIdEntry {
    /// USB vendor id
    vendor_id: u16,
    /// USB product id
    product_id: u16,
    /// bcdDevice match, `None` is a wildcard
    version: Option<u16>,
    /// Dialect the bridge speaks
    kind: BridgeKind,
}

/// Map USB ids to the dialect the bridge speaks
const USB_IDS: &[UsbIdEntry] = &[
    // Cypress
    UsbIdEntry { vendor_id: 0x04b4, product_id: 0x6830, version: Some(0x0001), kind: BridgeKind::Unsupported }, // CY7C68300A
    UsbIdEntry { vendor_id: 0x04b4, product_id: 0x6830, version: Some(0x0240), kind: BridgeKind::Cypress }, // CY7C68300B/C
    // Myson Century
    UsbIdEntry { vendor_id: 0x04cf, product_id: 0x8818, version: Some(0xb007), kind: BridgeKind::Unsupported }, // CS8818
    // Sunplus
    UsbIdEntry { vendor_id: 0x04fc, product_id: 0x0c15, version: Some(0xf615), kind: BridgeKind::Sunplus }, // SPDIF215
    UsbIdEntry { vendor_id: 0x04fc, product_id: 0x0c25, version: Some(0x0103), kind: BridgeKind::Sunplus }, // SPDIF225
    // Iomega
    UsbIdEntry { vendor_id: 0x059b, product_id: 0x0272, version: None, kind: BridgeKind::Cypress }, // LPHD080-0
    UsbIdEntry { vendor_id: 0x059b, product_id: 0x0275, version: Some(0x0001), kind: BridgeKind::Unsupported }, // MDHD500-U
    // LaCie
    UsbIdEntry { vendor_id: 0x059f, product_id: 0x0651, version: None, kind: BridgeKind::Unsupported },
    UsbIdEntry { vendor_id: 0x059f, product_id: 0x1018, version: None, kind: BridgeKind::Sat },
    // In-System Design
    UsbIdEntry { vendor_id: 0x05ab, product_id: 0x0060, version: Some(0x1101), kind: BridgeKind::Cypress }, // ISD-300A1
    // Genesys Logic
    UsbIdEntry { vendor_id: 0x05e3, product_id: 0x0702, version: None, kind: BridgeKind::Unsupported }, // GL881E
    UsbIdEntry { vendor_id: 0x05e3, product_id: 0x0718, version: Some(0x0041), kind: BridgeKind::Sat },
    // Prolific
    UsbIdEntry { vendor_id: 0x067b, product_id: 0x3507, version: Some(0x0001), kind: BridgeKind::Unsupported }, // PL3507
    // Freecom
    UsbIdEntry { vendor_id: 0x07ab, product_id: 0xfc8e, version: Some(0x010f), kind: BridgeKind::Sunplus }, // Hard Drive XS
    // Toshiba
    UsbIdEntry { vendor_id: 0x0930, product_id: 0x0b09, version: None, kind: BridgeKind::Sunplus }, // PX1396E-3T01
    // Seagate
    UsbIdEntry { vendor_id: 0x0bc2, product_id: 0x2000, version: None, kind: BridgeKind::Sat }, // FreeAgent Go
    UsbIdEntry { vendor_id: 0x0bc2, product_id: 0x2100, version: None, kind: BridgeKind::Sat }, // FreeAgent Go
    UsbIdEntry { vendor_id: 0x0bc2, product_id: 0x3001, version: None, kind: BridgeKind::Sat }, // FreeAgent Desk
    // Dura Micro
    UsbIdEntry { vendor_id: 0x0c0b, product_id: 0xb159, version: Some(0x0103), kind: BridgeKind::Sunplus }, // 509
    // Maxtor
    UsbIdEntry { vendor_id: 0x0d49, product_id: 0x7310, version: Some(0x0125), kind: BridgeKind::Sat }, // OneTouch 4
    UsbIdEntry { vendor_id: 0x0d49, product_id: 0x7350, version: Some(0x0125), kind: BridgeKind::Sat }, // OneTouch 4 Mini
    UsbIdEntry { vendor_id: 0x0d49, product_id: 0x7410, version: Some(0x0122), kind: BridgeKind::Sat }, // Basics Desktop
    UsbIdEntry { vendor_id: 0x0d49, product_id: 0x7450, version: Some(0x0122), kind: BridgeKind::Sat }, // Basics Portable
    // Western Digital
    UsbIdEntry { vendor_id: 0x1058, product_id: 0x0702, version: Some(0x0104), kind: BridgeKind::Sat }, // My Passport Portable
    UsbIdEntry { vendor_id: 0x1058, product_id: 0x0704, version: Some(0x0175), kind: BridgeKind::Sat }, // My Passport Essential
    UsbIdEntry { vendor_id: 0x1058, product_id: 0x0705, version: Some(0x0175), kind: BridgeKind::Sat }, // My Passport Elite
    UsbIdEntry { vendor_id: 0x1058, product_id: 0x070a, version: Some(0x1028), kind: BridgeKind::Sat }, // My Passport 070A
    UsbIdEntry { vendor_id: 0x1058, product_id: 0x0906, version: Some(0x0012), kind: BridgeKind::Sat }, // My Book ES
    UsbIdEntry { vendor_id: 0x1058, product_id: 0x1001, version: Some(0x0104), kind: BridgeKind::Sat }, // Elements Desktop
    UsbIdEntry { vendor_id: 0x1058, product_id: 0x1003, version: Some(0x0175), kind: BridgeKind::Sat }, // Elements Desktop WDE1UBK
    UsbIdEntry { vendor_id: 0x1058, product_id: 0x1010, version: Some(0x0105), kind: BridgeKind::Sat }, // Elements
    UsbIdEntry { vendor_id: 0x1058, product_id: 0x1100, version: Some(0x0165), kind: BridgeKind::Sat }, // My Book Essential
    UsbIdEntry { vendor_id: 0x1058, product_id: 0x1102, version: Some(0x1028), kind: BridgeKind::Sat }, // My Book
    // Initio
    UsbIdEntry { vendor_id: 0x13fd, product_id: 0x0540, version: None, kind: BridgeKind::Unsupported }, // 316000
    UsbIdEntry { vendor_id: 0x13fd, product_id: 0x1240, version: Some(0x0104), kind: BridgeKind::Sat },
    UsbIdEntry { vendor_id: 0x13fd, product_id: 0x1340, version: Some(0x0208), kind: BridgeKind::Sat },
    // JMicron
    UsbIdEntry { vendor_id: 0x152d, product_id: 0x2329, version: Some(0x0100), kind: BridgeKind::JMicron }, // JM20329
    UsbIdEntry { vendor_id: 0x152d, product_id: 0x2336, version: Some(0x0100), kind: BridgeKind::JMicron }, // JM20336
    UsbIdEntry { vendor_id: 0x152d, product_id: 0x2338, version: Some(0x0100), kind: BridgeKind::JMicron }, // JM20337/8
    UsbIdEntry { vendor_id: 0x152d, product_id: 0x2339, version: Some(0x0100), kind: BridgeKind::JMicron }, // JM20339
    // Verbatim
    UsbIdEntry { vendor_id: 0x18a5, product_id: 0x0215, version: Some(0x0001), kind: BridgeKind::Sat }, // FW/USB160
    // SunplusIT
    UsbIdEntry { vendor_id: 0x1bcf, product_id: 0x0c31, version: None, kind: BridgeKind::Sunplus },
    // OnSpec
    UsbIdEntry { vendor_id: 0x55aa, product_id: 0x2b00, version: Some(0x0100), kind: BridgeKind::Unsupported },
];

/// Format a USB id triple for error messages
fn format_usb_id(vendor_id: u16, product_id: u16, version: Option<u16>) -> String {
    match version {
        Some(v) => format!("[{vendor_id:#06x}:{product_id:#06x} ({v:#05x})]"),
        None => format!("[{vendor_id:#06x}:{product_id:#06x}]"),
    }
}

/// Look up the dialect for a USB bridge.
/// An entry with the exact bcd version beats a wildcard entry; two
/// equally good matches with different dialects are ambiguous; unknown
/// and unsupported bridges are errors telling the user to pass `-d`.
pub(crate) fn lookup(
    vendor_id: u16,
    product_id: u16,
    version: Option<u16>,
) -> Result<BridgeKind, DeviceError> {
    let mut best: Option<&UsbIdEntry> = None;
    let mut best_exact = false;
    for entry in USB_IDS {
        if entry.vendor_id != vendor_id || entry.product_id != product_id {
            continue;
        }
        let exact = version.is_some() && version == entry.version;
        if let Some(prev) = best {
            if exact <= best_exact {
                if exact == best_exact && entry.kind != prev.kind {
                    return Err(DeviceError::InvalidArgument(format!(
                        "USB bridge {} type is ambiguous: '{}' or '{}'",
                        format_usb_id(vendor_id, product_id, version),
                        entry.kind,
                        prev.kind
                    )));
                }
                continue;
            }
        }
        best_exact = exact;
        best = Some(entry);
    }
    let entry = best.ok_or_else(|| {
        DeviceError::InvalidArgument(format!(
            "Unknown USB bridge {}, please specify the device type with -d",
            format_usb_id(vendor_id, product_id, version)
        ))
    })?;
    if entry.kind == BridgeKind::Unsupported {
        return Err(DeviceError::Unsupported(format!(
            "Unsupported USB bridge {}",
            format_usb_id(vendor_id, product_id, version)
        )));
    }
    Ok(entry.kind)
}
