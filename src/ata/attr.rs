//! SMART attribute and threshold tables

use std::{fmt, str::FromStr};

use super::{FirmwareBug, ProtocolPolicy, check_page_checksum};
use crate::{bytes, error::DeviceError};

/// Fixed number of attribute slots in the SMART data structure
pub(crate) const NUM_ATTRIBUTES: usize = 30;
/// Offset of the attribute array inside the values page
const ATTR_TABLE_OFFSET: usize = 2;
/// Size of one attribute entry
const ATTR_ENTRY_SIZE: usize = 12;
/// Default id of the current-pending-sector attribute
pub(crate) const ATTR_CURRENT_PENDING: u8 = 197;
/// Default id of the offline-uncorrectable attribute
pub(crate) const ATTR_OFFLINE_UNCORRECTABLE: u8 = 198;

bitflags::bitflags! {
    /// Attribute flag word as reported by the drive
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub(crate) struct AttrFlags: u16 {
        /// Pre-failure attribute (vs. usage)
        const PREFAILURE = 0x0001;
        /// Updated during online data collection
        const ONLINE = 0x0002;
        /// Performance attribute
        const PERFORMANCE = 0x0004;
        /// Error rate attribute
        const ERROR_RATE = 0x0008;
        /// Event count attribute
        const EVENT_COUNT = 0x0010;
        /// Self-preserving attribute
        const SELF_PRESERVING = 0x0020;
    }
}

/// One of the 30 fixed attribute slots
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct AttrSlot {
    /// Attribute id, 0 for an empty slot
    pub id: u8,
    /// Flag word
    pub flags: AttrFlags,
    /// Normalized current value
    pub current: u8,
    /// Normalized worst value
    pub worst: u8,
    /// 6-byte vendor raw value
    pub raw: [u8; 6],
}

impl AttrSlot {
    /// Is this a pre-failure attribute?
    pub(crate) fn is_prefailure(&self) -> bool {
        self.flags.contains(AttrFlags::PREFAILURE)
    }
}

/// Decoded SMART values page
#[derive(Clone, Debug, Default)]
pub(crate) struct SmartValues {
    /// Data structure revision
    pub revision: u16,
    /// The 30 attribute slots
    pub table: [AttrSlot; NUM_ATTRIBUTES],
    /// Offline data collection status byte
    pub offline_status: u8,
    /// Self-test execution status byte (high nibble = status, low = remaining %)
    pub self_test_exec_status: u8,
    /// Offline data collection capability byte
    pub offline_capability: u8,
    /// SMART capability word
    pub smart_capability: u16,
    /// Error logging capability byte
    pub errorlog_capability: u8,
    /// Short self-test polling time, minutes
    pub short_test_minutes: u8,
    /// Extended self-test polling time, minutes
    pub extended_test_minutes: u8,
}

impl SmartValues {
    /// Find the slot for an attribute id
    pub(crate) fn find(&self, id: u8) -> Option<&AttrSlot> {
        (id != 0).then(|| self.table.iter().find(|a| a.id == id))?
    }

    /// Does the drive support the error logging feature?
    pub(crate) fn supports_error_log(&self) -> bool {
        self.errorlog_capability & 0x01 != 0
    }

    /// Does the drive support self-tests?
    pub(crate) fn supports_self_test(&self) -> bool {
        self.offline_capability & 0x10 != 0
    }

    /// Does the drive support conveyance self-tests?
    pub(crate) fn supports_conveyance_test(&self) -> bool {
        self.offline_capability & 0x20 != 0
    }

    /// Does the drive support selective self-tests?
    pub(crate) fn supports_selective_test(&self) -> bool {
        self.offline_capability & 0x40 != 0
    }
}

/// Apply firmware-bug byte swaps to a raw values/thresholds page
fn fix_firmware_swaps(raw: &mut [u8], firmware: FirmwareBug) {
    match firmware {
        // whole page is byte-swapped
        FirmwareBug::Samsung => {
            for i in (0..raw.len()).step_by(2) {
                bytes::swap2(raw, i);
            }
        }
        // only the attribute array is byte-swapped
        FirmwareBug::Samsung2 => {
            for i in (ATTR_TABLE_OFFSET..ATTR_TABLE_OFFSET + NUM_ATTRIBUTES * ATTR_ENTRY_SIZE)
                .step_by(2)
            {
                bytes::swap2(raw, i);
            }
        }
        // id and flags low byte swapped in each entry
        FirmwareBug::SwapId => {
            for slot in 0..NUM_ATTRIBUTES {
                bytes::swap2(raw, ATTR_TABLE_OFFSET + slot * ATTR_ENTRY_SIZE);
            }
        }
        FirmwareBug::None | FirmwareBug::Samsung3 => {}
    }
}

/// Decode a SMART READ DATA page
#[expect(clippy::indexing_slicing)] // fixed offsets into a checked 512-byte page
pub(crate) fn decode_values(
    raw: &[u8],
    policy: &ProtocolPolicy,
) -> Result<SmartValues, DeviceError> {
    if raw.len() != 512 {
        return Err(DeviceError::Protocol(format!(
            "SMART values page has {} bytes instead of 512",
            raw.len()
        )));
    }
    let mut page = [0_u8; 512];
    page.copy_from_slice(raw);
    fix_firmware_swaps(&mut page, policy.firmware);
    check_page_checksum(&page, "SMART attribute values", policy)?;

    let mut values = SmartValues {
        revision: bytes::le_u16(&page, 0),
        offline_status: page[362],
        self_test_exec_status: page[363],
        offline_capability: page[367],
        smart_capability: bytes::le_u16(&page, 368),
        errorlog_capability: page[370],
        short_test_minutes: page[372],
        extended_test_minutes: page[373],
        ..SmartValues::default()
    };
    for (slot, entry) in values.table.iter_mut().enumerate() {
        let off = ATTR_TABLE_OFFSET + slot * ATTR_ENTRY_SIZE;
        entry.id = page[off];
        entry.flags = AttrFlags::from_bits_retain(bytes::le_u16(&page, off + 1));
        entry.current = page[off + 3];
        entry.worst = page[off + 4];
        entry.raw.copy_from_slice(&page[off + 5..off + 11]);
    }
    Ok(values)
}

/// Decoded threshold table: id -> threshold byte
#[derive(Clone, Debug, Default)]
pub(crate) struct SmartThresholds {
    /// Data structure revision
    pub revision: u16,
    /// (id, threshold) rows, positionally matching the values table
    pub rows: [(u8, u8); NUM_ATTRIBUTES],
}

/// Decode a SMART READ THRESHOLDS page
#[expect(clippy::indexing_slicing)] // fixed offsets into a checked 512-byte page
pub(crate) fn decode_thresholds(
    raw: &[u8],
    policy: &ProtocolPolicy,
) -> Result<SmartThresholds, DeviceError> {
    if raw.len() != 512 {
        return Err(DeviceError::Protocol(format!(
            "SMART thresholds page has {} bytes instead of 512",
            raw.len()
        )));
    }
    let mut page = [0_u8; 512];
    page.copy_from_slice(raw);
    fix_firmware_swaps(&mut page, policy.firmware);
    check_page_checksum(&page, "SMART attribute thresholds", policy)?;

    let mut thresholds = SmartThresholds {
        revision: bytes::le_u16(&page, 0),
        ..SmartThresholds::default()
    };
    for (slot, row) in thresholds.rows.iter_mut().enumerate() {
        let off = ATTR_TABLE_OFFSET + slot * ATTR_ENTRY_SIZE;
        *row = (page[off], page[off + 1]);
    }
    Ok(thresholds)
}

impl SmartThresholds {
    /// Threshold row positionally matching a values slot
    pub(crate) fn row(&self, slot: usize) -> Option<(u8, u8)> {
        self.rows.get(slot).copied()
    }
}

/// Derived state of one attribute
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub(crate) enum AttrState {
    /// Empty slot
    NonExisting,
    /// Normalized value not usable for this attribute
    NoNormval,
    /// No matching threshold row
    NoThreshold,
    /// Threshold row id does not match the value row id
    BadThreshold,
    /// Current value at or below threshold
    FailedNow,
    /// Worst value at or below threshold, current recovered
    FailedPast,
    /// Healthy
    Ok,
}

/// Derive the attribute state.
/// Pure function of the value row, the positional threshold row, and the
/// definition flags; a zero threshold always passes.
pub(crate) fn attr_state(
    slot: &AttrSlot,
    threshold_row: Option<(u8, u8)>,
    def: &AttrDef,
) -> AttrState {
    if slot.id == 0 {
        return AttrState::NonExisting;
    }
    if def.flags.contains(DefFlags::NO_NORMVAL) || slot.current == 0 {
        return AttrState::NoNormval;
    }
    let Some((thres_id, threshold)) = threshold_row else {
        return AttrState::NoThreshold;
    };
    if thres_id == 0 {
        return AttrState::NoThreshold;
    }
    if thres_id != slot.id {
        return AttrState::BadThreshold;
    }
    if threshold == 0 {
        // zero threshold means always-pass
        return AttrState::Ok;
    }
    if slot.current <= threshold {
        AttrState::FailedNow
    } else if slot.worst <= threshold {
        AttrState::FailedPast
    } else {
        AttrState::Ok
    }
}

/// Raw value presentation format
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
pub(crate) enum RawFormat {
    /// Six decimal bytes
    #[strum(serialize = "raw8")]
    Raw8,
    /// Three decimal 16-bit words
    #[strum(serialize = "raw16")]
    Raw16,
    /// 48-bit decimal
    #[default]
    #[strum(serialize = "raw48")]
    Raw48,
    /// 48-bit hex
    #[strum(serialize = "hex48")]
    Hex48,
    /// 64-bit decimal, consumes the normalized value bytes
    #[strum(serialize = "raw64")]
    Raw64,
    /// 64-bit hex, consumes the normalized value bytes
    #[strum(serialize = "hex64")]
    Hex64,
    /// Low word, others appended when nonzero
    #[strum(serialize = "raw16(raw16)")]
    Raw16OptRaw16,
    /// Low word plus average in the next word
    #[strum(serialize = "raw16(avg16)")]
    Raw16OptAvg16,
    /// Two 24-bit values
    #[strum(serialize = "raw24/raw24")]
    Raw24Raw24,
    /// Seconds presented as hours
    #[strum(serialize = "sec2hour")]
    Sec2Hour,
    /// Minutes presented as hours
    #[strum(serialize = "min2hour")]
    Min2Hour,
    /// Half-minutes presented as hours
    #[strum(serialize = "halfmin2hour")]
    HalfMin2Hour,
    /// Temperature with min/max pair
    #[strum(serialize = "tempminmax")]
    TempMinMax,
    /// Temperature in tenths of a degree
    #[strum(serialize = "temp10x")]
    Temp10x,
}

bitflags::bitflags! {
    /// Attribute definition flags
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub(crate) struct DefFlags: u8 {
        /// Only strict raw increases are failures (`-v 197,raw48+`)
        const INCREASING = 1 << 0;
        /// Normalized value bytes are part of the raw value
        const NO_NORMVAL = 1 << 1;
    }
}

/// Definition priority: higher shadows lower
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum DefPriority {
    /// Built-in default
    #[default]
    Default,
    /// Drive preset database
    Preset,
    /// User `-v` directive
    User,
}

/// Per-attribute display definition
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct AttrDef {
    /// Display name override
    pub name: Option<String>,
    /// Raw value format
    pub format: RawFormat,
    /// Definition flags
    pub flags: DefFlags,
    /// Priority of the rule that set this definition
    pub priority: DefPriority,
}

/// Full per-id definition table
#[derive(Clone, Debug)]
pub(crate) struct AttrDefs {
    /// One definition per attribute id
    defs: Vec<AttrDef>,
}

impl Default for AttrDefs {
    fn default() -> Self {
        let mut defs = Self {
            defs: vec![AttrDef::default(); 256],
        };
        // well-known defaults; everything else renders as raw48
        for (id, name) in [
            (1_u8, "Raw_Read_Error_Rate"),
            (3, "Spin_Up_Time"),
            (4, "Start_Stop_Count"),
            (5, "Reallocated_Sector_Ct"),
            (7, "Seek_Error_Rate"),
            (9, "Power_On_Hours"),
            (10, "Spin_Retry_Count"),
            (12, "Power_Cycle_Count"),
            (192, "Power-Off_Retract_Count"),
            (193, "Load_Cycle_Count"),
            (196, "Reallocated_Event_Count"),
            (197, "Current_Pending_Sector"),
            (198, "Offline_Uncorrectable"),
            (199, "UDMA_CRC_Error_Count"),
        ] {
            defs.set(
                id,
                AttrDef {
                    name: Some(name.to_owned()),
                    ..AttrDef::default()
                },
            );
        }
        defs.set(
            190,
            AttrDef {
                name: Some("Airflow_Temperature_Cel".to_owned()),
                format: RawFormat::TempMinMax,
                ..AttrDef::default()
            },
        );
        defs.set(
            194,
            AttrDef {
                name: Some("Temperature_Celsius".to_owned()),
                format: RawFormat::TempMinMax,
                ..AttrDef::default()
            },
        );
        defs
    }
}

impl AttrDefs {
    /// Definition for an attribute id
    pub(crate) fn get(&self, id: u8) -> &AttrDef {
        // the table always holds 256 entries
        self.defs.get(usize::from(id)).unwrap_or(EMPTY_DEF)
    }

    /// Replace the definition for an id, ignoring priority
    fn set(&mut self, id: u8, def: AttrDef) {
        if let Some(slot) = self.defs.get_mut(usize::from(id)) {
            *slot = def;
        }
    }

    /// Apply a parsed definition at the given priority.
    /// An equal-priority rule overrides the previous one (parse order wins).
    pub(crate) fn apply(&mut self, parsed: &ParsedAttrDef, priority: DefPriority) {
        match parsed.id {
            Some(id) => {
                if let Some(slot) = self.defs.get_mut(usize::from(id)) {
                    if slot.priority <= priority {
                        *slot = AttrDef {
                            name: parsed.name.clone().or_else(|| slot.name.clone()),
                            format: parsed.format,
                            flags: parsed.flags,
                            priority,
                        };
                    }
                }
            }
            // "N,format" applies to every id not already claimed at >= priority
            None => {
                for slot in &mut self.defs {
                    if slot.priority < priority {
                        *slot = AttrDef {
                            name: parsed.name.clone().or_else(|| slot.name.clone()),
                            format: parsed.format,
                            flags: parsed.flags,
                            priority,
                        };
                    }
                }
            }
        }
    }
}

/// Shared empty definition for out-of-range lookups
static EMPTY_DEF: &AttrDef = &AttrDef {
    name: None,
    format: RawFormat::Raw48,
    flags: DefFlags::empty(),
    priority: DefPriority::Default,
};

/// One parsed `-v` directive: `id,format[+][,name]` or `N,format[,name]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ParsedAttrDef {
    /// Target id, `None` for the `N` wildcard
    pub id: Option<u8>,
    /// Raw format
    pub format: RawFormat,
    /// Definition flags
    pub flags: DefFlags,
    /// Display name
    pub name: Option<String>,
}

impl FromStr for ParsedAttrDef {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.splitn(3, ',');
        let id_tok = tokens
            .next()
            .ok_or_else(|| DeviceError::InvalidArgument(format!("bad attribute def {s:?}")))?;
        let id = if id_tok == "N" {
            None
        } else {
            let id: u8 = id_tok
                .parse()
                .map_err(|_| DeviceError::InvalidArgument(format!("bad attribute id {id_tok:?}")))?;
            if id == 0 {
                return Err(DeviceError::InvalidArgument(
                    "attribute id 0 is reserved".to_owned(),
                ));
            }
            Some(id)
        };
        let mut fmt_tok = tokens
            .next()
            .ok_or_else(|| DeviceError::InvalidArgument(format!("missing format in {s:?}")))?;
        let mut flags = DefFlags::empty();
        if let Some(stripped) = fmt_tok.strip_suffix('+') {
            flags |= DefFlags::INCREASING;
            fmt_tok = stripped;
        }
        let format: RawFormat = fmt_tok
            .parse()
            .map_err(|_| DeviceError::InvalidArgument(format!("unknown raw format {fmt_tok:?}")))?;
        if matches!(format, RawFormat::Raw64 | RawFormat::Hex64) {
            flags |= DefFlags::NO_NORMVAL;
        }
        let name = tokens.next().map(ToOwned::to_owned);
        Ok(Self {
            id,
            format,
            flags,
            name,
        })
    }
}

impl fmt::Display for ParsedAttrDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{id}")?,
            None => write!(f, "N")?,
        }
        write!(f, ",{}", self.format)?;
        if self.flags.contains(DefFlags::INCREASING) {
            write!(f, "+")?;
        }
        if let Some(name) = &self.name {
            write!(f, ",{name}")?;
        }
        Ok(())
    }
}

/// Assemble the raw value of a slot under a definition.
/// 64-bit formats consume the normalized value bytes as the high bytes.
pub(crate) fn raw_value(slot: &AttrSlot, def: &AttrDef) -> u64 {
    let mut val = bytes::le_u48(&slot.raw, 0);
    if def.flags.contains(DefFlags::NO_NORMVAL) {
        val |= (u64::from(slot.current) << 48) | (u64::from(slot.worst) << 56);
    }
    val
}

/// Render the raw value of a slot under a definition
pub(crate) fn render_raw(slot: &AttrSlot, def: &AttrDef) -> String {
    let raw = &slot.raw;
    let w = [
        bytes::le_u16(raw, 0),
        bytes::le_u16(raw, 2),
        bytes::le_u16(raw, 4),
    ];
    let val48 = bytes::le_u48(raw, 0);
    match def.format {
        RawFormat::Raw8 => raw
            .iter()
            .rev()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(" "),
        RawFormat::Raw16 => format!("{} {} {}", w[2], w[1], w[0]),
        RawFormat::Raw48 => val48.to_string(),
        RawFormat::Hex48 => format!("{val48:#014x}"),
        RawFormat::Raw64 => raw_value(slot, def).to_string(),
        RawFormat::Hex64 => format!("{:#018x}", raw_value(slot, def)),
        RawFormat::Raw16OptRaw16 => {
            if w[1] != 0 || w[2] != 0 {
                format!("{} ({} {})", w[0], w[2], w[1])
            } else {
                w[0].to_string()
            }
        }
        RawFormat::Raw16OptAvg16 => {
            if w[1] != 0 {
                format!("{} (Average {})", w[0], w[1])
            } else {
                w[0].to_string()
            }
        }
        RawFormat::Raw24Raw24 => {
            let lo = val48 & 0xff_ffff;
            let hi = val48 >> 24;
            format!("{hi}/{lo}")
        }
        RawFormat::Sec2Hour => {
            let secs = val48;
            format!("{}h+{:02}m+{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
        }
        RawFormat::Min2Hour => {
            let mins = val48;
            format!("{}h+{:02}m", mins / 60, mins % 60)
        }
        RawFormat::HalfMin2Hour => {
            let mins = val48 / 2;
            format!("{}h+{:02}m", mins / 60, mins % 60)
        }
        RawFormat::TempMinMax => {
            let temp = raw[0];
            let min = raw[2];
            let max = raw[4];
            if min != 0 || max != 0 {
                format!("{temp} (Min/Max {min}/{max})")
            } else {
                temp.to_string()
            }
        }
        RawFormat::Temp10x => {
            format!("{}.{}", w[0] / 10, w[0] % 10)
        }
    }
}

/// Extract a Celsius temperature from a slot, for the formats that carry one
pub(crate) fn temperature(slot: &AttrSlot, def: &AttrDef) -> Option<u8> {
    match def.format {
        RawFormat::TempMinMax => Some(slot.raw[0]),
        #[expect(clippy::cast_possible_truncation)]
        RawFormat::Temp10x => Some(((bytes::le_u16(&slot.raw, 0) + 5) / 10).min(255) as u8),
        _ => None,
    }
}
