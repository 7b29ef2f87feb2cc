//! Self-test logs: standard, extended, and selective

use super::{ProtocolPolicy, check_page_checksum};
use crate::{bytes, error::DeviceError};

/// Log address of the standard self-test log
pub(crate) const LOG_SELFTEST: u8 = 0x06;
/// GP log address of the extended self-test log
pub(crate) const LOG_EXT_SELFTEST: u8 = 0x07;
/// Log address of the selective self-test log
pub(crate) const LOG_SELECTIVE: u8 = 0x09;

/// Entries in the standard self-test log ring
const SELFTEST_ENTRIES: usize = 21;
/// Size of one standard log entry
const SELFTEST_ENTRY_SIZE: usize = 24;
/// Descriptors per extended log sector
const EXT_DESCS_PER_SECTOR: usize = 19;
/// Size of one extended log descriptor
const EXT_DESC_SIZE: usize = 26;

/// Execution status high nibble: test in progress
pub(crate) const EXEC_STATUS_IN_PROGRESS: u8 = 0xf;

/// Self-test completion status, from the status byte high nibble
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub(crate) enum SelfTestStatus {
    /// Completed without error
    #[strum(serialize = "Completed without error")]
    CompletedOk,
    /// Aborted by the host
    #[strum(serialize = "Aborted by host")]
    AbortedByHost,
    /// Interrupted by a host reset
    #[strum(serialize = "Interrupted (host reset)")]
    HostReset,
    /// Fatal or unknown error, test incomplete
    #[strum(serialize = "Fatal or unknown error")]
    Fatal,
    /// Completed with an unknown failure element
    #[strum(serialize = "Completed: unknown failure")]
    UnknownFailure,
    /// Completed with an electrical failure element
    #[strum(serialize = "Completed: electrical failure")]
    Electrical,
    /// Completed with a servo/seek failure element
    #[strum(serialize = "Completed: servo/seek failure")]
    ServoSeek,
    /// Completed with a read failure element
    #[strum(serialize = "Completed: read failure")]
    Read,
    /// Completed with handling damage suspected
    #[strum(serialize = "Completed: handling damage")]
    Handling,
    /// Reserved status value
    #[strum(serialize = "Unknown status")]
    Reserved,
    /// Test currently running
    #[strum(serialize = "Self-test in progress")]
    InProgress,
}

impl SelfTestStatus {
    /// Decode the high nibble of the status byte
    pub(crate) fn from_nibble(nibble: u8) -> Self {
        match nibble {
            0x0 => Self::CompletedOk,
            0x1 => Self::AbortedByHost,
            0x2 => Self::HostReset,
            0x3 => Self::Fatal,
            0x4 => Self::UnknownFailure,
            0x5 => Self::Electrical,
            0x6 => Self::ServoSeek,
            0x7 => Self::Read,
            0x8 => Self::Handling,
            EXEC_STATUS_IN_PROGRESS => Self::InProgress,
            _ => Self::Reserved,
        }
    }

    /// Did the test record a failure?
    pub(crate) fn is_failure(self) -> bool {
        matches!(
            self,
            Self::Fatal
                | Self::UnknownFailure
                | Self::Electrical
                | Self::ServoSeek
                | Self::Read
                | Self::Handling
        )
    }
}

/// One self-test log entry, standard or extended
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct SelfTestEntry {
    /// Subtest type byte (short/extended/conveyance/selective, captive bit)
    pub subtest: u8,
    /// Completion status
    pub status: SelfTestStatus,
    /// Remaining percentage, from the status byte low nibble
    pub remaining_pct: u8,
    /// Power-on hour timestamp
    pub hour: u16,
    /// Failing LBA, when the status records a failure
    pub failing_lba: Option<u64>,
}

/// Decoded self-test log, most recent entry first
#[derive(Clone, Debug, Default)]
pub(crate) struct SelfTestLog {
    /// Data structure revision
    pub revision: u16,
    /// Entries, most recent first
    pub entries: Vec<SelfTestEntry>,
}

impl SelfTestLog {
    /// Count of failed entries and the hour of the most recent failure
    pub(crate) fn error_count_and_hour(&self) -> (usize, u16) {
        let failures = self.entries.iter().filter(|e| e.status.is_failure());
        let count = failures.clone().count();
        let hour = failures.map(|e| e.hour).max().unwrap_or(0);
        (count, hour)
    }
}

/// Decode one entry at `off`, `None` when the slot is empty
fn decode_entry(page: &[u8], off: usize, lba_len: usize) -> Option<SelfTestEntry> {
    let status_byte = *page.get(off + 1)?;
    let subtest = *page.get(off)?;
    if subtest == 0 && status_byte == 0 {
        return None;
    }
    let status = SelfTestStatus::from_nibble(status_byte >> 4);
    let failing_lba = match lba_len {
        6 => Some(bytes::le_u48(page, off + 5)),
        _ => Some(u64::from(bytes::le_u32(page, off + 5))),
    }
    .filter(|_| status.is_failure());
    Some(SelfTestEntry {
        subtest,
        status,
        remaining_pct: (status_byte & 0x0f) * 10,
        hour: bytes::le_u16(page, off + 2),
        failing_lba,
    })
}

/// Decode the standard 21-entry self-test log (log 0x06)
pub(crate) fn decode_selftest_log(
    page: &[u8],
    policy: &ProtocolPolicy,
) -> Result<SelfTestLog, DeviceError> {
    if page.len() != 512 {
        return Err(DeviceError::Protocol(format!(
            "self-test log has {} bytes instead of 512",
            page.len()
        )));
    }
    check_page_checksum(page, "SMART self-test log", policy)?;
    let most_recent = usize::from(page.get(508).copied().unwrap_or(0));
    let mut log = SelfTestLog {
        revision: bytes::le_u16(page, 0),
        entries: Vec::new(),
    };
    if most_recent == 0 || most_recent > SELFTEST_ENTRIES {
        // no tests have been run
        return Ok(log);
    }
    // walk the ring backwards from the most recent slot
    for i in 0..SELFTEST_ENTRIES {
        let slot = (most_recent + SELFTEST_ENTRIES - 1 - i) % SELFTEST_ENTRIES;
        let off = 2 + slot * SELFTEST_ENTRY_SIZE;
        if let Some(entry) = decode_entry(page, off, 4) {
            log.entries.push(entry);
        }
    }
    Ok(log)
}

/// Decode the extended self-test log (GP log 0x07), one or more sectors
pub(crate) fn decode_ext_selftest_log(
    sectors: &[u8],
    policy: &ProtocolPolicy,
) -> Result<SelfTestLog, DeviceError> {
    if sectors.is_empty() || sectors.len() % 512 != 0 {
        return Err(DeviceError::Protocol(format!(
            "extended self-test log has {} bytes, not a sector multiple",
            sectors.len()
        )));
    }
    for sector in sectors.chunks_exact(512) {
        check_page_checksum(sector, "extended self-test log", policy)?;
    }
    let index = usize::from(bytes::le_u16(sectors, 2));
    let mut log = SelfTestLog {
        revision: u16::from(sectors.first().copied().unwrap_or(0)),
        entries: Vec::new(),
    };
    if index == 0 {
        return Ok(log);
    }
    let total = sectors.len() / 512 * EXT_DESCS_PER_SECTOR;
    // descriptor index is 1-based and wraps over all sectors read
    for i in 0..total {
        let desc = (index - 1 + total - i) % total;
        let sector = desc / EXT_DESCS_PER_SECTOR;
        let off = sector * 512 + 4 + (desc % EXT_DESCS_PER_SECTOR) * EXT_DESC_SIZE;
        if let Some(entry) = decode_entry(sectors, off, 6) {
            log.entries.push(entry);
        }
    }
    Ok(log)
}

bitflags::bitflags! {
    /// Selective self-test feature flags
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub(crate) struct SelectiveFlags: u16 {
        /// Perform an off-line scan after the selective test
        const DO_SCAN_AFTER = 0x0002;
        /// Pending time expired scan is pending
        const PENDING = 0x0008;
        /// Selective self-test currently active
        const ACTIVE = 0x0010;
    }
}

/// Offset of the current-LBA cursor in the selective log
const SEL_CURRENT_LBA: usize = 338;
/// Offset of the current-span index
const SEL_CURRENT_SPAN: usize = 346;
/// Offset of the feature flags word
const SEL_FLAGS: usize = 348;
/// Offset of the pending time word
const SEL_PENDING_TIME: usize = 494;

/// Decoded selective self-test log, raw page retained for rewrite
#[derive(Clone, Debug)]
pub(crate) struct SelectiveLog {
    /// Log version word
    pub version: u16,
    /// The five test spans as (start, end) LBA pairs
    pub spans: [(u64, u64); 5],
    /// Progress cursor
    pub current_lba: u64,
    /// Currently tested span, 1-based; 0 when idle
    pub current_span: u16,
    /// Feature flags
    pub flags: SelectiveFlags,
    /// Pending time, minutes
    pub pending_time: u16,
    /// Raw page, vendor bytes preserved for rewriting
    page: [u8; 512],
}

impl SelectiveLog {
    /// Decode the selective self-test log (log 0x09)
    pub(crate) fn decode(raw: &[u8], policy: &ProtocolPolicy) -> Result<Self, DeviceError> {
        if raw.len() != 512 {
            return Err(DeviceError::Protocol(format!(
                "selective self-test log has {} bytes instead of 512",
                raw.len()
            )));
        }
        check_page_checksum(raw, "selective self-test log", policy)?;
        let mut page = [0_u8; 512];
        page.copy_from_slice(raw);
        let mut spans = [(0_u64, 0_u64); 5];
        for (i, span) in spans.iter_mut().enumerate() {
            *span = (
                bytes::le_u64(&page, 2 + i * 16),
                bytes::le_u64(&page, 2 + i * 16 + 8),
            );
        }
        Ok(Self {
            version: bytes::le_u16(&page, 0),
            spans,
            current_lba: bytes::le_u64(&page, SEL_CURRENT_LBA),
            current_span: bytes::le_u16(&page, SEL_CURRENT_SPAN),
            flags: SelectiveFlags::from_bits_retain(bytes::le_u16(&page, SEL_FLAGS)),
            pending_time: bytes::le_u16(&page, SEL_PENDING_TIME),
            page,
        })
    }

    /// Re-encode the log for writing: spans and fields serialized back,
    /// cursor zeroed, active/pending cleared, checksum recomputed.
    pub(crate) fn encode(&mut self) -> [u8; 512] {
        bytes::put_le_u16(&mut self.page, 0, self.version);
        for (i, (start, end)) in self.spans.iter().enumerate() {
            bytes::put_le_u64(&mut self.page, 2 + i * 16, *start);
            bytes::put_le_u64(&mut self.page, 2 + i * 16 + 8, *end);
        }
        bytes::put_le_u64(&mut self.page, SEL_CURRENT_LBA, self.current_lba);
        bytes::put_le_u16(&mut self.page, SEL_CURRENT_SPAN, self.current_span);
        bytes::put_le_u16(&mut self.page, SEL_FLAGS, self.flags.bits());
        bytes::put_le_u16(&mut self.page, SEL_PENDING_TIME, self.pending_time);
        if let Some(ck) = self.page.last().copied() {
            let new = bytes::page_checksum(&self.page, ck);
            if let Some(slot) = self.page.last_mut() {
                *slot = new;
            }
        }
        self.page
    }
}

/// How one selective span argument is interpreted
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SpanMode {
    /// Explicit start-end range
    Range,
    /// Redo the span recorded in the previous log
    Redo,
    /// Test the span following the previous one
    Next,
    /// Redo after an abort, otherwise next
    Cont,
}

/// One span argument for the selective writer
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct SpanArg {
    /// Interpretation mode
    pub mode: SpanMode,
    /// Start LBA for `Range`, otherwise unused
    pub start: u64,
    /// End LBA for `Range`; for `Redo`/`Next`, a nonzero value is a size
    pub end: u64,
}

/// Off-line scan behavior after the selective test
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) enum ScanAfter {
    /// Leave the drive's current setting
    #[default]
    Keep,
    /// Disable the follow-up scan
    Off,
    /// Enable the follow-up scan
    On,
}

/// Resolve span arguments against the previous log and compute the page
/// to write. Refuses while a selective test is in progress.
pub(crate) fn build_selective_log(
    prev: &SelectiveLog,
    self_test_exec_status: u8,
    num_sectors: u64,
    args: &[SpanArg],
    scan_after: ScanAfter,
    pending_minutes: Option<u16>,
) -> Result<SelectiveLog, DeviceError> {
    if num_sectors == 0 {
        return Err(DeviceError::InvalidArgument(
            "disk size is unknown, unable to check selective self-test spans".to_owned(),
        ));
    }
    if args.is_empty() || args.len() > 5 {
        return Err(DeviceError::InvalidArgument(format!(
            "selective self-test needs 1 to 5 spans, got {}",
            args.len()
        )));
    }
    if (1..=5).contains(&prev.current_span)
        && self_test_exec_status >> 4 == EXEC_STATUS_IN_PROGRESS
    {
        return Err(DeviceError::Busy(
            "selective or other self-test already in progress".to_owned(),
        ));
    }

    let mut new = prev.clone();
    new.version = 1;
    new.spans = [(0, 0); 5];
    for (i, arg) in args.iter().enumerate() {
        let old_span = prev.spans.get(i).copied().unwrap_or((0, 0));
        let mode = if arg.mode == SpanMode::Cont {
            // redo after an abort or reset, otherwise move on
            if matches!(self_test_exec_status >> 4, 1 | 2) {
                SpanMode::Redo
            } else {
                SpanMode::Next
            }
        } else {
            arg.mode
        };
        let (mut start, mut end) = match mode {
            SpanMode::Range => (arg.start, arg.end),
            SpanMode::Redo => {
                let start = old_span.0;
                let end = if arg.end > 0 {
                    start + arg.end - 1
                } else {
                    old_span.1
                };
                (start, end)
            }
            SpanMode::Next => {
                if old_span.1 == 0 {
                    // skip empty spans
                    (0, 0)
                } else {
                    let mut start = old_span.1 + 1;
                    if start >= num_sectors {
                        start = 0; // wrap around
                    }
                    let end = if arg.end > 0 {
                        start + arg.end - 1
                    } else {
                        let old_size = old_span.1 - old_span.0 + 1;
                        let mut end = start + old_size - 1;
                        if end >= num_sectors {
                            // redistribute so future rotations keep equal sizes
                            let spans = num_sectors.div_ceil(old_size);
                            let new_size = num_sectors.div_ceil(spans);
                            let new_start = num_sectors - new_size;
                            log::info!(
                                "Span {i} changed from {start}-{end} ({old_size} sectors) to {new_start}-{} ({new_size} sectors, {spans} spans)",
                                num_sectors - 1
                            );
                            start = new_start;
                            end = num_sectors - 1;
                        }
                        end
                    };
                    (start, end)
                }
            }
            SpanMode::Cont => unreachable!("resolved above"),
        };
        if mode == SpanMode::Next && start == 0 && end == 0 {
            continue;
        }
        // clip to disk size; "-max" shorthand arrives as u64::MAX
        if start < num_sectors && num_sectors <= end {
            if end != u64::MAX {
                log::info!("Size of self-test span {i} decreased according to disk size");
            }
            end = num_sectors - 1;
        }
        if !(start <= end && end < num_sectors) {
            return Err(DeviceError::InvalidArgument(format!(
                "invalid selective self-test span {i}: {start}-{end} ({num_sectors} sectors)"
            )));
        }
        if let Some(span) = new.spans.get_mut(i) {
            *span = (start, end);
        }
    }

    // host must zero the cursor before initiating a selective test
    new.current_lba = 0;
    new.current_span = 0;
    match scan_after {
        ScanAfter::Keep => {}
        ScanAfter::Off => new.flags.remove(SelectiveFlags::DO_SCAN_AFTER),
        ScanAfter::On => new.flags.insert(SelectiveFlags::DO_SCAN_AFTER),
    }
    new.flags.remove(SelectiveFlags::ACTIVE | SelectiveFlags::PENDING);
    if let Some(minutes) = pending_minutes {
        new.pending_time = minutes.saturating_sub(1);
    }
    Ok(new)
}

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::indexing_slicing)]
pub(crate) mod tests {
    use super::*;

    /// Build a self-test log page from (subtest, status byte, hour, lba) rows,
    /// oldest first
    pub(crate) fn selftest_page(rows: &[(u8, u8, u16, u32)]) -> Vec<u8> {
        let mut page = vec![0_u8; 512];
        bytes::put_le_u16(&mut page, 0, 1);
        for (i, (subtest, status, hour, lba)) in rows.iter().enumerate() {
            let off = 2 + i * SELFTEST_ENTRY_SIZE;
            page[off] = *subtest;
            page[off + 1] = *status;
            bytes::put_le_u16(&mut page, off + 2, *hour);
            page[off + 5..off + 9].copy_from_slice(&lba.to_le_bytes());
        }
        page[508] = u8::try_from(rows.len()).unwrap();
        page[511] = bytes::page_checksum(&page, page[511]);
        page
    }

    /// Build an empty selective log for a given span set
    pub(crate) fn selective_page(spans: &[(u64, u64)]) -> Vec<u8> {
        let mut page = vec![0_u8; 512];
        bytes::put_le_u16(&mut page, 0, 1);
        for (i, (start, end)) in spans.iter().enumerate() {
            bytes::put_le_u64(&mut page, 2 + i * 16, *start);
            bytes::put_le_u64(&mut page, 2 + i * 16 + 8, *end);
        }
        page[511] = bytes::page_checksum(&page, page[511]);
        page
    }

    #[test]
    fn empty_log_yields_no_entries() {
        let page = selftest_page(&[]);
        let log = decode_selftest_log(&page, &ProtocolPolicy::default()).unwrap();
        assert!(log.entries.is_empty());
        assert_eq!(log.error_count_and_hour(), (0, 0));
    }

    #[test]
    fn ring_is_walked_most_recent_first() {
        let page = selftest_page(&[
            (1, 0x00, 100, 0), // short, ok
            (2, 0x70, 200, 12345), // extended, read failure
            (1, 0x00, 300, 0),
        ]);
        let log = decode_selftest_log(&page, &ProtocolPolicy::default()).unwrap();
        assert_eq!(log.entries.len(), 3);
        assert_eq!(log.entries[0].hour, 300);
        assert_eq!(log.entries[2].hour, 100);
        let failure = &log.entries[1];
        assert_eq!(failure.status, SelfTestStatus::Read);
        assert_eq!(failure.failing_lba, Some(12345));
        assert_eq!(log.error_count_and_hour(), (1, 200));
    }

    #[test]
    fn remaining_percent_from_low_nibble() {
        let page = selftest_page(&[(1, 0xf4, 50, 0)]);
        let log = decode_selftest_log(&page, &ProtocolPolicy::default()).unwrap();
        assert_eq!(log.entries[0].status, SelfTestStatus::InProgress);
        assert_eq!(log.entries[0].remaining_pct, 40);
    }

    #[test]
    fn ext_log_decodes_48bit_lba() {
        let mut sectors = vec![0_u8; 512];
        sectors[0] = 1;
        bytes::put_le_u16(&mut sectors, 2, 2); // index: 2 descriptors used
        for (i, (status, hour)) in [(0x00_u8, 10_u16), (0x60, 20)].iter().enumerate() {
            let off = 4 + i * EXT_DESC_SIZE;
            sectors[off] = 2;
            sectors[off + 1] = *status;
            bytes::put_le_u16(&mut sectors, off + 2, *hour);
            sectors[off + 5..off + 11].copy_from_slice(&[0, 0, 0, 0, 0x01, 0]);
        }
        sectors[511] = bytes::page_checksum(&sectors, sectors[511]);
        let log = decode_ext_selftest_log(&sectors, &ProtocolPolicy::default()).unwrap();
        assert_eq!(log.entries.len(), 2);
        assert_eq!(log.entries[0].hour, 20);
        assert_eq!(log.entries[0].status, SelfTestStatus::ServoSeek);
        assert_eq!(log.entries[0].failing_lba, Some(0x01_0000_0000));
        assert_eq!(log.entries[1].failing_lba, None);
    }

    #[test]
    fn selective_round_trips_through_encode() {
        let page = selective_page(&[(100, 200), (300, 400)]);
        let mut log = SelectiveLog::decode(&page, &ProtocolPolicy::default()).unwrap();
        assert_eq!(log.spans[0], (100, 200));
        assert_eq!(log.spans[1], (300, 400));
        let encoded = log.encode();
        assert_eq!(bytes::page_sum(&encoded), 0);
        let again = SelectiveLog::decode(&encoded, &ProtocolPolicy::default()).unwrap();
        assert_eq!(again.spans, log.spans);
    }

    #[test]
    fn next_span_wraps_at_end_of_disk() {
        // literal scenario: span 4 was the tail of a 1e9 sector disk
        let page = selective_page(&[
            (0, 0),
            (0, 0),
            (0, 0),
            (900_000_000, 999_999_999),
            (0, 0),
        ]);
        let prev = SelectiveLog::decode(&page, &ProtocolPolicy::default()).unwrap();
        let args = [
            SpanArg { mode: SpanMode::Next, start: 0, end: 0 },
            SpanArg { mode: SpanMode::Next, start: 0, end: 0 },
            SpanArg { mode: SpanMode::Next, start: 0, end: 0 },
            SpanArg { mode: SpanMode::Next, start: 0, end: 0 },
        ];
        let new = build_selective_log(&prev, 0x00, 1_000_000_000, &args, ScanAfter::Keep, None)
            .unwrap();
        assert_eq!(new.spans[3], (0, 99_999_999));
        // empty spans stay empty
        assert_eq!(new.spans[0], (0, 0));
    }

    #[test]
    fn next_span_redistributes_when_overrunning() {
        let page = selective_page(&[(600, 899)]);
        let prev = SelectiveLog::decode(&page, &ProtocolPolicy::default()).unwrap();
        let args = [SpanArg { mode: SpanMode::Next, start: 0, end: 0 }];
        let new = build_selective_log(&prev, 0x00, 1000, &args, ScanAfter::Keep, None).unwrap();
        // 1000 sectors / size 300 -> 4 spans of 250, rotated to the tail
        assert_eq!(new.spans[0], (750, 999));
    }

    #[test]
    fn cont_redoes_after_abort_and_advances_otherwise() {
        let page = selective_page(&[(100, 199)]);
        let prev = SelectiveLog::decode(&page, &ProtocolPolicy::default()).unwrap();
        let args = [SpanArg { mode: SpanMode::Cont, start: 0, end: 0 }];
        // aborted by host -> redo
        let redo = build_selective_log(&prev, 0x10, 100_000, &args, ScanAfter::Keep, None).unwrap();
        assert_eq!(redo.spans[0], (100, 199));
        // completed -> next
        let next = build_selective_log(&prev, 0x00, 100_000, &args, ScanAfter::Keep, None).unwrap();
        assert_eq!(next.spans[0], (200, 299));
    }

    #[test]
    fn one_lba_span_and_max_shorthand() {
        let page = selective_page(&[]);
        let prev = SelectiveLog::decode(&page, &ProtocolPolicy::default()).unwrap();
        let args = [
            SpanArg { mode: SpanMode::Range, start: 42, end: 42 },
            SpanArg { mode: SpanMode::Range, start: 100, end: u64::MAX },
        ];
        let new = build_selective_log(&prev, 0x00, 1000, &args, ScanAfter::Keep, None).unwrap();
        assert_eq!(new.spans[0], (42, 42));
        assert_eq!(new.spans[1], (100, 999));
    }

    #[test]
    fn refused_while_test_in_progress() {
        let page = selective_page(&[(0, 100)]);
        let mut prev = SelectiveLog::decode(&page, &ProtocolPolicy::default()).unwrap();
        prev.current_span = 1;
        let args = [SpanArg { mode: SpanMode::Range, start: 0, end: 100 }];
        assert!(matches!(
            build_selective_log(&prev, 0xf5, 1000, &args, ScanAfter::Keep, None),
            Err(DeviceError::Busy(_))
        ));
    }

    #[test]
    fn zero_disk_size_is_invalid() {
        let page = selective_page(&[]);
        let prev = SelectiveLog::decode(&page, &ProtocolPolicy::default()).unwrap();
        let args = [SpanArg { mode: SpanMode::Range, start: 0, end: 10 }];
        assert!(matches!(
            build_selective_log(&prev, 0x00, 0, &args, ScanAfter::Keep, None),
            Err(DeviceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn out_of_range_span_is_invalid() {
        let page = selective_page(&[]);
        let prev = SelectiveLog::decode(&page, &ProtocolPolicy::default()).unwrap();
        let args = [SpanArg { mode: SpanMode::Range, start: 2000, end: 2100 }];
        assert!(matches!(
            build_selective_log(&prev, 0x00, 1000, &args, ScanAfter::Keep, None),
            Err(DeviceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn writer_clears_progress_and_flags() {
        let page = selective_page(&[(0, 100)]);
        let mut prev = SelectiveLog::decode(&page, &ProtocolPolicy::default()).unwrap();
        prev.current_lba = 55;
        prev.flags = SelectiveFlags::ACTIVE | SelectiveFlags::PENDING;
        let args = [SpanArg { mode: SpanMode::Range, start: 0, end: 100 }];
        let new =
            build_selective_log(&prev, 0x00, 1000, &args, ScanAfter::On, Some(60)).unwrap();
        assert_eq!(new.current_lba, 0);
        assert_eq!(new.current_span, 0);
        assert!(!new.flags.contains(SelectiveFlags::ACTIVE));
        assert!(!new.flags.contains(SelectiveFlags::PENDING));
        assert!(new.flags.contains(SelectiveFlags::DO_SCAN_AFTER));
        assert_eq!(new.pending_time, 59);
    }
}
