//! SCSI health reporting: informational exceptions, log pages, mode page 0x1C

use super::{ASC_IMPENDING_FAILURE, SenseInfo};
use crate::{bytes, error::DeviceError};

/// Informational exceptions log page
pub(crate) const PAGE_IE: u8 = 0x2f;
/// Temperature log page
pub(crate) const PAGE_TEMPERATURE: u8 = 0x0d;
/// Start-stop cycle counter log page
pub(crate) const PAGE_START_STOP: u8 = 0x0e;
/// Self-test results log page
pub(crate) const PAGE_SELF_TEST: u8 = 0x10;
/// TapeAlert log page
pub(crate) const PAGE_TAPE_ALERT: u8 = 0x2e;
/// Informational exceptions control mode page
pub(crate) const MODE_PAGE_IEC: u8 = 0x1c;

/// Health state reported through informational exceptions
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum IeHealth {
    /// No exception reported
    Ok,
    /// Impending failure, with the decoded failure class
    Failing(String),
}

/// Decoded informational exceptions log page
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct IePage {
    /// Additional sense code
    pub asc: u8,
    /// Additional sense code qualifier
    pub ascq: u8,
    /// Most recent temperature, when the page carries one
    pub current_temp: Option<u8>,
    /// Trip temperature, when the page carries one
    pub trip_temp: Option<u8>,
}

impl IePage {
    /// Decode log page 0x2F. Bytes 8 and 9 carry asc/ascq; a page
    /// length of 8 additionally carries current and trip temperature.
    pub(crate) fn decode(page: &[u8]) -> Result<Self, DeviceError> {
        if page.first().map(|b| b & 0x3f) != Some(PAGE_IE) {
            return Err(DeviceError::Protocol(format!(
                "expected log page {PAGE_IE:#04x}, got {:#04x}",
                page.first().copied().unwrap_or(0)
            )));
        }
        let param_len = page.get(7).copied().unwrap_or(0);
        let temps = param_len >= 8;
        Ok(Self {
            asc: page.get(8).copied().unwrap_or(0),
            ascq: page.get(9).copied().unwrap_or(0),
            current_temp: temps.then(|| page.get(10).copied()).flatten(),
            trip_temp: temps.then(|| page.get(11).copied()).flatten(),
        })
    }

    /// Health verdict from the reported asc/ascq
    pub(crate) fn health(&self) -> IeHealth {
        if self.asc == ASC_IMPENDING_FAILURE {
            IeHealth::Failing(failure_class(self.ascq).to_owned())
        } else {
            IeHealth::Ok
        }
    }
}

/// Health verdict from deferred sense, the Request Sense fallback path
pub(crate) fn health_from_sense(sense: &SenseInfo) -> IeHealth {
    if sense.asc == ASC_IMPENDING_FAILURE {
        IeHealth::Failing(failure_class(sense.ascq).to_owned())
    } else {
        IeHealth::Ok
    }
}

/// Human-readable failure class for asc 0x5D.
/// The qualifier encodes a failure family in the high nibble and a
/// subreason in the low nibble.
pub(crate) fn failure_class(ascq: u8) -> String {
    let family = match ascq >> 4 {
        0x1 => Some("Hardware impending failure"),
        0x2 => Some("Controller impending failure"),
        0x3 => Some("Data channel impending failure"),
        0x4 => Some("Servo impending failure"),
        0x5 => Some("Spindle impending failure"),
        0x6 => Some("Firmware impending failure"),
        _ => None,
    };
    if let Some(family) = family {
        let sub = match ascq & 0x0f {
            0x0 => "general hard drive failure",
            0x1 => "drive error rate too high",
            0x2 => "data error rate too high",
            0x3 => "seek error rate too high",
            0x4 => "too many block reassigns",
            0x5 => "access times too high",
            0x6 => "start unit times too high",
            0x7 => "channel parametrics",
            0x8 => "controller detected",
            0x9 => "throughput performance",
            0xa => "seek time performance",
            0xb => "spin-up retry count",
            0xc => "drive calibration retry count",
            _ => "reserved subreason",
        };
        return format!("{family} {sub}");
    }
    match ascq {
        0x00 => "Failure prediction threshold exceeded".to_owned(),
        0x01 => "Media failure prediction threshold exceeded".to_owned(),
        0x02 => "Logical unit failure prediction threshold exceeded".to_owned(),
        0x03 => "Spare area exhaustion prediction threshold exceeded".to_owned(),
        0xff => "Failure prediction threshold exceeded (false)".to_owned(),
        other => format!("Unknown failure prediction qualifier {other:#04x}"),
    }
}

/// One log page parameter: code and data bytes
struct LogParameter<'b> {
    /// Parameter code
    code: u16,
    /// Parameter data
    data: &'b [u8],
}

/// Iterate the parameters of a log page
fn log_parameters(page: &[u8]) -> impl Iterator<Item = LogParameter<'_>> {
    let total = usize::from(bytes::be_u16(page, 2)).min(page.len().saturating_sub(4));
    let mut pos = 4;
    let end = 4 + total;
    std::iter::from_fn(move || {
        if pos + 4 > end {
            return None;
        }
        let code = bytes::be_u16(page, pos);
        let len = usize::from(*page.get(pos + 3)?);
        let data = page.get(pos + 4..(pos + 4 + len).min(end))?;
        pos += 4 + len;
        Some(LogParameter { code, data })
    })
}

/// Current and reference temperature from log page 0x0D.
/// 0 and 255 mean the drive could not supply a reading.
pub(crate) fn decode_temperature_page(page: &[u8]) -> Result<(Option<u8>, Option<u8>), DeviceError> {
    if page.first().map(|b| b & 0x3f) != Some(PAGE_TEMPERATURE) {
        return Err(DeviceError::Protocol(
            "not a temperature log page".to_owned(),
        ));
    }
    let mut current = None;
    let mut reference = None;
    let valid = |t: u8| (t != 0 && t != 255).then_some(t);
    for param in log_parameters(page) {
        match param.code {
            0x0000 => current = param.data.get(1).copied().and_then(valid),
            0x0001 => reference = param.data.get(1).copied().and_then(valid),
            _ => {}
        }
    }
    Ok((current, reference))
}

/// Start-stop cycle counters from log page 0x0E
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct StartStopCounters {
    /// Week and year of manufacture, as printed on the label
    pub manufacture_date: Option<String>,
    /// Specified cycle count over device lifetime
    pub specified_cycles: Option<u32>,
    /// Accumulated start-stop cycles
    pub accumulated_cycles: Option<u32>,
}

/// Decode log page 0x0E
pub(crate) fn decode_start_stop_page(page: &[u8]) -> Result<StartStopCounters, DeviceError> {
    if page.first().map(|b| b & 0x3f) != Some(PAGE_START_STOP) {
        return Err(DeviceError::Protocol(
            "not a start-stop cycle counter page".to_owned(),
        ));
    }
    let mut counters = StartStopCounters::default();
    for param in log_parameters(page) {
        match param.code {
            0x0001 => {
                if param.data.len() >= 6 {
                    let year = String::from_utf8_lossy(param.data.get(0..4).unwrap_or_default());
                    let week = String::from_utf8_lossy(param.data.get(4..6).unwrap_or_default());
                    counters.manufacture_date = Some(format!("week {week} of {year}"));
                }
            }
            0x0003 => counters.specified_cycles = Some(bytes::be_u16(param.data, 0).into()),
            0x0004 => counters.accumulated_cycles = Some(bytes::be_u16(param.data, 0).into()),
            _ => {}
        }
    }
    Ok(counters)
}

/// One self-test result from log page 0x10
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ScsiSelfTestResult {
    /// Parameter code, 1 is the most recent test
    pub index: u16,
    /// Self-test code bits (what was run)
    pub code: u8,
    /// Result nibble, 0 = completed without error
    pub result: u8,
    /// Accumulated power-on hours at test time
    pub hour: u16,
    /// First failing LBA, all-ones when none
    pub failing_lba: Option<u64>,
    /// Sense key / asc / ascq recorded for a failure
    pub sense: (u8, u8, u8),
}

impl ScsiSelfTestResult {
    /// Did this entry record a failure?
    pub(crate) fn is_failure(&self) -> bool {
        matches!(self.result, 0x3..=0x7)
    }
}

/// Decode log page 0x10, most recent result first
pub(crate) fn decode_self_test_page(
    page: &[u8],
) -> Result<Vec<ScsiSelfTestResult>, DeviceError> {
    if page.first().map(|b| b & 0x3f) != Some(PAGE_SELF_TEST) {
        return Err(DeviceError::Protocol(
            "not a self-test results page".to_owned(),
        ));
    }
    let mut results = Vec::new();
    for param in log_parameters(page) {
        if !(1..=20).contains(&param.code) || param.data.len() < 16 {
            continue;
        }
        let byte0 = param.data.first().copied().unwrap_or(0);
        let result = byte0 & 0x0f;
        let code = byte0 >> 5;
        // an unused slot is all zero with timestamp zero
        let hour = bytes::be_u16(param.data, 2);
        if byte0 == 0 && hour == 0 {
            continue;
        }
        let lba = {
            let mut val = [0_u8; 8];
            if let Some(src) = param.data.get(4..12) {
                val.copy_from_slice(src);
            }
            u64::from_be_bytes(val)
        };
        results.push(ScsiSelfTestResult {
            index: param.code,
            code,
            result,
            hour,
            failing_lba: (lba != u64::MAX).then_some(lba),
            sense: (
                param.data.get(12).copied().unwrap_or(0) & 0x0f,
                param.data.get(13).copied().unwrap_or(0),
                param.data.get(14).copied().unwrap_or(0),
            ),
        });
    }
    results.sort_by_key(|r| r.index);
    Ok(results)
}

/// Active TapeAlert flags from log page 0x2E
pub(crate) fn decode_tape_alert_page(page: &[u8]) -> Result<Vec<u8>, DeviceError> {
    if page.first().map(|b| b & 0x3f) != Some(PAGE_TAPE_ALERT) {
        return Err(DeviceError::Protocol("not a TapeAlert page".to_owned()));
    }
    let mut active = Vec::new();
    for param in log_parameters(page) {
        if (1..=64).contains(&param.code) && param.data.first().is_some_and(|f| *f != 0) {
            active.push((param.code & 0xff) as u8);
        }
    }
    Ok(active)
}

/// Informational exceptions control mode page, with the surrounding
/// mode buffer retained so it can be written back with MODE SELECT
#[derive(Clone, Debug)]
pub(crate) struct IecModePage {
    /// Full MODE SENSE (6) response
    buf: Vec<u8>,
    /// Offset of the page inside the buffer
    page_offset: usize,
}

impl IecModePage {
    /// Locate page 0x1C in a MODE SENSE (6) response.
    /// A readable page is how "SMART supported" is reported.
    pub(crate) fn from_mode6(buf: &[u8]) -> Result<Self, DeviceError> {
        let block_len = usize::from(buf.get(3).copied().unwrap_or(0));
        Self::at_offset(buf, 4 + block_len)
    }

    /// Locate page 0x1C in a MODE SENSE (10) response
    pub(crate) fn from_mode10(buf: &[u8]) -> Result<Self, DeviceError> {
        let block_len = usize::from(crate::bytes::be_u16(buf, 6));
        Self::at_offset(buf, 8 + block_len)
    }

    /// Common lookup once the header size is known
    fn at_offset(buf: &[u8], page_offset: usize) -> Result<Self, DeviceError> {
        let page_code = buf.get(page_offset).map(|b| b & 0x3f);
        if page_code != Some(MODE_PAGE_IEC) {
            return Err(DeviceError::Unsupported(
                "informational exceptions mode page not present".to_owned(),
            ));
        }
        Ok(Self {
            buf: buf.to_vec(),
            page_offset,
        })
    }

    /// Byte 2 of the page, holding DEXCPT and EWASC
    fn control_byte(&self) -> u8 {
        self.buf.get(self.page_offset + 2).copied().unwrap_or(0)
    }

    /// Exception reporting enabled? (DEXCPT bit 3 clear)
    pub(crate) fn reporting_enabled(&self) -> bool {
        self.control_byte() & 0x08 == 0
    }

    /// Temperature warnings enabled? (EWASC bit 4)
    pub(crate) fn temperature_warnings_enabled(&self) -> bool {
        self.control_byte() & 0x10 != 0
    }

    /// Reporting method field (MRIE)
    pub(crate) fn mrie(&self) -> u8 {
        self.buf.get(self.page_offset + 3).copied().unwrap_or(0) & 0x0f
    }

    /// Set or clear DEXCPT, returning the buffer for MODE SELECT.
    /// The layout of the sensed page is preserved.
    pub(crate) fn with_reporting(mut self, enabled: bool) -> Vec<u8> {
        if let Some(ctrl) = self.buf.get_mut(self.page_offset + 2) {
            if enabled {
                *ctrl &= !0x08;
            } else {
                *ctrl |= 0x08;
            }
        }
        self.buf
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::indexing_slicing)]
pub(crate) mod tests {
    use super::*;

    /// Build an IE log page reporting the given asc/ascq and temps
    pub(crate) fn ie_page(asc: u8, ascq: u8, temps: Option<(u8, u8)>) -> Vec<u8> {
        let mut page = vec![0_u8; 12];
        page[0] = PAGE_IE;
        page[3] = 8; // page length
        page[6] = 0x03; // parameter control
        page[7] = if temps.is_some() { 8 } else { 4 };
        page[8] = asc;
        page[9] = ascq;
        if let Some((current, trip)) = temps {
            page[10] = current;
            page[11] = trip;
        }
        page
    }

    #[test]
    fn ie_ok() {
        let page = ie_page(0, 0, Some((33, 65)));
        let ie = IePage::decode(&page).unwrap();
        assert_eq!(ie.health(), IeHealth::Ok);
        assert_eq!(ie.current_temp, Some(33));
        assert_eq!(ie.trip_temp, Some(65));
    }

    #[test]
    fn ie_failing_with_class() {
        let page = ie_page(0x5d, 0x43, None);
        let ie = IePage::decode(&page).unwrap();
        match ie.health() {
            IeHealth::Failing(class) => {
                assert_eq!(class, "Servo impending failure seek error rate too high");
            }
            IeHealth::Ok => panic!("expected failing"),
        }
        assert_eq!(ie.current_temp, None);
    }

    #[test]
    fn failure_classes() {
        assert_eq!(failure_class(0x00), "Failure prediction threshold exceeded");
        assert_eq!(
            failure_class(0x10),
            "Hardware impending failure general hard drive failure"
        );
        assert_eq!(
            failure_class(0x6b),
            "Firmware impending failure spin-up retry count"
        );
        assert_eq!(
            failure_class(0xff),
            "Failure prediction threshold exceeded (false)"
        );
    }

    #[test]
    fn deferred_sense_health() {
        let sense = SenseInfo {
            response_code: 0x71,
            key: 0,
            asc: 0x5d,
            ascq: 0x32,
        };
        assert!(matches!(health_from_sense(&sense), IeHealth::Failing(_)));
        let ok = SenseInfo::default();
        assert_eq!(health_from_sense(&ok), IeHealth::Ok);
    }

    #[test]
    fn temperature_page_decode() {
        let mut page = vec![0_u8; 16];
        page[0] = PAGE_TEMPERATURE;
        page[3] = 12;
        // param 0: temperature 38
        page[4..8].copy_from_slice(&[0x00, 0x00, 0x00, 0x02]);
        page[8] = 0;
        page[9] = 38;
        // param 1: reference 60
        page[10..14].copy_from_slice(&[0x00, 0x01, 0x00, 0x02]);
        page[14] = 0;
        page[15] = 60;
        let (current, reference) = decode_temperature_page(&page).unwrap();
        assert_eq!(current, Some(38));
        assert_eq!(reference, Some(60));
    }

    #[test]
    fn temperature_255_means_unreadable() {
        let mut page = vec![0_u8; 10];
        page[0] = PAGE_TEMPERATURE;
        page[3] = 6;
        page[4..8].copy_from_slice(&[0x00, 0x00, 0x00, 0x02]);
        page[9] = 255;
        let (current, _) = decode_temperature_page(&page).unwrap();
        assert_eq!(current, None);
    }

    #[test]
    fn self_test_page_decode() {
        let mut page = vec![0_u8; 4 + 20];
        page[0] = PAGE_SELF_TEST;
        page[3] = 20;
        page[4..8].copy_from_slice(&[0x00, 0x01, 0x00, 0x10]);
        page[8] = (1 << 5) | 0x3; // background short, failure
        bytes_put_be16(&mut page, 10, 1234);
        page[12..20].copy_from_slice(&0x1122_u64.to_be_bytes());
        page[20] = 0x04;
        page[21] = 0x5d;
        let results = decode_self_test_page(&page).unwrap();
        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.code, 1);
        assert!(result.is_failure());
        assert_eq!(result.hour, 1234);
        assert_eq!(result.failing_lba, Some(0x1122));
        assert_eq!(result.sense.0, 0x04);
    }

    #[test]
    fn self_test_page_skips_empty_slots() {
        let mut page = vec![0_u8; 4 + 40];
        page[0] = PAGE_SELF_TEST;
        page[3] = 40;
        page[4..8].copy_from_slice(&[0x00, 0x01, 0x00, 0x10]);
        // first slot empty, second used
        page[24..28].copy_from_slice(&[0x00, 0x02, 0x00, 0x10]);
        page[28] = 1 << 5;
        bytes_put_be16(&mut page, 30, 99);
        page[32..40].copy_from_slice(&u64::MAX.to_be_bytes());
        let results = decode_self_test_page(&page).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].index, 2);
        assert_eq!(results[0].failing_lba, None);
    }

    #[test]
    fn tape_alert_flags() {
        let mut page = vec![0_u8; 4 + 10];
        page[0] = PAGE_TAPE_ALERT;
        page[3] = 10;
        page[4..8].copy_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        page[8] = 0;
        page[9..13].copy_from_slice(&[0x00, 0x03, 0x00, 0x01]);
        page[13] = 1;
        let active = decode_tape_alert_page(&page).unwrap();
        assert_eq!(active, vec![3]);
    }

    #[test]
    fn iec_mode_page_bits() {
        // 4-byte header, no block descriptors, page 0x1c
        let buf = vec![0x0e, 0, 0, 0, 0x9c, 0x0a, 0x08, 0x04, 0, 0, 0, 0, 0, 0];
        let page = IecModePage::from_mode6(&buf).unwrap();
        assert!(!page.reporting_enabled()); // DEXCPT set
        assert!(!page.temperature_warnings_enabled());
        assert_eq!(page.mrie(), 4);
        let enabled = page.with_reporting(true);
        assert_eq!(enabled[6] & 0x08, 0);
    }

    #[test]
    fn iec_mode_page_from_mode10() {
        // 8-byte header, no block descriptors, page 0x1c with EWASC
        let buf = vec![0, 0x0e, 0, 0, 0, 0, 0, 0, 0x1c, 0x0a, 0x10, 0, 0, 0];
        let page = IecModePage::from_mode10(&buf).unwrap();
        assert!(page.reporting_enabled());
        assert!(page.temperature_warnings_enabled());
    }

    #[test]
    fn iec_mode_page_missing() {
        let buf = vec![0x0e, 0, 0, 0, 0x08, 0x0a, 0, 0, 0, 0];
        assert!(matches!(
            IecModePage::from_mode6(&buf),
            Err(DeviceError::Unsupported(_))
        ));
    }

    /// Write a big-endian u16 (test helper)
    fn bytes_put_be16(buf: &mut [u8], offset: usize, val: u16) {
        buf[offset..offset + 2].copy_from_slice(&val.to_be_bytes());
    }
}
