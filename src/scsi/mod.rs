//! SCSI command encoding and sense decoding

pub(crate) mod health;

use std::time::Duration;

use crate::{dev::port::Port, error::DeviceError};

/// INQUIRY opcode
const OP_INQUIRY: u8 = 0x12;
/// TEST UNIT READY opcode
const OP_TEST_UNIT_READY: u8 = 0x00;
/// REQUEST SENSE opcode
const OP_REQUEST_SENSE: u8 = 0x03;
/// LOG SENSE opcode
const OP_LOG_SENSE: u8 = 0x4d;
/// MODE SENSE (6) opcode
const OP_MODE_SENSE_6: u8 = 0x1a;
/// MODE SELECT (6) opcode
const OP_MODE_SELECT_6: u8 = 0x15;
/// MODE SENSE (10) opcode
const OP_MODE_SENSE_10: u8 = 0x5a;
/// MODE SELECT (10) opcode
const OP_MODE_SELECT_10: u8 = 0x55;
/// SEND DIAGNOSTIC opcode
const OP_SEND_DIAGNOSTIC: u8 = 0x1d;

/// Default command timeout
pub(crate) const TIMEOUT_DEFAULT: Duration = Duration::from_secs(60);
/// Timeout for foreground self-tests, which block until completion
const TIMEOUT_SELF_TEST: Duration = Duration::from_secs(2 * 60 * 60);

/// Maximum sense data we ask the kernel for
pub(crate) const MAX_SENSE_LEN: usize = 32;

/// Data transfer direction of one command
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) enum Direction {
    /// No data phase
    #[default]
    None,
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// One SCSI command round trip: CDB in, data + sense + status out
#[derive(Debug)]
pub(crate) struct ScsiCmd<'b> {
    /// Command descriptor block (6, 10, 12 or 16 bytes)
    pub cdb: Vec<u8>,
    /// Data phase direction
    pub direction: Direction,
    /// Data buffer for the in/out phase
    pub data: &'b mut [u8],
    /// Command timeout
    pub timeout: Duration,
    /// Inbound sense buffer, filled by the port
    pub sense: [u8; MAX_SENSE_LEN],
    /// Valid bytes in `sense`
    pub sense_len: usize,
    /// SCSI status byte
    pub status: u8,
}

impl<'b> ScsiCmd<'b> {
    /// Build a command with the default timeout
    pub(crate) fn new(cdb: Vec<u8>, direction: Direction, data: &'b mut [u8]) -> Self {
        Self {
            cdb,
            direction,
            data,
            timeout: TIMEOUT_DEFAULT,
            sense: [0; MAX_SENSE_LEN],
            sense_len: 0,
            status: 0,
        }
    }

    /// Dissect the returned sense data, if any
    pub(crate) fn sense_info(&self) -> Option<SenseInfo> {
        self.sense
            .get(..self.sense_len)
            .and_then(SenseInfo::dissect)
    }
}

/// Common projection of fixed and descriptor format sense data
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct SenseInfo {
    /// Response code (0x70/0x71 fixed, 0x72/0x73 descriptor)
    pub response_code: u8,
    /// Sense key
    pub key: u8,
    /// Additional sense code
    pub asc: u8,
    /// Additional sense code qualifier
    pub ascq: u8,
}

/// Sense key: not ready
pub(crate) const SENSE_KEY_NOT_READY: u8 = 0x2;
/// Sense key: medium error
pub(crate) const SENSE_KEY_MEDIUM_ERROR: u8 = 0x3;
/// ASC reported for an impending-failure informational exception
pub(crate) const ASC_IMPENDING_FAILURE: u8 = 0x5d;

impl SenseInfo {
    /// Project raw sense bytes onto the common tuple.
    /// Accepts both fixed (0x70/0x71) and descriptor (0x72/0x73) formats.
    pub(crate) fn dissect(sense: &[u8]) -> Option<Self> {
        let response_code = sense.first()? & 0x7f;
        match response_code {
            0x70 | 0x71 => Some(Self {
                response_code,
                key: sense.get(2)? & 0x0f,
                asc: sense.get(12).copied().unwrap_or(0),
                ascq: sense.get(13).copied().unwrap_or(0),
            }),
            0x72 | 0x73 => Some(Self {
                response_code,
                key: sense.get(1)? & 0x0f,
                asc: sense.get(2).copied().unwrap_or(0),
                ascq: sense.get(3).copied().unwrap_or(0),
            }),
            _ => None,
        }
    }

    /// Does this sense report an actionable error?
    pub(crate) fn is_error(&self) -> bool {
        // no sense / recovered error are success
        !matches!(self.key, 0x0 | 0x1)
    }
}

/// Find the first descriptor of the given type in descriptor-format sense data
pub(crate) fn sense_descriptor(sense: &[u8], desc_type: u8) -> Option<&[u8]> {
    let response_code = sense.first()? & 0x7f;
    if !matches!(response_code, 0x72 | 0x73) {
        return None;
    }
    let add_len = *sense.get(7)? as usize;
    let descriptors = sense.get(8..(8 + add_len).min(sense.len()))?;
    let mut pos = 0;
    while pos + 2 <= descriptors.len() {
        let dtype = *descriptors.get(pos)?;
        let dlen = *descriptors.get(pos + 1)? as usize;
        let end = pos + 2 + dlen;
        if dtype == desc_type {
            return descriptors.get(pos..end.min(descriptors.len()));
        }
        pos = end;
    }
    None
}

/// Run a command and fail on error sense
fn run_checked(port: &mut dyn Port, cmd: &mut ScsiCmd<'_>, what: &str) -> Result<(), DeviceError> {
    port.scsi_pass_through(cmd)?;
    if let Some(sense) = cmd.sense_info() {
        if sense.is_error() {
            return Err(DeviceError::Io(format!(
                "{what}: sense key {:#x}, asc/ascq {:#04x}/{:#04x}",
                sense.key, sense.asc, sense.ascq
            )));
        }
    }
    Ok(())
}

/// Standard INQUIRY into `buf` (usually 36, retried at 64 for picky bridges)
pub(crate) fn inquiry(port: &mut dyn Port, buf: &mut [u8]) -> Result<(), DeviceError> {
    let len = buf.len();
    let cdb = vec![
        OP_INQUIRY,
        0,
        0,
        u8::try_from(len >> 8).unwrap_or(0),
        (len & 0xff) as u8,
        0,
    ];
    let mut cmd = ScsiCmd::new(cdb, Direction::In, buf);
    run_checked(port, &mut cmd, "INQUIRY")
}

/// Vital product data INQUIRY for one page
pub(crate) fn inquiry_vpd(port: &mut dyn Port, page: u8, buf: &mut [u8]) -> Result<(), DeviceError> {
    let len = buf.len();
    let cdb = vec![
        OP_INQUIRY,
        0x01, // EVPD
        page,
        u8::try_from(len >> 8).unwrap_or(0),
        (len & 0xff) as u8,
        0,
    ];
    let mut cmd = ScsiCmd::new(cdb, Direction::In, buf);
    run_checked(port, &mut cmd, "INQUIRY VPD")
}

/// TEST UNIT READY; returns the sense reported when the unit is not ready
pub(crate) fn test_unit_ready(port: &mut dyn Port) -> Result<Option<SenseInfo>, DeviceError> {
    let mut cmd = ScsiCmd::new(vec![OP_TEST_UNIT_READY, 0, 0, 0, 0, 0], Direction::None, &mut []);
    port.scsi_pass_through(&mut cmd)?;
    Ok(cmd.sense_info().filter(SenseInfo::is_error))
}

/// REQUEST SENSE into `buf`
pub(crate) fn request_sense(port: &mut dyn Port, buf: &mut [u8]) -> Result<(), DeviceError> {
    let len = (buf.len() & 0xff) as u8;
    let cdb = vec![OP_REQUEST_SENSE, 0, 0, 0, len, 0];
    let mut cmd = ScsiCmd::new(cdb, Direction::In, buf);
    run_checked(port, &mut cmd, "REQUEST SENSE")
}

/// LOG SENSE for one page, PC=1 (current cumulative values)
pub(crate) fn log_sense(port: &mut dyn Port, page: u8, buf: &mut [u8]) -> Result<(), DeviceError> {
    let len = buf.len();
    let cdb = vec![
        OP_LOG_SENSE,
        0,
        0x40 | (page & 0x3f), // PC=1
        0,
        0,
        0,
        0,
        u8::try_from(len >> 8).unwrap_or(0),
        (len & 0xff) as u8,
        0,
    ];
    let mut cmd = ScsiCmd::new(cdb, Direction::In, buf);
    run_checked(port, &mut cmd, "LOG SENSE")
}

/// MODE SENSE (6) for one page
pub(crate) fn mode_sense6(port: &mut dyn Port, page: u8, buf: &mut [u8]) -> Result<(), DeviceError> {
    let len = (buf.len() & 0xff) as u8;
    let cdb = vec![OP_MODE_SENSE_6, 0, page & 0x3f, 0, len, 0];
    let mut cmd = ScsiCmd::new(cdb, Direction::In, buf);
    run_checked(port, &mut cmd, "MODE SENSE(6)")
}

/// MODE SENSE (10) for one page
pub(crate) fn mode_sense10(port: &mut dyn Port, page: u8, buf: &mut [u8]) -> Result<(), DeviceError> {
    let len = buf.len();
    let cdb = vec![
        OP_MODE_SENSE_10,
        0,
        page & 0x3f,
        0,
        0,
        0,
        0,
        u8::try_from(len >> 8).unwrap_or(0),
        (len & 0xff) as u8,
        0,
    ];
    let mut cmd = ScsiCmd::new(cdb, Direction::In, buf);
    run_checked(port, &mut cmd, "MODE SENSE(10)")
}

/// MODE SELECT (6) writing back a buffer previously read with MODE SENSE (6).
/// The mode data length header byte is zeroed and the PS bit masked out of
/// the page header, as SPC requires for a select of sensed data.
pub(crate) fn mode_select6(port: &mut dyn Port, buf: &mut [u8]) -> Result<(), DeviceError> {
    if let Some(b) = buf.first_mut() {
        *b = 0; // mode data length is reserved for MODE SELECT
    }
    let hdr_len = 4 + buf.get(3).copied().unwrap_or(0) as usize;
    if let Some(page0) = buf.get_mut(hdr_len) {
        *page0 &= 0x7f; // mask PS
    }
    let len = (buf.len() & 0xff) as u8;
    let cdb = vec![OP_MODE_SELECT_6, 0x10, 0, 0, len, 0]; // PF=1
    let mut cmd = ScsiCmd::new(cdb, Direction::Out, buf);
    run_checked(port, &mut cmd, "MODE SELECT(6)")
}

/// MODE SELECT (10) counterpart of [`mode_select6`]
pub(crate) fn mode_select10(port: &mut dyn Port, buf: &mut [u8]) -> Result<(), DeviceError> {
    if let Some(hdr) = buf.get_mut(0..2) {
        hdr[0] = 0;
        hdr[1] = 0;
    }
    let block_len = crate::bytes::be_u16(buf, 6) as usize;
    if let Some(page0) = buf.get_mut(8 + block_len) {
        *page0 &= 0x7f; // mask PS
    }
    let len = buf.len();
    let cdb = vec![
        OP_MODE_SELECT_10,
        0x10, // PF=1
        0,
        0,
        0,
        0,
        0,
        u8::try_from(len >> 8).unwrap_or(0),
        (len & 0xff) as u8,
        0,
    ];
    let mut cmd = ScsiCmd::new(cdb, Direction::Out, buf);
    run_checked(port, &mut cmd, "MODE SELECT(10)")
}

/// SEND DIAGNOSTIC self-test variants
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub(crate) enum DiagnosticTest {
    /// Default self-test (SelfTest bit, function code 0)
    Default,
    /// Background short self-test
    BackgroundShort,
    /// Background extended self-test
    BackgroundExtended,
    /// Abort a background self-test
    Abort,
    /// Foreground short self-test (blocks)
    ForegroundShort,
    /// Foreground extended self-test (blocks)
    ForegroundExtended,
}

impl DiagnosticTest {
    /// Byte 1 of the SEND DIAGNOSTIC CDB: function code in bits 7..5,
    /// SelfTest bit 2 only for the default test
    fn cdb_byte1(self) -> u8 {
        match self {
            Self::Default => 0x04,
            Self::BackgroundShort => 1 << 5,
            Self::BackgroundExtended => 2 << 5,
            Self::Abort => 4 << 5,
            Self::ForegroundShort => 5 << 5,
            Self::ForegroundExtended => 6 << 5,
        }
    }

    /// Foreground tests block until the device finishes
    fn is_foreground(self) -> bool {
        matches!(self, Self::Default | Self::ForegroundShort | Self::ForegroundExtended)
    }
}

/// SEND DIAGNOSTIC to start or abort a self-test
pub(crate) fn send_diagnostic(port: &mut dyn Port, test: DiagnosticTest) -> Result<(), DeviceError> {
    let cdb = vec![OP_SEND_DIAGNOSTIC, test.cdb_byte1(), 0, 0, 0, 0];
    let mut cmd = ScsiCmd::new(cdb, Direction::None, &mut []);
    if test.is_foreground() {
        cmd.timeout = TIMEOUT_SELF_TEST;
    }
    run_checked(port, &mut cmd, "SEND DIAGNOSTIC")
}

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::dev::port::MockPort;

    #[test]
    fn fixed_sense_dissect() {
        let sense = [
            0x70, 0, 0x03, 0, 0, 0, 0, 0x0a, 0, 0, 0, 0, 0x11, 0x04, 0, 0, 0, 0,
        ];
        let info = SenseInfo::dissect(&sense).unwrap();
        assert_eq!(info.response_code, 0x70);
        assert_eq!(info.key, 0x03);
        assert_eq!(info.asc, 0x11);
        assert_eq!(info.ascq, 0x04);
        assert!(info.is_error());
    }

    #[test]
    fn descriptor_sense_dissect() {
        let sense = [0x72, 0x01, 0x5d, 0x10, 0, 0, 0, 0];
        let info = SenseInfo::dissect(&sense).unwrap();
        assert_eq!(info.response_code, 0x72);
        assert_eq!(info.key, 0x01);
        assert_eq!(info.asc, 0x5d);
        assert_eq!(info.ascq, 0x10);
        assert!(!info.is_error()); // recovered error
    }

    #[test]
    fn bogus_sense_rejected() {
        assert!(SenseInfo::dissect(&[0x42, 0, 0]).is_none());
        assert!(SenseInfo::dissect(&[]).is_none());
    }

    #[test]
    fn descriptor_scan_finds_type() {
        // descriptor sense with a type 9 (ATA return) descriptor after a type 0
        let mut sense = vec![0x72, 0, 0, 0, 0, 0, 0, 0];
        let d0 = [0x00_u8, 0x0a, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let d9 = [0x09_u8, 0x0c, 0, 0x01, 0, 0x01, 0, 0x4f, 0, 0xc2, 0, 0, 0xa0, 0x50];
        sense.extend_from_slice(&d0);
        sense.extend_from_slice(&d9);
        sense[7] = (d0.len() + d9.len()) as u8;
        let found = sense_descriptor(&sense, 0x09).unwrap();
        assert_eq!(found[0], 0x09);
        assert_eq!(found[13], 0x50);
        assert!(sense_descriptor(&sense, 0x0a).is_none());
    }

    #[test]
    fn inquiry_cdb_layout() {
        let mut port = MockPort::default();
        port.push_data(vec![0_u8; 36]);
        let mut buf = [0_u8; 36];
        inquiry(&mut port, &mut buf).unwrap();
        let issued = port.issued();
        let cdb = &issued[0];
        assert_eq!(cdb[0], 0x12);
        assert_eq!(cdb[4], 36);
    }

    #[test]
    fn log_sense_sets_pc_current_cumulative() {
        let mut port = MockPort::default();
        port.push_data(vec![0_u8; 8]);
        let mut buf = [0_u8; 8];
        log_sense(&mut port, 0x2f, &mut buf).unwrap();
        let issued = port.issued();
        let cdb = &issued[0];
        assert_eq!(cdb[0], 0x4d);
        assert_eq!(cdb[2], 0x40 | 0x2f);
    }

    #[test]
    fn mode_select6_zeroes_length_and_masks_ps() {
        let mut port = MockPort::default();
        port.push_ok();
        // 4-byte header (mode data length 0x0e, no block descriptors), page 0x1c with PS set
        let mut buf = vec![0x0e, 0, 0, 0, 0x9c, 0x0a, 0, 0, 0, 0, 0, 0];
        mode_select6(&mut port, &mut buf).unwrap();
        assert_eq!(buf[0], 0);
        assert_eq!(buf[4], 0x1c);
    }

    #[test]
    fn send_diagnostic_function_codes() {
        assert_eq!(DiagnosticTest::Default.cdb_byte1(), 0x04);
        assert_eq!(DiagnosticTest::BackgroundShort.cdb_byte1(), 0x20);
        assert_eq!(DiagnosticTest::BackgroundExtended.cdb_byte1(), 0x40);
        assert_eq!(DiagnosticTest::Abort.cdb_byte1(), 0x80);
        assert_eq!(DiagnosticTest::ForegroundShort.cdb_byte1(), 0xa0);
        assert_eq!(DiagnosticTest::ForegroundExtended.cdb_byte1(), 0xc0);
    }
}
