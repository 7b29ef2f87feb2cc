//! High-level ATA operations over a tunnelled device

use super::{
    AtaCmd, HealthStatus, OutRegs, PowerMode, ProtocolPolicy, SmartRequest, Taskfile,
    attr::{SmartThresholds, SmartValues, decode_thresholds, decode_values},
    decode_smart_status, identify,
    identify::IdentifyInfo,
    sct::{
        self, FEATURE_CONTROL_ECHO, LOG_SCT_DATA, LOG_SCT_STATUS, SctStatus, TEMP_HISTORY_ECHO,
        TempHistory,
    },
    selftest::{
        self, LOG_EXT_SELFTEST, LOG_SELECTIVE, LOG_SELFTEST, ScanAfter, SelectiveLog, SelfTestLog,
        SpanArg,
    },
};
use crate::{bytes, error::DeviceError, scsi::Direction, tunnel::TunnelDevice};

/// Log address of the SMART error log
pub(crate) const LOG_ERROR: u8 = 0x01;
/// Offset of the device error count in the error log page
const ERROR_COUNT_OFFSET: usize = 452;

/// READ LOG EXT opcode (general purpose logging)
const CMD_READ_LOG_EXT: u8 = 0x2f;

/// Execute one SMART request
pub(crate) fn smart_exec(
    dev: &mut TunnelDevice,
    req: SmartRequest,
    buf: &mut [u8],
) -> Result<OutRegs, DeviceError> {
    dev.ata_pass_through(&req.command(), buf)
}

/// Read and decode IDENTIFY DEVICE
pub(crate) fn read_identify(
    dev: &mut TunnelDevice,
    policy: &ProtocolPolicy,
) -> Result<IdentifyInfo, DeviceError> {
    let mut buf = [0_u8; 512];
    smart_exec(dev, SmartRequest::Identify, &mut buf)?;
    identify::decode(&buf, policy)
}

/// Run the SMART status check and decode the signature registers
pub(crate) fn status_check(dev: &mut TunnelDevice) -> Result<HealthStatus, DeviceError> {
    let out = smart_exec(dev, SmartRequest::StatusCheck, &mut [])?;
    decode_smart_status(&out)
}

/// CHECK POWER MODE
pub(crate) fn check_power_mode(dev: &mut TunnelDevice) -> Result<PowerMode, DeviceError> {
    let out = smart_exec(dev, SmartRequest::CheckPowerMode, &mut [])?;
    PowerMode::decode(out.sector_count)
}

/// Read and decode the SMART attribute values
pub(crate) fn read_values(
    dev: &mut TunnelDevice,
    policy: &ProtocolPolicy,
) -> Result<SmartValues, DeviceError> {
    let mut buf = [0_u8; 512];
    smart_exec(dev, SmartRequest::ReadValues, &mut buf)?;
    decode_values(&buf, policy)
}

/// Read and decode the SMART attribute thresholds
pub(crate) fn read_thresholds(
    dev: &mut TunnelDevice,
    policy: &ProtocolPolicy,
) -> Result<SmartThresholds, DeviceError> {
    let mut buf = [0_u8; 512];
    smart_exec(dev, SmartRequest::ReadThresholds, &mut buf)?;
    decode_thresholds(&buf, policy)
}

/// Read `nsectors` of a SMART log, always from its beginning
pub(crate) fn read_log(
    dev: &mut TunnelDevice,
    addr: u8,
    nsectors: u8,
) -> Result<Vec<u8>, DeviceError> {
    let mut buf = vec![0_u8; usize::from(nsectors) * 512];
    smart_exec(dev, SmartRequest::ReadLog { addr, nsectors }, &mut buf)?;
    Ok(buf)
}

/// Write one sector of a SMART log
pub(crate) fn write_log(
    dev: &mut TunnelDevice,
    addr: u8,
    page: &[u8; 512],
) -> Result<(), DeviceError> {
    let mut buf = *page;
    smart_exec(dev, SmartRequest::WriteLog { addr }, &mut buf)?;
    Ok(())
}

/// One READ LOG EXT transfer of `nsectors` starting at `page`
fn read_gp_log_raw(
    dev: &mut TunnelDevice,
    addr: u8,
    page: u16,
    nsectors: u8,
    buf: &mut [u8],
) -> Result<(), DeviceError> {
    let mut taskfile = Taskfile::default();
    taskfile.regs.command = CMD_READ_LOG_EXT;
    taskfile.regs.sector_count = nsectors;
    taskfile.regs.lba_low = addr;
    taskfile.regs.lba_mid = (page & 0xff) as u8;
    // a zero high bank encodes like a 28-bit command, which even the
    // bridges with limited 48-bit support can carry
    taskfile.prev.lba_mid = u8::try_from(page >> 8).unwrap_or(0);
    let cmd = AtaCmd {
        taskfile,
        direction: Direction::In,
        out_needed: super::OutNeeded::empty(),
    };
    dev.ata_pass_through(&cmd, buf)?;
    Ok(())
}

/// Read `nsectors` of a GP log via READ LOG EXT.
/// Some drivers cannot do multi-sector transfers; a failed N-sector
/// read is retried as N single-sector page reads concatenated.
pub(crate) fn read_gp_log(
    dev: &mut TunnelDevice,
    addr: u8,
    page: u16,
    nsectors: u8,
) -> Result<Vec<u8>, DeviceError> {
    let mut buf = vec![0_u8; usize::from(nsectors) * 512];
    match read_gp_log_raw(dev, addr, page, nsectors, &mut buf) {
        Ok(()) => Ok(buf),
        Err(first_err) if nsectors > 1 => {
            log::debug!(
                "{nsectors}-sector read of GP log {addr:#04x} failed ({first_err}), retrying page by page"
            );
            for sector in 0..u16::from(nsectors) {
                let off = usize::from(sector) * 512;
                let chunk = buf
                    .get_mut(off..off + 512)
                    .ok_or_else(|| DeviceError::InvalidArgument("log buffer overrun".to_owned()))?;
                read_gp_log_raw(dev, addr, page + sector, 1, chunk)?;
            }
            Ok(buf)
        }
        Err(e) => Err(e),
    }
}

/// Read and decode the standard self-test log
pub(crate) fn read_selftest_log(
    dev: &mut TunnelDevice,
    policy: &ProtocolPolicy,
) -> Result<SelfTestLog, DeviceError> {
    let page = read_log(dev, LOG_SELFTEST, 1)?;
    selftest::decode_selftest_log(&page, policy)
}

/// Read and decode the extended self-test log
pub(crate) fn read_ext_selftest_log(
    dev: &mut TunnelDevice,
    nsectors: u8,
    policy: &ProtocolPolicy,
) -> Result<SelfTestLog, DeviceError> {
    let sectors = read_gp_log(dev, LOG_EXT_SELFTEST, 0, nsectors)?;
    selftest::decode_ext_selftest_log(&sectors, policy)
}

/// Read and decode the selective self-test log
pub(crate) fn read_selective_log(
    dev: &mut TunnelDevice,
    policy: &ProtocolPolicy,
) -> Result<SelectiveLog, DeviceError> {
    let page = read_log(dev, LOG_SELECTIVE, 1)?;
    SelectiveLog::decode(&page, policy)
}

/// Resolve spans against the current log and write the selective log back
pub(crate) fn write_selective_log(
    dev: &mut TunnelDevice,
    num_sectors: u64,
    args: &[SpanArg],
    scan_after: ScanAfter,
    pending_minutes: Option<u16>,
    policy: &ProtocolPolicy,
) -> Result<SelectiveLog, DeviceError> {
    let prev = read_selective_log(dev, policy)?;
    let values = read_values(dev, policy)?;
    let mut new = selftest::build_selective_log(
        &prev,
        values.self_test_exec_status,
        num_sectors,
        args,
        scan_after,
        pending_minutes,
    )?;
    let page = new.encode();
    write_log(dev, LOG_SELECTIVE, &page)?;
    Ok(new)
}

/// Device error count from the SMART error log
pub(crate) fn read_error_count(
    dev: &mut TunnelDevice,
    policy: &ProtocolPolicy,
) -> Result<u16, DeviceError> {
    let page = read_log(dev, LOG_ERROR, 1)?;
    super::check_page_checksum(&page, "SMART error log", policy)?;
    Ok(bytes::le_u16(&page, ERROR_COUNT_OFFSET))
}

/// Read the SCT status page
pub(crate) fn read_sct_status(dev: &mut TunnelDevice) -> Result<SctStatus, DeviceError> {
    let page = read_log(dev, LOG_SCT_STATUS, 1)?;
    SctStatus::decode(&page)
}

/// Read the SCT temperature history.
/// Chain: read status, refuse while another SCT command is in flight,
/// write the data-table command, read the table, re-read the status and
/// verify it echoes the issued command codes.
pub(crate) fn read_sct_temp_history(
    dev: &mut TunnelDevice,
) -> Result<(SctStatus, TempHistory), DeviceError> {
    let status = read_sct_status(dev)?;
    if status.command_in_flight() {
        return Err(DeviceError::Busy(
            "another SCT command is executing".to_owned(),
        ));
    }
    write_log(dev, LOG_SCT_STATUS, &sct::temp_history_command())?;
    let table_page = read_log(dev, LOG_SCT_DATA, 1)?;
    let history = TempHistory::decode(&table_page)?;
    let status = read_sct_status(dev)?;
    if !status.echoes(TEMP_HISTORY_ECHO.0, TEMP_HISTORY_ECHO.1) {
        return Err(DeviceError::Protocol(format!(
            "SCT status does not echo the data table command (action {}, function {})",
            status.action_code, status.function_code
        )));
    }
    Ok((status, history))
}

/// Set the SCT temperature logging interval.
/// Same precondition chain as the history read; `persistent` keeps the
/// setting across power cycles.
pub(crate) fn set_sct_temp_interval(
    dev: &mut TunnelDevice,
    minutes: u16,
    persistent: bool,
) -> Result<(), DeviceError> {
    let status = read_sct_status(dev)?;
    if status.command_in_flight() {
        return Err(DeviceError::Busy(
            "another SCT command is executing".to_owned(),
        ));
    }
    write_log(dev, LOG_SCT_STATUS, &sct::temp_interval_command(minutes, persistent))?;
    let status = read_sct_status(dev)?;
    if !status.echoes(FEATURE_CONTROL_ECHO.0, FEATURE_CONTROL_ECHO.1) {
        return Err(DeviceError::Protocol(
            "SCT status does not echo the feature control command".to_owned(),
        ));
    }
    Ok(())
}

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::indexing_slicing)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        dev::{ScsiHandle, port::MockPort},
        tunnel::{Dialect, SatCdbLen, sat::tests::ard_sense},
    };

    /// SAT tunnel over a mock port
    pub(crate) fn mock_tunnel(port: MockPort) -> TunnelDevice {
        TunnelDevice::new(
            ScsiHandle::new(Box::new(port), "/dev/_mock", "sat"),
            Dialect::Sat {
                cdb_len: SatCdbLen::Len16,
            },
        )
    }

    #[test]
    fn status_check_healthy_end_to_end() {
        // scenario: platform returns the ok signature registers
        let mut port = MockPort::default();
        port.push_sense(ard_sense(&OutRegs {
            lba_mid: 0x4f,
            lba_high: 0xc2,
            status: 0x50,
            ..OutRegs::default()
        }));
        let mut dev = mock_tunnel(port);
        assert_eq!(status_check(&mut dev).unwrap(), HealthStatus::Ok);
    }

    #[test]
    fn status_check_failing_end_to_end() {
        let mut port = MockPort::default();
        port.push_sense(ard_sense(&OutRegs {
            lba_mid: 0xf4,
            lba_high: 0x2c,
            status: 0x50,
            ..OutRegs::default()
        }));
        let mut dev = mock_tunnel(port);
        assert_eq!(status_check(&mut dev).unwrap(), HealthStatus::Failing);
    }

    #[test]
    fn multi_sector_gp_read_falls_back_to_pages() {
        let mut port = MockPort::default();
        // the 2-sector read fails, then two single page reads succeed
        port.push_err(DeviceError::Io("short read".to_owned()));
        port.push_data(vec![0xaa; 512]);
        port.push_data(vec![0xbb; 512]);
        let observer = port.clone();
        let mut dev = mock_tunnel(port);
        let data = read_gp_log(&mut dev, 0x07, 0, 2).unwrap();
        assert_eq!(data.len(), 1024);
        assert_eq!(data[0], 0xaa);
        assert_eq!(data[512], 0xbb);
        // the retries address consecutive pages
        let issued = observer.issued();
        assert_eq!(issued.len(), 3);
        assert_eq!(issued[1][10], 0); // page 0 in lba_mid
        assert_eq!(issued[2][10], 1); // page 1
    }

    #[test]
    fn single_sector_failure_not_retried() {
        let mut port = MockPort::default();
        port.push_err(DeviceError::Io("gone".to_owned()));
        let mut dev = mock_tunnel(port);
        assert!(read_log(&mut dev, 0x06, 1).is_err());
        assert!(matches!(
            read_gp_log(&mut dev, 0x07, 0, 1),
            Err(DeviceError::Protocol(_)) // mock exhausted, no retry issued
        ));
    }

    #[test]
    fn error_count_read() {
        let mut page = vec![0_u8; 512];
        page[0] = 1;
        bytes::put_le_u16(&mut page, ERROR_COUNT_OFFSET, 7);
        page[511] = bytes::page_checksum(&page, page[511]);
        let mut port = MockPort::default();
        port.push_data(page);
        let mut dev = mock_tunnel(port);
        assert_eq!(
            read_error_count(&mut dev, &ProtocolPolicy::default()).unwrap(),
            7
        );
    }

    #[test]
    fn sct_history_full_chain() {
        let mut port = MockPort::default();
        // 1: status read, idle
        port.push_data(crate::ata::sct::tests::sample_status_page(0, 0, 0));
        // 2: command write
        port.push_ok();
        // 3: data table read
        let mut table = vec![0_u8; 512];
        bytes::put_le_u16(&mut table, 0, 2);
        bytes::put_le_u16(&mut table, 30, 0);
        bytes::put_le_u16(&mut table, 32, 1);
        table[34] = 30;
        port.push_data(table);
        // 4: status re-read echoing the command
        port.push_data(crate::ata::sct::tests::sample_status_page(0, 5, 1));
        let mut dev = mock_tunnel(port);
        let (_, history) = read_sct_temp_history(&mut dev).unwrap();
        assert_eq!(history.samples, vec![Some(30)]);
    }

    #[test]
    fn sct_history_refused_while_busy() {
        let mut port = MockPort::default();
        port.push_data(crate::ata::sct::tests::sample_status_page(0xffff, 0, 0));
        let mut dev = mock_tunnel(port);
        assert!(matches!(
            read_sct_temp_history(&mut dev),
            Err(DeviceError::Busy(_))
        ));
    }

    #[test]
    fn sct_history_echo_mismatch_is_protocol_error() {
        let mut port = MockPort::default();
        port.push_data(crate::ata::sct::tests::sample_status_page(0, 0, 0));
        port.push_ok();
        port.push_data(vec![0_u8; 512]);
        // echo carries the wrong codes
        port.push_data(crate::ata::sct::tests::sample_status_page(0, 4, 1));
        let mut dev = mock_tunnel(port);
        assert!(matches!(
            read_sct_temp_history(&mut dev),
            Err(DeviceError::Protocol(_))
        ));
    }

    #[test]
    fn selective_write_round_trip() {
        // scenario: write spans, read back the same spans
        let prev_page = crate::ata::selftest::tests::selective_page(&[(0, 99)]);
        let values_page = crate::ata::attr::tests::sample_values_page();
        let mut port = MockPort::default();
        port.push_data(prev_page); // read selective log
        port.push_data(values_page); // read values for exec status
        port.push_ok(); // write log
        let observer = port.clone();
        let mut dev = mock_tunnel(port);
        let args = [SpanArg {
            mode: crate::ata::selftest::SpanMode::Range,
            start: 1000,
            end: 1999,
        }];
        let written = write_selective_log(
            &mut dev,
            1_000_000,
            &args,
            ScanAfter::Keep,
            None,
            &ProtocolPolicy::default(),
        )
        .unwrap();
        assert_eq!(written.spans[0], (1000, 1999));
        // the written page decodes back to the same spans with a valid checksum
        let pages = observer.written();
        assert_eq!(pages.len(), 1);
        let decoded = SelectiveLog::decode(&pages[0], &ProtocolPolicy::default()).unwrap();
        assert_eq!(decoded.spans[0], (1000, 1999));
        assert_eq!(bytes::page_sum(&pages[0]), 0);
    }
}
