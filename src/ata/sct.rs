//! SMART Command Transport: status, temperature history, feature control

use crate::{bytes, error::DeviceError};

/// Log address of the SCT status / command pair
pub(crate) const LOG_SCT_STATUS: u8 = 0xe0;
/// Log address of the SCT data table
pub(crate) const LOG_SCT_DATA: u8 = 0xe1;

/// SCT action code: feature control
const ACTION_FEATURE_CONTROL: u16 = 4;
/// SCT action code: data table
const ACTION_DATA_TABLE: u16 = 5;
/// SCT function code: set state / read table
const FUNCTION_SET_OR_READ: u16 = 1;
/// Data table id of the temperature history
const TABLE_ID_TEMP_HISTORY: u16 = 2;
/// Feature code of the temperature logging interval
const FEATURE_TEMP_INTERVAL: u16 = 3;
/// Extended status code while an SCT command is executing
const EXT_STATUS_IN_PROGRESS: u16 = 0xffff;

/// Decoded SCT status response
#[derive(Clone, Debug, Default)]
pub(crate) struct SctStatus {
    /// Status response format version
    pub format_version: u16,
    /// Vendor SCT version
    pub sct_version: u16,
    /// Device state byte
    pub device_state: u8,
    /// Extended status of the last command
    pub ext_status_code: u16,
    /// Action code of the last command
    pub action_code: u16,
    /// Function code of the last command
    pub function_code: u16,
    /// Current temperature, Celsius
    pub current_temp: Option<i8>,
    /// Power-cycle minimum temperature
    pub power_cycle_min_temp: Option<i8>,
    /// Power-cycle maximum temperature
    pub power_cycle_max_temp: Option<i8>,
    /// Lifetime minimum temperature
    pub life_min_temp: Option<i8>,
    /// Lifetime maximum temperature
    pub life_max_temp: Option<i8>,
    /// Count of excursions over the limit
    pub over_limit_count: u32,
    /// Count of excursions under the limit
    pub under_limit_count: u32,
}

/// 0x80 marks an invalid temperature byte
#[expect(clippy::cast_possible_wrap)]
fn temp_byte(raw: u8) -> Option<i8> {
    (raw != 0x80).then_some(raw as i8)
}

impl SctStatus {
    /// Decode an SCT status response page
    pub(crate) fn decode(page: &[u8]) -> Result<Self, DeviceError> {
        if page.len() != 512 {
            return Err(DeviceError::Protocol(format!(
                "SCT status response has {} bytes instead of 512",
                page.len()
            )));
        }
        let format_version = bytes::le_u16(page, 0);
        if !matches!(format_version, 2 | 3) {
            return Err(DeviceError::Protocol(format!(
                "unknown SCT status format version {format_version}"
            )));
        }
        Ok(Self {
            format_version,
            sct_version: bytes::le_u16(page, 2),
            device_state: page.get(10).copied().unwrap_or(0),
            ext_status_code: bytes::le_u16(page, 14),
            action_code: bytes::le_u16(page, 16),
            function_code: bytes::le_u16(page, 18),
            current_temp: temp_byte(page.get(200).copied().unwrap_or(0x80)),
            power_cycle_min_temp: temp_byte(page.get(201).copied().unwrap_or(0x80)),
            power_cycle_max_temp: temp_byte(page.get(202).copied().unwrap_or(0x80)),
            life_min_temp: temp_byte(page.get(203).copied().unwrap_or(0x80)),
            life_max_temp: temp_byte(page.get(204).copied().unwrap_or(0x80)),
            over_limit_count: bytes::le_u32(page, 206),
            under_limit_count: bytes::le_u32(page, 210),
        })
    }

    /// Is another SCT command still executing?
    pub(crate) fn command_in_flight(&self) -> bool {
        self.ext_status_code == EXT_STATUS_IN_PROGRESS
    }

    /// Does this status echo the given command codes?
    pub(crate) fn echoes(&self, action: u16, function: u16) -> bool {
        self.action_code == action && self.function_code == function
    }
}

/// Build the command page requesting the temperature history table
pub(crate) fn temp_history_command() -> [u8; 512] {
    let mut page = [0_u8; 512];
    bytes::put_le_u16(&mut page, 0, ACTION_DATA_TABLE);
    bytes::put_le_u16(&mut page, 2, FUNCTION_SET_OR_READ);
    bytes::put_le_u16(&mut page, 4, TABLE_ID_TEMP_HISTORY);
    page
}

/// Command codes the temperature history status re-read must echo
pub(crate) const TEMP_HISTORY_ECHO: (u16, u16) = (ACTION_DATA_TABLE, FUNCTION_SET_OR_READ);

/// Build the feature-control page setting the temperature logging interval.
/// With `persistent` the setting survives power cycles.
pub(crate) fn temp_interval_command(minutes: u16, persistent: bool) -> [u8; 512] {
    let mut page = [0_u8; 512];
    bytes::put_le_u16(&mut page, 0, ACTION_FEATURE_CONTROL);
    bytes::put_le_u16(&mut page, 2, FUNCTION_SET_OR_READ);
    bytes::put_le_u16(&mut page, 4, FEATURE_TEMP_INTERVAL);
    bytes::put_le_u16(&mut page, 6, minutes);
    bytes::put_le_u16(&mut page, 8, u16::from(persistent));
    page
}

/// Command codes the feature-control status re-read must echo
pub(crate) const FEATURE_CONTROL_ECHO: (u16, u16) = (ACTION_FEATURE_CONTROL, FUNCTION_SET_OR_READ);

/// Decoded temperature history table
#[derive(Clone, Debug, Default)]
pub(crate) struct TempHistory {
    /// Table format version
    pub format_version: u16,
    /// Sampling period, minutes
    pub sampling_period: u16,
    /// Logging interval, minutes
    pub interval: u16,
    /// Max operating limit
    pub max_op_limit: Option<i8>,
    /// Over temperature limit
    pub over_limit: Option<i8>,
    /// Min operating limit
    pub min_op_limit: Option<i8>,
    /// Under temperature limit
    pub under_limit: Option<i8>,
    /// Samples in chronological order, oldest first
    pub samples: Vec<Option<i8>>,
}

impl TempHistory {
    /// Decode the temperature history table page.
    /// The circular buffer is unrolled so samples come out oldest first.
    pub(crate) fn decode(page: &[u8]) -> Result<Self, DeviceError> {
        if page.len() != 512 {
            return Err(DeviceError::Protocol(format!(
                "SCT temperature history has {} bytes instead of 512",
                page.len()
            )));
        }
        let cb_index = usize::from(bytes::le_u16(page, 30));
        let cb_size = usize::from(bytes::le_u16(page, 32)).min(478);
        if cb_size > 0 && cb_index >= cb_size {
            return Err(DeviceError::Protocol(format!(
                "SCT temperature history index {cb_index} out of range (size {cb_size})"
            )));
        }
        let mut samples = Vec::with_capacity(cb_size);
        for i in 0..cb_size {
            // entry after the write index is the oldest
            let slot = (cb_index + 1 + i) % cb_size.max(1);
            samples.push(temp_byte(page.get(34 + slot).copied().unwrap_or(0x80)));
        }
        Ok(Self {
            format_version: bytes::le_u16(page, 0),
            sampling_period: bytes::le_u16(page, 2),
            interval: bytes::le_u16(page, 4),
            max_op_limit: temp_byte(page.get(6).copied().unwrap_or(0x80)),
            over_limit: temp_byte(page.get(7).copied().unwrap_or(0x80)),
            min_op_limit: temp_byte(page.get(8).copied().unwrap_or(0x80)),
            under_limit: temp_byte(page.get(9).copied().unwrap_or(0x80)),
            samples,
        })
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::indexing_slicing)]
pub(crate) mod tests {
    use super::*;

    /// Build a plausible idle SCT status page
    pub(crate) fn sample_status_page(ext_status: u16, action: u16, function: u16) -> Vec<u8> {
        let mut page = vec![0_u8; 512];
        bytes::put_le_u16(&mut page, 0, 3);
        bytes::put_le_u16(&mut page, 2, 0x0102);
        bytes::put_le_u16(&mut page, 14, ext_status);
        bytes::put_le_u16(&mut page, 16, action);
        bytes::put_le_u16(&mut page, 18, function);
        page[200] = 30; // current temp
        page[201] = 18;
        page[202] = 40;
        page[203] = 0x80; // lifetime min unknown
        page[204] = 56;
        page
    }

    #[test]
    fn status_decode() {
        let page = sample_status_page(0, 0, 0);
        let status = SctStatus::decode(&page).unwrap();
        assert_eq!(status.format_version, 3);
        assert_eq!(status.current_temp, Some(30));
        assert_eq!(status.power_cycle_min_temp, Some(18));
        assert_eq!(status.power_cycle_max_temp, Some(40));
        assert_eq!(status.life_min_temp, None);
        assert_eq!(status.life_max_temp, Some(56));
        assert!(!status.command_in_flight());
    }

    #[test]
    fn status_in_flight() {
        let page = sample_status_page(0xffff, 0, 0);
        let status = SctStatus::decode(&page).unwrap();
        assert!(status.command_in_flight());
    }

    #[test]
    fn status_echo_check() {
        let page = sample_status_page(0, 5, 1);
        let status = SctStatus::decode(&page).unwrap();
        assert!(status.echoes(TEMP_HISTORY_ECHO.0, TEMP_HISTORY_ECHO.1));
        assert!(!status.echoes(FEATURE_CONTROL_ECHO.0, FEATURE_CONTROL_ECHO.1));
    }

    #[test]
    fn status_bad_version_rejected() {
        let mut page = sample_status_page(0, 0, 0);
        bytes::put_le_u16(&mut page, 0, 9);
        assert!(matches!(
            SctStatus::decode(&page),
            Err(DeviceError::Protocol(_))
        ));
    }

    #[test]
    fn command_pages() {
        let cmd = temp_history_command();
        assert_eq!(bytes::le_u16(&cmd, 0), 5);
        assert_eq!(bytes::le_u16(&cmd, 2), 1);
        assert_eq!(bytes::le_u16(&cmd, 4), 2);

        let cmd = temp_interval_command(10, true);
        assert_eq!(bytes::le_u16(&cmd, 0), 4);
        assert_eq!(bytes::le_u16(&cmd, 4), 3);
        assert_eq!(bytes::le_u16(&cmd, 6), 10);
        assert_eq!(bytes::le_u16(&cmd, 8), 1);
        let cmd = temp_interval_command(10, false);
        assert_eq!(bytes::le_u16(&cmd, 8), 0);
    }

    #[test]
    fn history_unrolls_circular_buffer() {
        let mut page = vec![0_u8; 512];
        bytes::put_le_u16(&mut page, 0, 2);
        bytes::put_le_u16(&mut page, 2, 1); // sampling period
        bytes::put_le_u16(&mut page, 4, 5); // interval
        page[6] = 60;
        page[7] = 65;
        page[8] = 0;
        page[9] = 0x80;
        bytes::put_le_u16(&mut page, 30, 1); // index: newest at slot 1
        bytes::put_le_u16(&mut page, 32, 4); // 4 samples
        page[34] = 31; // slot 0
        page[35] = 32; // slot 1, newest
        page[36] = 29; // slot 2, oldest
        page[37] = 30; // slot 3
        let history = TempHistory::decode(&page).unwrap();
        assert_eq!(history.interval, 5);
        assert_eq!(history.max_op_limit, Some(60));
        assert_eq!(history.under_limit, None);
        assert_eq!(
            history.samples,
            vec![Some(29), Some(30), Some(31), Some(32)]
        );
    }

    #[test]
    fn history_bad_index_rejected() {
        let mut page = vec![0_u8; 512];
        bytes::put_le_u16(&mut page, 0, 2);
        bytes::put_le_u16(&mut page, 30, 10);
        bytes::put_le_u16(&mut page, 32, 4);
        assert!(TempHistory::decode(&page).is_err());
    }
}
