//! Per-device monitoring state machine

pub(crate) mod notify;
pub(crate) mod schedule;

use chrono::{DateTime, Local};
use notify::{Category, Notifier, NotifyConfig, NotifyTarget};
use schedule::{TEST_PRIORITY, TestSchedule, TestType};

use crate::{
    ata::{
        HealthStatus, PowerMode, ProtocolPolicy,
        attr::{
            AttrDefs, AttrState, SmartThresholds, SmartValues, attr_state, raw_value, temperature,
        },
        ops,
        selftest::EXEC_STATUS_IN_PROGRESS,
    },
    dev::ScsiHandle,
    error::DeviceError,
    scsi::{self, health as scsi_health},
    tunnel::TunnelDevice,
};

/// Attribute ids probed for a temperature, most specific first
const TEMP_ATTRIBUTE_IDS: [u8; 3] = [194, 190, 220];
/// Seconds of the cold-start window during which min may rise
const TEMP_MIN_RAISE_WINDOW: u64 = 30 * 60;

/// Power state floor below which routine checks are skipped
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum PowerFloor {
    /// Check regardless of power state
    #[default]
    Never,
    /// Skip when the drive sleeps
    Sleep,
    /// Skip when the drive sleeps or is in standby
    Standby,
    /// Skip unless the drive is fully active
    Idle,
}

/// 256-bit per-attribute-id set
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct AttrBitset(
    /// One bit per attribute id
    [u8; 32],
);

impl AttrBitset {
    /// Mark an id
    pub(crate) fn set(&mut self, id: u8) {
        if let Some(byte) = self.0.get_mut(usize::from(id) / 8) {
            *byte |= 1 << (id % 8);
        }
    }

    /// Is an id marked?
    pub(crate) fn get(&self, id: u8) -> bool {
        self.0
            .get(usize::from(id) / 8)
            .is_some_and(|byte| byte & (1 << (id % 8)) != 0)
    }

    /// Any id marked?
    pub(crate) fn any(&self) -> bool {
        self.0.iter().any(|b| *b != 0)
    }
}

/// The four per-device attribute control sets
#[derive(Clone, Debug, Default)]
pub(crate) struct AttrBitsets {
    /// Exclude from change tracking (`-i`)
    pub track_ignore: AttrBitset,
    /// Exclude from usage failure notifications (`-I`)
    pub failure_ignore: AttrBitset,
    /// Print raw value alongside changes (`-r`)
    pub raw_print: AttrBitset,
    /// Track raw value changes (`-R`)
    pub raw_track: AttrBitset,
}

/// Which checks run for one monitored device
#[derive(Clone, Debug, Default)]
pub(crate) struct MonitorConfig {
    /// Device string as written in the configuration
    pub name: String,
    /// Run the SMART health check
    pub check_health: bool,
    /// Notify on failed usage attributes
    pub monitor_usage: bool,
    /// Log prefailure attribute changes
    pub report_prefail_changes: bool,
    /// Log usage attribute changes
    pub report_usage_changes: bool,
    /// Track the self-test log error count
    pub check_selftest_log: bool,
    /// Track the ATA error log count
    pub check_error_log: bool,
    /// Current-pending-sector attribute id, 0 disables the check
    pub pending_id: u8,
    /// Offline-uncorrectable attribute id, 0 disables the check
    pub uncorrectable_id: u8,
    /// Temperature change trigger in degrees, 0 disables
    pub temp_diff: u8,
    /// Informational temperature ceiling, 0 disables
    pub temp_info: u8,
    /// Critical temperature ceiling, 0 disables
    pub temp_crit: u8,
    /// Power state floor for skipping checks
    pub power_floor: PowerFloor,
    /// Scheduled self-test pattern
    pub schedule: Option<TestSchedule>,
    /// Attribute display definitions
    pub attr_defs: AttrDefs,
    /// Checksum and firmware policy
    pub policy: ProtocolPolicy,
    /// Attribute control sets
    pub bitsets: AttrBitsets,
    /// Notification settings
    pub notify: NotifyConfig,
}

/// Temperature tracking record
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct TempTracker {
    /// Temperature at the last report
    current: u8,
    /// Lowest temperature seen
    min: u8,
    /// Highest temperature seen
    max: u8,
}

/// Monitoring state and dispatcher for one device
pub(crate) struct DeviceMonitor {
    /// What to check
    config: MonitorConfig,
    /// Notification dispatcher
    notifier: Notifier,
    /// Identity strings handed to the notifier
    target: NotifyTarget,
    /// Attribute snapshot kept between cycles when a check needs it
    smart_snapshot: Option<SmartValues>,
    /// Self-test log error count and most recent error hour
    selftest_errors: Option<(usize, u16)>,
    /// ATA error log count
    ata_errors: Option<u16>,
    /// Temperature tracking
    temp: Option<TempTracker>,
    /// Remaining polls during which min may rise after a cold start
    temp_min_raise_ticks: u32,
    /// Checks skipped due to the power floor since the last run
    skipped_checks: u32,
    /// Latched "drive cannot run this test type" flags
    not_capable: [bool; 4],
}

impl DeviceMonitor {
    /// Allocate monitoring state for a registered device.
    /// The min-raise grace window is `1800 s / interval` polls.
    pub(crate) fn new(config: MonitorConfig, target: NotifyTarget, interval_secs: u64) -> Self {
        let notifier = Notifier::new(config.notify.clone());
        if let Some(schedule) = &config.schedule {
            log::info!(
                "Device: {}, scheduled self-tests enabled, pattern {}",
                config.name,
                schedule.pattern()
            );
        }
        #[expect(clippy::cast_possible_truncation)]
        let grace = (TEMP_MIN_RAISE_WINDOW / interval_secs.max(1)) as u32;
        Self {
            config,
            notifier,
            target,
            smart_snapshot: None,
            selftest_errors: None,
            ata_errors: None,
            temp: None,
            temp_min_raise_ticks: grace,
            skipped_checks: 0,
            not_capable: [false; 4],
        }
    }

    /// Device string of this monitor
    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    /// Notification slot counters, for state inspection
    pub(crate) fn notify_slot(&self, category: Category) -> &notify::NotifySlot {
        self.notifier.slot(category)
    }

    /// Send the startup test notification when configured
    pub(crate) fn send_test_notification(&mut self, now: i64) {
        if self.config.notify.test {
            let message = format!("TEST EMAIL from monitor for device: {}", self.config.name);
            self.notifier
                .notify(&self.target, Category::EmailTest, &message, now);
        }
    }

    /// Report a failed open, mapped to its own category
    pub(crate) fn report_open_failure(&mut self, err: &DeviceError, now: i64) {
        let message = format!("Device: {}, unable to open device: {err}", self.config.name);
        log::error!("{message}");
        self.notifier
            .notify(&self.target, Category::FailedOpenDevice, &message, now);
    }

    /// Does any future check need the attribute snapshot?
    fn needs_snapshot(&self) -> bool {
        self.config.report_prefail_changes
            || self.config.report_usage_changes
            || self.config.bitsets.raw_track.any()
            || self.config.pending_id != 0
            || self.config.uncorrectable_id != 0
    }

    /// The scheduled test due now, if any; at most one per cycle.
    /// Types the drive already proved incapable of are skipped.
    fn due_test(&mut self, now: &DateTime<Local>) -> Option<TestType> {
        let schedule = self.config.schedule.as_mut()?;
        for test in TEST_PRIORITY {
            if self.not_capable[test.index()] {
                continue;
            }
            if schedule.due(test, now) {
                return Some(test);
            }
        }
        None
    }

    /// Skip this cycle if the drive is below the configured power floor.
    /// The mode is re-read after a short grace, since the first command
    /// may itself spin up the disk.
    fn power_mode_skip(&mut self, dev: &mut TunnelDevice, grace: std::time::Duration) -> bool {
        if self.config.power_floor == PowerFloor::Never {
            return false;
        }
        // a drive in sleep mode does not answer CHECK POWER MODE
        let mode = ops::check_power_mode(dev).ok();
        let mode = if mode.is_some_and(|m| m < PowerMode::Active) {
            if !grace.is_zero() {
                std::thread::sleep(grace);
            }
            let second = ops::check_power_mode(dev).ok();
            if second > mode {
                log::info!(
                    "Device: {}, CHECK POWER MODE spun up the disk ({mode:?} -> {second:?})",
                    self.config.name
                );
            }
            second
        } else {
            mode
        };
        let skip = match mode {
            None => self.config.power_floor >= PowerFloor::Sleep,
            Some(PowerMode::Standby) => self.config.power_floor >= PowerFloor::Standby,
            Some(PowerMode::Idle) => self.config.power_floor >= PowerFloor::Idle,
            Some(PowerMode::Active) => false,
        };
        if skip {
            // log on transitions only, not once per skipped cycle
            if self.skipped_checks == 0 {
                log::info!(
                    "Device: {}, is in {} mode, suspending checks",
                    self.config.name,
                    mode.map_or_else(|| "SLEEP".to_owned(), |m| m.to_string())
                );
            }
            self.skipped_checks += 1;
        } else if self.skipped_checks > 0 {
            log::info!(
                "Device: {}, back to ACTIVE mode, resuming checks ({} skipped)",
                self.config.name,
                self.skipped_checks
            );
            self.skipped_checks = 0;
        }
        skip
    }

    /// Track a temperature reading against the configured limits.
    /// 0 and 255 mean the reading could not be taken.
    fn check_temperature(&mut self, reading: Option<u8>, now: i64) {
        let Some(current) = reading.filter(|t| *t != 0 && *t != 255) else {
            log::info!("Device: {}, failed to read Temperature", self.config.name);
            return;
        };
        let Some(temp) = self.temp.as_mut() else {
            log::info!(
                "Device: {}, initial Temperature is {current} Celsius",
                self.config.name
            );
            self.temp = Some(TempTracker {
                current,
                min: current,
                max: current,
            });
            return;
        };
        let mut min_marker = "";
        let mut max_marker = "";
        if current < temp.min {
            temp.min = current;
            min_marker = "!";
            self.temp_min_raise_ticks = 0;
        } else if self.temp_min_raise_ticks > 0 {
            // absorb spin-up transients right after a cold start
            temp.min = current;
            self.temp_min_raise_ticks -= 1;
        }
        if current > temp.max {
            temp.max = current;
            max_marker = "!";
        }
        let diff = i32::from(current) - i32::from(temp.current);
        if self.config.temp_diff != 0
            && (!min_marker.is_empty()
                || !max_marker.is_empty()
                || diff.unsigned_abs() >= u32::from(self.config.temp_diff))
        {
            log::info!(
                "Device: {}, Temperature changed {diff:+} Celsius to {current} Celsius (Min/Max {}{min_marker}/{}{max_marker})",
                self.config.name,
                temp.min,
                temp.max
            );
            temp.current = current;
        }
        let (min, max) = (temp.min, temp.max);
        if self.config.temp_crit != 0 && current >= self.config.temp_crit {
            let message = format!(
                "Device: {}, Temperature {current} Celsius reached critical limit of {} Celsius (Min/Max {min}{min_marker}/{max}{max_marker})",
                self.config.name, self.config.temp_crit
            );
            log::error!("{message}");
            self.notifier
                .notify(&self.target, Category::Temperature, &message, now);
        } else if self.config.temp_info != 0 && current >= self.config.temp_info {
            log::info!(
                "Device: {}, Temperature {current} Celsius reached limit of {} Celsius (Min/Max {min}{min_marker}/{max}{max_marker})",
                self.config.name,
                self.config.temp_info
            );
        }
    }

    /// Attribute-level checks: usage failures, pending and uncorrectable
    /// sectors, change reports, temperature extraction
    fn check_attributes(&mut self, values: &SmartValues, thresholds: &SmartThresholds, now: i64) {
        let prev = self.smart_snapshot.take();
        for (slot_idx, slot) in values.table.iter().enumerate() {
            if slot.id == 0 {
                continue;
            }
            let def = self.config.attr_defs.get(slot.id);
            let state = attr_state(slot, thresholds.row(slot_idx), def);
            let name = def
                .name
                .clone()
                .unwrap_or_else(|| format!("Unknown_Attribute_{}", slot.id));

            // failed usage attributes trigger a notification
            if self.config.monitor_usage
                && !slot.is_prefailure()
                && state == AttrState::FailedNow
                && !self.config.bitsets.failure_ignore.get(slot.id)
            {
                let message = format!(
                    "Device: {}, Failed SMART usage Attribute: {} {name}.",
                    self.config.name, slot.id
                );
                log::error!("{message}");
                self.notifier
                    .notify(&self.target, Category::Usage, &message, now);
            }

            // change reports are informational only
            if let Some(prev_values) = &prev {
                if let Some(prev_slot) = prev_values.find(slot.id) {
                    let track = !self.config.bitsets.track_ignore.get(slot.id);
                    let wants_norm = if slot.is_prefailure() {
                        self.config.report_prefail_changes
                    } else {
                        self.config.report_usage_changes
                    };
                    if track && wants_norm && prev_slot.current != slot.current {
                        let raw = self
                            .config
                            .bitsets
                            .raw_print
                            .get(slot.id)
                            .then(|| {
                                format!(
                                    " [Raw {}]",
                                    crate::ata::attr::render_raw(slot, def)
                                )
                            })
                            .unwrap_or_default();
                        log::info!(
                            "Device: {}, SMART {} Attribute: {} {name} changed from {} to {}{raw}",
                            self.config.name,
                            if slot.is_prefailure() {
                                "Prefailure"
                            } else {
                                "Usage"
                            },
                            slot.id,
                            prev_slot.current,
                            slot.current
                        );
                    }
                    if track
                        && self.config.bitsets.raw_track.get(slot.id)
                        && prev_slot.raw != slot.raw
                    {
                        log::info!(
                            "Device: {}, SMART Attribute: {} {name} raw value changed from {} to {}",
                            self.config.name,
                            slot.id,
                            raw_value(prev_slot, def),
                            raw_value(slot, def)
                        );
                    }
                }
            }
        }

        // pending and uncorrectable sector counts
        for (id, category, what) in [
            (
                self.config.pending_id,
                Category::CurrentPendingSector,
                "Currently unreadable (pending) sectors",
            ),
            (
                self.config.uncorrectable_id,
                Category::OfflineUncorrectableSector,
                "Offline uncorrectable sectors",
            ),
        ] {
            if id == 0 {
                continue;
            }
            let Some(slot) = values.find(id) else {
                continue;
            };
            let def = self.config.attr_defs.get(id);
            let raw = raw_value(slot, def);
            if raw == 0 {
                continue;
            }
            // with the increasing flag only a strict raw increase fires
            if def.flags.contains(crate::ata::attr::DefFlags::INCREASING) {
                let prev_raw = prev
                    .as_ref()
                    .and_then(|p| p.find(id))
                    .map(|s| raw_value(s, def));
                if prev_raw.is_some_and(|p| raw <= p) {
                    continue;
                }
            }
            let message = format!("Device: {}, {raw} {what}", self.config.name);
            log::warn!("{message}");
            self.notifier.notify(&self.target, category, &message, now);
        }

        // temperature, from the first attribute with a temperature format
        let reading = TEMP_ATTRIBUTE_IDS.iter().find_map(|id| {
            let def = self.config.attr_defs.get(*id);
            values.find(*id).and_then(|slot| temperature(slot, def))
        });
        if self.config.temp_diff != 0
            || self.config.temp_info != 0
            || self.config.temp_crit != 0
        {
            self.check_temperature(reading, now);
        }

        if self.needs_snapshot() {
            self.smart_snapshot = Some(values.clone());
        }
    }

    /// Self-test log tracking: a higher error count, or an equal count
    /// with a newer error hour (an overwritten ring slot), notifies
    fn check_selftest_log(&mut self, count: usize, hour: u16, now: i64) {
        if let Some((old_count, old_hour)) = self.selftest_errors {
            if count > old_count {
                let message = format!(
                    "Device: {}, Self-Test Log error count increased from {old_count} to {count}",
                    self.config.name
                );
                log::error!("{message}");
                self.notifier
                    .notify(&self.target, Category::SelfTest, &message, now);
            } else if count == old_count && count > 0 && hour != old_hour {
                let message = format!(
                    "Device: {}, new Self-Test Log error at hour timestamp {hour}",
                    self.config.name
                );
                log::error!("{message}");
                self.notifier
                    .notify(&self.target, Category::SelfTest, &message, now);
            }
        }
        self.selftest_errors = Some((count, hour));
    }

    /// Start the given test on an ATA drive.
    /// An incapable drive latches the type so it is never retried; a
    /// test already in progress defers, unless the samsung3 quirk marks
    /// the in-progress byte unreliable.
    fn start_ata_test(
        &mut self,
        dev: &mut TunnelDevice,
        test: TestType,
        values: Option<&SmartValues>,
    ) {
        let Some(values) = values else {
            log::error!(
                "Device: {}, skipping scheduled {test}Test, SMART data unavailable",
                self.config.name
            );
            return;
        };
        let capable = match test {
            TestType::Short | TestType::Long => values.supports_self_test(),
            TestType::Conveyance => values.supports_conveyance_test(),
            TestType::Offline => values.offline_capability & 0x01 != 0,
        };
        if !capable {
            self.not_capable[test.index()] = true;
            log::error!("Device: {}, not capable of {test}Test", self.config.name);
            return;
        }
        let exec_status = values.self_test_exec_status;
        if exec_status >> 4 == EXEC_STATUS_IN_PROGRESS {
            if self.config.policy.firmware == crate::ata::FirmwareBug::Samsung3
                && exec_status == 0xf0
            {
                log::info!(
                    "Device: {}, not skipping scheduled {test}Test despite unclear self-test byte",
                    self.config.name
                );
            } else {
                log::info!(
                    "Device: {}, skipping scheduled {test}Test, {}0% of a previous test remaining",
                    self.config.name,
                    exec_status & 0x0f
                );
                return;
            }
        }
        let subcommand = match test {
            TestType::Offline => 0,
            TestType::Short => 1,
            TestType::Long => 2,
            TestType::Conveyance => 3,
        };
        match ops::smart_exec(
            dev,
            crate::ata::SmartRequest::ImmediateOffline { subcommand },
            &mut [],
        ) {
            Ok(_) => {
                log::info!(
                    "Device: {}, starting scheduled {test}Test",
                    self.config.name
                );
            }
            Err(e) => {
                log::error!(
                    "Device: {}, execute {test}Test failed: {e}",
                    self.config.name
                );
            }
        }
    }

    /// One monitoring cycle for an ATA device.
    /// Checks run in a fixed order so that earlier failures short-circuit
    /// later ones that depend on the snapshot.
    pub(crate) fn check_ata(
        &mut self,
        dev: &mut TunnelDevice,
        now: &DateTime<Local>,
        power_grace: std::time::Duration,
    ) {
        let epoch = now.timestamp();
        self.send_test_notification(epoch);

        // 1: pick the scheduled test before the power check so a due
        // test is never missed because the drive is spun down
        let test = self.due_test(now);
        if test.is_none() && self.power_mode_skip(dev, power_grace) {
            return;
        }

        // 2: health
        if self.config.check_health {
            match ops::status_check(dev) {
                Ok(HealthStatus::Ok) => {}
                Ok(HealthStatus::Failing) => {
                    let message = format!(
                        "Device: {}, FAILED SMART self-check. BACK UP DATA NOW!",
                        self.config.name
                    );
                    log::error!("{message}");
                    self.notifier
                        .notify(&self.target, Category::Health, &message, epoch);
                }
                Err(e) => {
                    let message = format!(
                        "Device: {}, not capable of SMART self-check: {e}",
                        self.config.name
                    );
                    log::error!("{message}");
                    self.notifier.notify(
                        &self.target,
                        Category::FailedHealthCheck,
                        &message,
                        epoch,
                    );
                }
            }
        }

        // 3-5: attributes, sector counts, temperature
        let values = match ops::read_values(dev, &self.config.policy) {
            Ok(values) => Some(values),
            Err(e) => {
                let message = format!(
                    "Device: {}, failed to read SMART Attribute Data: {e}",
                    self.config.name
                );
                log::error!("{message}");
                self.notifier
                    .notify(&self.target, Category::FailedReadSmartData, &message, epoch);
                None
            }
        };
        if let Some(values) = &values {
            match ops::read_thresholds(dev, &self.config.policy) {
                Ok(thresholds) => {
                    self.check_attributes(values, &thresholds, epoch);
                }
                Err(e) => {
                    log::error!(
                        "Device: {}, failed to read SMART thresholds: {e}",
                        self.config.name
                    );
                }
            }
        }

        // 6: self-test log
        if self.config.check_selftest_log {
            match ops::read_selftest_log(dev, &self.config.policy) {
                Ok(log) => {
                    let (count, hour) = log.error_count_and_hour();
                    self.check_selftest_log(count, hour, epoch);
                }
                Err(e) => {
                    let message = format!(
                        "Device: {}, Read SMART Self-Test Log Failed: {e}",
                        self.config.name
                    );
                    log::error!("{message}");
                    self.notifier.notify(
                        &self.target,
                        Category::FailedReadSmartSelfTestLog,
                        &message,
                        epoch,
                    );
                }
            }
        }

        // 7: error log count, strictly increasing
        if self.config.check_error_log {
            match ops::read_error_count(dev, &self.config.policy) {
                Ok(count) => {
                    if let Some(old) = self.ata_errors {
                        if count > old {
                            let message = format!(
                                "Device: {}, ATA error count increased from {old} to {count}",
                                self.config.name
                            );
                            log::error!("{message}");
                            self.notifier
                                .notify(&self.target, Category::ErrorCount, &message, epoch);
                        }
                    }
                    self.ata_errors = Some(count);
                }
                Err(e) => {
                    let message = format!(
                        "Device: {}, Read SMART Error Log Failed: {e}",
                        self.config.name
                    );
                    log::error!("{message}");
                    self.notifier.notify(
                        &self.target,
                        Category::FailedReadSmartErrorLog,
                        &message,
                        epoch,
                    );
                }
            }
        }

        // 8: at most one scheduled test per cycle
        if let Some(test) = test {
            self.start_ata_test(dev, test, values.as_ref());
        }
    }

    /// One monitoring cycle for a SCSI device: unit readiness,
    /// informational exceptions, temperature, self-test results, and
    /// scheduled short/long tests
    pub(crate) fn check_scsi(&mut self, handle: &mut ScsiHandle, now: &DateTime<Local>) {
        let epoch = now.timestamp();
        self.send_test_notification(epoch);

        match scsi::test_unit_ready(handle.port_mut()) {
            Ok(None) => {}
            Ok(Some(sense)) => {
                if sense.key == scsi::SENSE_KEY_NOT_READY {
                    log::info!(
                        "Device: {}, not ready, skipping checks",
                        self.config.name
                    );
                } else {
                    log::info!(
                        "Device: {}, Test Unit Ready reported sense key {:#x}, skipping checks",
                        self.config.name,
                        sense.key
                    );
                }
                return;
            }
            Err(e) => {
                let message =
                    format!("Device: {}, failed Test Unit Ready: {e}", self.config.name);
                log::error!("{message}");
                self.notifier.notify(
                    &self.target,
                    Category::FailedHealthCheck,
                    &message,
                    epoch,
                );
                return;
            }
        }

        // informational exceptions, log page first, deferred sense second
        let mut ie_temp = None;
        let mut page = [0_u8; 64];
        let health = match scsi::log_sense(handle.port_mut(), scsi_health::PAGE_IE, &mut page) {
            Ok(()) => match scsi_health::IePage::decode(&page) {
                Ok(ie) => {
                    ie_temp = ie.current_temp;
                    Some(ie.health())
                }
                Err(e) => {
                    log::debug!("Device: {}, bad IE page: {e}", self.config.name);
                    None
                }
            },
            Err(_) => {
                let mut sense_buf = [0_u8; 32];
                scsi::request_sense(handle.port_mut(), &mut sense_buf)
                    .ok()
                    .and_then(|()| crate::scsi::SenseInfo::dissect(&sense_buf))
                    .map(|sense| scsi_health::health_from_sense(&sense))
            }
        };
        match health {
            Some(scsi_health::IeHealth::Failing(class)) => {
                let message = format!(
                    "Device: {}, SMART Failure: {class}",
                    self.config.name
                );
                log::error!("{message}");
                self.notifier
                    .notify(&self.target, Category::Health, &message, epoch);
            }
            Some(scsi_health::IeHealth::Ok) => {}
            None => {
                let message = format!(
                    "Device: {}, failed to read SMART values",
                    self.config.name
                );
                log::error!("{message}");
                self.notifier
                    .notify(&self.target, Category::FailedReadSmartData, &message, epoch);
            }
        }

        // temperature, preferring the dedicated page
        if self.config.temp_diff != 0 || self.config.temp_info != 0 || self.config.temp_crit != 0
        {
            let mut temp_page = [0_u8; 64];
            let reading =
                match scsi::log_sense(handle.port_mut(), scsi_health::PAGE_TEMPERATURE, &mut temp_page) {
                    Ok(()) => scsi_health::decode_temperature_page(&temp_page)
                        .ok()
                        .and_then(|(current, _)| current),
                    Err(_) => ie_temp,
                };
            self.check_temperature(reading, epoch);
        }

        // self-test results page feeds the same error tracking as ATA
        if self.config.check_selftest_log {
            let mut results_page = [0_u8; 512];
            match scsi::log_sense(handle.port_mut(), scsi_health::PAGE_SELF_TEST, &mut results_page)
            {
                Ok(()) => {
                    if let Ok(results) = scsi_health::decode_self_test_page(&results_page) {
                        let failures = results.iter().filter(|r| r.is_failure());
                        let count = failures.clone().count();
                        let hour = failures.map(|r| r.hour).max().unwrap_or(0);
                        self.check_selftest_log(count, hour, epoch);
                    }
                }
                Err(e) => {
                    let message = format!(
                        "Device: {}, Read SMART Self-Test Log Failed: {e}",
                        self.config.name
                    );
                    log::error!("{message}");
                    self.notifier.notify(
                        &self.target,
                        Category::FailedReadSmartSelfTestLog,
                        &message,
                        epoch,
                    );
                }
            }
        }

        // scheduled background tests, short and long only on SCSI
        self.not_capable[TestType::Conveyance.index()] = true;
        self.not_capable[TestType::Offline.index()] = true;
        if let Some(test) = self.due_test(now) {
            let diagnostic = match test {
                TestType::Long => scsi::DiagnosticTest::BackgroundExtended,
                _ => scsi::DiagnosticTest::BackgroundShort,
            };
            match scsi::send_diagnostic(handle.port_mut(), diagnostic) {
                Ok(()) => {
                    log::info!(
                        "Device: {}, starting scheduled {test}Test",
                        self.config.name
                    );
                }
                Err(e) => {
                    log::error!(
                        "Device: {}, execute {test}Test failed: {e}",
                        self.config.name
                    );
                }
            }
        }
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;
    use crate::{
        ata::{OutRegs, attr, ops::tests::mock_tunnel},
        dev::port::MockPort,
        tunnel::sat::tests::ard_sense,
    };

    /// Config with health checking and a notification address
    fn base_config() -> MonitorConfig {
        MonitorConfig {
            name: "/dev/sda".to_owned(),
            check_health: true,
            notify: NotifyConfig {
                address: Some("root".to_owned()),
                ..NotifyConfig::default()
            },
            ..MonitorConfig::default()
        }
    }

    /// Monitor over the given config, 30 minute interval
    fn monitor(config: MonitorConfig) -> DeviceMonitor {
        DeviceMonitor::new(config, NotifyTarget::default(), 1800)
    }

    /// Fixed local test time, a Monday 03:17
    fn test_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 3, 10, 3, 17, 0).unwrap()
    }

    /// Health status ARD reply
    fn health_reply(failing: bool) -> Vec<u8> {
        let (lba_mid, lba_high) = if failing { (0xf4, 0x2c) } else { (0x4f, 0xc2) };
        ard_sense(&OutRegs {
            lba_mid,
            lba_high,
            status: 0x50,
            ..OutRegs::default()
        })
    }

    #[test]
    fn failing_health_notifies_health_category() {
        let mut port = MockPort::default();
        port.push_sense(health_reply(true));
        port.push_data(attr::tests::sample_values_page());
        port.push_data(attr::tests::sample_thresholds_page());
        let mut dev = mock_tunnel(port);
        let mut mon = monitor(base_config());
        mon.check_ata(&mut dev, &test_time(), std::time::Duration::ZERO);
        assert_eq!(mon.notify_slot(Category::Health).times_sent, 1);
        assert_eq!(mon.notify_slot(Category::FailedHealthCheck).times_sent, 0);
    }

    #[test]
    fn healthy_drive_stays_silent() {
        let mut port = MockPort::default();
        port.push_sense(health_reply(false));
        port.push_data(attr::tests::sample_values_page());
        port.push_data(attr::tests::sample_thresholds_page());
        let mut dev = mock_tunnel(port);
        let mut mon = monitor(base_config());
        mon.check_ata(&mut dev, &test_time(), std::time::Duration::ZERO);
        assert_eq!(mon.notify_slot(Category::Health).times_sent, 0);
    }

    #[test]
    fn health_protocol_error_maps_to_failed_health_check() {
        let mut port = MockPort::default();
        // garbage signature registers
        port.push_sense(ard_sense(&OutRegs {
            lba_mid: 0x12,
            lba_high: 0x34,
            ..OutRegs::default()
        }));
        port.push_data(attr::tests::sample_values_page());
        port.push_data(attr::tests::sample_thresholds_page());
        let mut dev = mock_tunnel(port);
        let mut mon = monitor(base_config());
        mon.check_ata(&mut dev, &test_time(), std::time::Duration::ZERO);
        assert_eq!(mon.notify_slot(Category::FailedHealthCheck).times_sent, 1);
    }

    #[test]
    fn unreadable_smart_data_notifies() {
        let mut port = MockPort::default();
        port.push_sense(health_reply(false));
        port.push_err(DeviceError::Io("gone".to_owned()));
        let mut dev = mock_tunnel(port);
        let mut mon = monitor(base_config());
        mon.check_ata(&mut dev, &test_time(), std::time::Duration::ZERO);
        assert_eq!(mon.notify_slot(Category::FailedReadSmartData).times_sent, 1);
    }

    #[test]
    fn temperature_critical_crossing_notifies() {
        // configured -W 0,50,60; previous state 48 with min 30, max 55
        let mut config = base_config();
        config.temp_info = 50;
        config.temp_crit = 60;
        let mut mon = monitor(config);
        mon.temp = Some(TempTracker {
            current: 48,
            min: 30,
            max: 55,
        });
        mon.temp_min_raise_ticks = 0;
        mon.check_temperature(Some(62), 1000);
        assert_eq!(mon.notify_slot(Category::Temperature).times_sent, 1);
        let temp = mon.temp.unwrap();
        assert_eq!(temp.max, 62);
        assert_eq!(temp.min, 30);
    }

    #[test]
    fn temperature_below_limits_is_silent() {
        let mut config = base_config();
        config.temp_info = 50;
        config.temp_crit = 60;
        let mut mon = monitor(config);
        mon.check_temperature(Some(35), 1000);
        mon.check_temperature(Some(40), 2000);
        assert_eq!(mon.notify_slot(Category::Temperature).times_sent, 0);
    }

    #[test]
    fn temperature_unreadable_values_rejected() {
        let mut config = base_config();
        config.temp_crit = 60;
        let mut mon = monitor(config);
        mon.check_temperature(Some(0), 0);
        mon.check_temperature(Some(255), 0);
        mon.check_temperature(None, 0);
        assert!(mon.temp.is_none());
    }

    #[test]
    fn temperature_min_raises_during_grace_window() {
        let mut config = base_config();
        config.temp_diff = 1;
        let mut mon = monitor(config);
        mon.check_temperature(Some(25), 0); // initial, spin-up reading
        assert_eq!(mon.temp.unwrap().min, 25);
        let ticks = mon.temp_min_raise_ticks;
        mon.check_temperature(Some(31), 60);
        assert_eq!(mon.temp.unwrap().min, 31);
        assert_eq!(mon.temp_min_raise_ticks, ticks - 1);
        // a real new minimum ends the grace window
        mon.check_temperature(Some(24), 120);
        assert_eq!(mon.temp.unwrap().min, 24);
        assert_eq!(mon.temp_min_raise_ticks, 0);
    }

    #[test]
    fn selftest_error_count_increase_notifies() {
        let mut mon = monitor(base_config());
        // first observation establishes the baseline silently
        mon.check_selftest_log(1, 100, 0);
        assert_eq!(mon.notify_slot(Category::SelfTest).times_sent, 0);
        mon.check_selftest_log(2, 200, 10);
        assert_eq!(mon.notify_slot(Category::SelfTest).times_sent, 1);
    }

    #[test]
    fn selftest_newer_hour_same_count_notifies() {
        let mut config = base_config();
        config.notify.cadence = notify::Cadence::Daily;
        let mut mon = monitor(config);
        mon.check_selftest_log(1, 100, 0);
        // an overwritten ring slot: same count, later hour
        mon.check_selftest_log(1, 300, 90000);
        assert_eq!(mon.notify_slot(Category::SelfTest).times_sent, 1);
    }

    #[test]
    fn pending_sectors_notify() {
        let mut page = attr::tests::sample_values_page();
        attr::tests::put_attr(&mut page, 3, 197, 0x0022, 100, 100, &[8, 0, 0, 0, 0, 0]);
        page[511] = 0;
        page[511] = crate::bytes::page_checksum(&page, 0);
        let values = attr::decode_values(&page, &ProtocolPolicy::default()).unwrap();
        let thresholds = attr::decode_thresholds(
            &attr::tests::sample_thresholds_page(),
            &ProtocolPolicy::default(),
        )
        .unwrap();
        let mut config = base_config();
        config.pending_id = attr::ATTR_CURRENT_PENDING;
        config.uncorrectable_id = attr::ATTR_OFFLINE_UNCORRECTABLE;
        let mut mon = monitor(config);
        mon.check_attributes(&values, &thresholds, 0);
        assert_eq!(mon.notify_slot(Category::CurrentPendingSector).times_sent, 1);
        // attribute 198 is absent, so no uncorrectable notification
        assert_eq!(
            mon.notify_slot(Category::OfflineUncorrectableSector).times_sent,
            0
        );
    }

    #[test]
    fn increasing_flag_requires_strict_increase() {
        let mut config = base_config();
        config.pending_id = attr::ATTR_CURRENT_PENDING;
        let parsed: attr::ParsedAttrDef = "197,raw48+".parse().unwrap();
        config.attr_defs.apply(&parsed, attr::DefPriority::User);
        config.notify.cadence = notify::Cadence::Daily;
        let mut mon = monitor(config);

        let mut page = attr::tests::sample_values_page();
        attr::tests::put_attr(&mut page, 3, 197, 0x0022, 100, 100, &[8, 0, 0, 0, 0, 0]);
        page[511] = 0;
        page[511] = crate::bytes::page_checksum(&page, 0);
        let values = attr::decode_values(&page, &ProtocolPolicy::default()).unwrap();
        let thresholds = attr::decode_thresholds(
            &attr::tests::sample_thresholds_page(),
            &ProtocolPolicy::default(),
        )
        .unwrap();
        // first cycle: no snapshot yet, a nonzero count fires
        mon.check_attributes(&values, &thresholds, 0);
        assert_eq!(mon.notify_slot(Category::CurrentPendingSector).times_sent, 1);
        // unchanged raw value does not fire again
        mon.check_attributes(&values, &thresholds, 90000);
        assert_eq!(mon.notify_slot(Category::CurrentPendingSector).times_sent, 1);
        // a strict increase fires
        let mut page2 = page.clone();
        attr::tests::put_attr(&mut page2, 3, 197, 0x0022, 100, 100, &[9, 0, 0, 0, 0, 0]);
        page2[511] = 0;
        page2[511] = crate::bytes::page_checksum(&page2, 0);
        let values2 = attr::decode_values(&page2, &ProtocolPolicy::default()).unwrap();
        mon.check_attributes(&values2, &thresholds, 180_000);
        assert_eq!(mon.notify_slot(Category::CurrentPendingSector).times_sent, 2);
    }

    #[test]
    fn scheduled_short_test_issued() {
        // literal scenario: S/../../[1-5]/03 on a Monday at 03:17
        let mut config = base_config();
        config.schedule = Some(TestSchedule::new("S/../../[1-5]/03").unwrap());
        let mut port = MockPort::default();
        port.push_sense(health_reply(false));
        port.push_data(attr::tests::sample_values_page());
        port.push_data(attr::tests::sample_thresholds_page());
        port.push_ok(); // immediate offline
        let observer = port.clone();
        let mut dev = mock_tunnel(port);
        let mut mon = monitor(config);
        mon.check_ata(&mut dev, &test_time(), std::time::Duration::ZERO);
        let issued = observer.issued();
        assert_eq!(issued.len(), 4);
        // last CDB carries SMART IMMEDIATE OFFLINE, short subcommand
        let last = issued.last().unwrap();
        assert_eq!(last[4], 0xd4);
        assert_eq!(last[8], 1);
        // the hour bucket is consumed, the next cycle does not re-issue
        let mut port = MockPort::default();
        port.push_sense(health_reply(false));
        port.push_data(attr::tests::sample_values_page());
        port.push_data(attr::tests::sample_thresholds_page());
        let observer = port.clone();
        let mut dev = mock_tunnel(port);
        mon.check_ata(&mut dev, &test_time(), std::time::Duration::ZERO);
        assert_eq!(observer.issued().len(), 3);
    }

    #[test]
    fn scheduled_test_deferred_while_in_progress() {
        let mut config = base_config();
        config.schedule = Some(TestSchedule::new("S/../../../..").unwrap());
        let mut page = attr::tests::sample_values_page();
        page[363] = 0xf5; // in progress, 50% remaining
        page[511] = 0;
        page[511] = crate::bytes::page_checksum(&page, 0);
        let mut port = MockPort::default();
        port.push_sense(health_reply(false));
        port.push_data(page);
        port.push_data(attr::tests::sample_thresholds_page());
        let observer = port.clone();
        let mut dev = mock_tunnel(port);
        let mut mon = monitor(config);
        mon.check_ata(&mut dev, &test_time(), std::time::Duration::ZERO);
        // no immediate offline was issued
        assert_eq!(observer.issued().len(), 3);
    }

    #[test]
    fn incapable_test_type_latches() {
        let mut config = base_config();
        config.schedule = Some(TestSchedule::new("C/../../../..").unwrap());
        let mut page = attr::tests::sample_values_page();
        page[367] = 0x11; // no conveyance capability
        page[511] = 0;
        page[511] = crate::bytes::page_checksum(&page, 0);
        let mut port = MockPort::default();
        port.push_sense(health_reply(false));
        port.push_data(page);
        port.push_data(attr::tests::sample_thresholds_page());
        let mut dev = mock_tunnel(port);
        let mut mon = monitor(config);
        mon.check_ata(&mut dev, &test_time(), std::time::Duration::ZERO);
        assert!(mon.not_capable[TestType::Conveyance.index()]);
    }

    #[test]
    fn power_floor_skips_checks() {
        let mut config = base_config();
        config.power_floor = PowerFloor::Standby;
        // standby twice: the probe and the grace re-read
        let standby = ard_sense(&OutRegs {
            sector_count: 0x00,
            status: 0x50,
            ..OutRegs::default()
        });
        let mut port = MockPort::default();
        port.push_sense(standby.clone());
        port.push_sense(standby);
        let observer = port.clone();
        let mut dev = mock_tunnel(port);
        let mut mon = monitor(config);
        mon.check_ata(&mut dev, &test_time(), std::time::Duration::ZERO);
        // only the two power probes went out, no health or attribute reads
        assert_eq!(observer.issued().len(), 2);
        assert_eq!(mon.skipped_checks, 1);
        assert_eq!(mon.notify_slot(Category::Health).times_sent, 0);
    }

    #[test]
    fn active_drive_not_skipped() {
        let mut config = base_config();
        config.power_floor = PowerFloor::Standby;
        let active = ard_sense(&OutRegs {
            sector_count: 0xff,
            status: 0x50,
            ..OutRegs::default()
        });
        let mut port = MockPort::default();
        port.push_sense(active);
        port.push_sense(health_reply(false));
        port.push_data(attr::tests::sample_values_page());
        port.push_data(attr::tests::sample_thresholds_page());
        let observer = port.clone();
        let mut dev = mock_tunnel(port);
        let mut mon = monitor(config);
        mon.check_ata(&mut dev, &test_time(), std::time::Duration::ZERO);
        assert_eq!(observer.issued().len(), 4);
        assert_eq!(mon.skipped_checks, 0);
    }

    #[test]
    fn snapshot_dropped_when_unneeded() {
        let values = attr::decode_values(
            &attr::tests::sample_values_page(),
            &ProtocolPolicy::default(),
        )
        .unwrap();
        let thresholds = attr::decode_thresholds(
            &attr::tests::sample_thresholds_page(),
            &ProtocolPolicy::default(),
        )
        .unwrap();
        // nothing configured that needs history
        let mut mon = monitor(base_config());
        mon.check_attributes(&values, &thresholds, 0);
        assert!(mon.smart_snapshot.is_none());
        // raw tracking retains the snapshot
        let mut config = base_config();
        config.bitsets.raw_track.set(9);
        let mut mon = monitor(config);
        mon.check_attributes(&values, &thresholds, 0);
        assert!(mon.smart_snapshot.is_some());
    }

    #[test]
    fn failed_usage_attribute_notifies() {
        let mut page = attr::tests::sample_values_page();
        // usage attribute (not prefail) below threshold
        attr::tests::put_attr(&mut page, 1, 9, 0x0012, 10, 10, &[0, 0, 0, 0, 0, 0]);
        page[511] = 0;
        page[511] = crate::bytes::page_checksum(&page, 0);
        let values = attr::decode_values(&page, &ProtocolPolicy::default()).unwrap();
        let mut thres_page = attr::tests::sample_thresholds_page();
        thres_page[2 + 12 + 1] = 20; // threshold 20 for attribute 9
        thres_page[511] = 0;
        thres_page[511] = crate::bytes::page_checksum(&thres_page, 0);
        let thresholds =
            attr::decode_thresholds(&thres_page, &ProtocolPolicy::default()).unwrap();
        let mut config = base_config();
        config.monitor_usage = true;
        let mut mon = monitor(config);
        mon.check_attributes(&values, &thresholds, 0);
        assert_eq!(mon.notify_slot(Category::Usage).times_sent, 1);

        // the ignore set masks the notification
        let mut config = base_config();
        config.monitor_usage = true;
        config.bitsets.failure_ignore.set(9);
        let mut mon = monitor(config);
        mon.check_attributes(&values, &thresholds, 0);
        assert_eq!(mon.notify_slot(Category::Usage).times_sent, 0);
    }

    #[test]
    fn attr_bitset_operations() {
        let mut set = AttrBitset::default();
        assert!(!set.any());
        set.set(197);
        assert!(set.get(197));
        assert!(!set.get(198));
        assert!(set.any());
        set.set(0);
        set.set(255);
        assert!(set.get(0) && set.get(255));
    }

    #[test]
    fn scsi_ie_failure_notifies_health() {
        let mut port = MockPort::default();
        port.push_ok(); // TUR
        port.push_data(crate::scsi::health::tests::ie_page(0x5d, 0x10, None).clone());
        let mut handle = ScsiHandle::new(Box::new(port), "/dev/_mock", "scsi");
        let mut mon = monitor(base_config());
        mon.check_scsi(&mut handle, &test_time());
        assert_eq!(mon.notify_slot(Category::Health).times_sent, 1);
    }

    #[test]
    fn scsi_not_ready_skips_cycle() {
        let mut port = MockPort::default();
        port.push_sense(vec![0x70, 0, 0x02, 0, 0, 0, 0, 0]); // not ready
        let observer = port.clone();
        let mut handle = ScsiHandle::new(Box::new(port), "/dev/_mock", "scsi");
        let mut mon = monitor(base_config());
        mon.check_scsi(&mut handle, &test_time());
        assert_eq!(observer.issued().len(), 1);
        assert_eq!(mon.notify_slot(Category::Health).times_sent, 0);
    }

    #[test]
    fn scsi_scheduled_short_test() {
        let mut config = base_config();
        config.schedule = Some(TestSchedule::new("S/../../../..").unwrap());
        let mut port = MockPort::default();
        port.push_ok(); // TUR
        port.push_data(crate::scsi::health::tests::ie_page(0, 0, None).clone());
        port.push_ok(); // send diagnostic
        let observer = port.clone();
        let mut handle = ScsiHandle::new(Box::new(port), "/dev/_mock", "scsi");
        let mut mon = monitor(config);
        mon.check_scsi(&mut handle, &test_time());
        let issued = observer.issued();
        let last = issued.last().unwrap();
        assert_eq!(last[0], 0x1d); // SEND DIAGNOSTIC
        assert_eq!(last[1], 0x20); // background short
    }
}
