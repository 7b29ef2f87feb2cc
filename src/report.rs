//! On-demand device inspector

use std::str::FromStr;

use crate::{
    ata::{
        HealthStatus, ProtocolPolicy, SmartRequest,
        attr::{self, AttrDefs, AttrState, attr_state},
        ops,
        selftest::{ScanAfter, SpanArg, SpanMode},
    },
    dev::Device,
    error::DeviceError,
    mon::PowerFloor,
    scsi::{self, health as scsi_health},
    tunnel::TunnelDevice,
};

/// Exit bit: command line could not be parsed
pub(crate) const FAILCMD: i32 = 1 << 0;
/// Exit bit: device could not be opened or is skipped
pub(crate) const FAILDEV: i32 = 1 << 1;
/// Exit bit: a SMART or other device command failed
pub(crate) const FAILSMART: i32 = 1 << 2;
/// Exit bit: health status reports failing
pub(crate) const FAILSTATUS: i32 = 1 << 3;
/// Exit bit: prefailure attributes at or below threshold
pub(crate) const FAILATTR: i32 = 1 << 4;
/// Exit bit: usage attributes at or below threshold
pub(crate) const FAILAGE: i32 = 1 << 5;
/// Exit bit: attributes were at or below threshold in the past
pub(crate) const FAILPREV: i32 = 1 << 6;
/// Exit bit: the error or self-test logs record errors
pub(crate) const FAILLOG: i32 = 1 << 7;

/// One `-l` log selection
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum LogRequest {
    /// SMART error log
    Error,
    /// Standard self-test log
    SelfTest,
    /// Extended self-test log, with sector count
    ExtSelfTest(u8),
    /// Selective self-test log
    Selective,
    /// SCT status
    ScttempSts,
    /// SCT temperature history
    ScttempHist,
    /// SCSI background self-test results
    Background,
}

impl FromStr for LogRequest {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(Self::Error),
            "selftest" => Ok(Self::SelfTest),
            "selective" => Ok(Self::Selective),
            "scttemp" | "scttempsts" => Ok(Self::ScttempSts),
            "scttemphist" => Ok(Self::ScttempHist),
            "background" => Ok(Self::Background),
            other => {
                if let Some(rest) = other.strip_prefix("xselftest") {
                    let nsectors = match rest.strip_prefix(',') {
                        Some(n) => n.parse().map_err(|_| {
                            DeviceError::InvalidArgument(format!("bad sector count in {other:?}"))
                        })?,
                        None if rest.is_empty() => 1,
                        None => {
                            return Err(DeviceError::InvalidArgument(format!(
                                "unknown log type {other:?}"
                            )));
                        }
                    };
                    return Ok(Self::ExtSelfTest(nsectors));
                }
                Err(DeviceError::InvalidArgument(format!(
                    "unknown log type {other:?}"
                )))
            }
        }
    }
}

/// One `-t` test selection
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TestRequest {
    /// Immediate offline data collection
    Offline,
    /// Short self-test
    Short,
    /// Extended self-test
    Long,
    /// Conveyance self-test
    Conveyance,
    /// Selective self-test over the given spans
    Select(Vec<SpanArg>),
    /// Set the selective pending timer, minutes
    Pending(u16),
    /// Enable or disable the scan-after-selective flag
    AfterSelect(bool),
    /// Set the SCT temperature logging interval, minutes + persistence
    ScttempInt(u16, bool),
}

impl FromStr for TestRequest {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offline" => Ok(Self::Offline),
            "short" => Ok(Self::Short),
            "long" => Ok(Self::Long),
            "conveyance" => Ok(Self::Conveyance),
            "afterselect,on" => Ok(Self::AfterSelect(true)),
            "afterselect,off" => Ok(Self::AfterSelect(false)),
            other => {
                if let Some(rest) = other.strip_prefix("select,") {
                    return Ok(Self::Select(vec![parse_span(rest)?]));
                }
                if let Some(rest) = other.strip_prefix("pending,") {
                    let minutes = rest.parse().map_err(|_| {
                        DeviceError::InvalidArgument(format!("bad pending minutes {rest:?}"))
                    })?;
                    return Ok(Self::Pending(minutes));
                }
                if let Some(rest) = other.strip_prefix("scttempint,") {
                    let (minutes, persist) = match rest.strip_suffix(",p") {
                        Some(m) => (m, true),
                        None => (rest, false),
                    };
                    let minutes = minutes.parse().map_err(|_| {
                        DeviceError::InvalidArgument(format!("bad interval {rest:?}"))
                    })?;
                    return Ok(Self::ScttempInt(minutes, persist));
                }
                Err(DeviceError::InvalidArgument(format!(
                    "unknown test type {other:?}"
                )))
            }
        }
    }
}

/// Parse one selective span: `N-M`, `N+SIZE`, `redo[+SIZE]`,
/// `next[+SIZE]`, `cont[+SIZE]`; `M` may be `max`
fn parse_span(s: &str) -> Result<SpanArg, DeviceError> {
    let bad = || DeviceError::InvalidArgument(format!("bad selective span {s:?}"));
    for (keyword, mode) in [
        ("redo", SpanMode::Redo),
        ("next", SpanMode::Next),
        ("cont", SpanMode::Cont),
    ] {
        if let Some(rest) = s.strip_prefix(keyword) {
            let size = match rest.strip_prefix('+') {
                Some(size) => size.parse().map_err(|_| bad())?,
                None if rest.is_empty() => 0,
                None => return Err(bad()),
            };
            return Ok(SpanArg {
                mode,
                start: 0,
                end: size,
            });
        }
    }
    if let Some((start, end)) = s.split_once('-') {
        let start = start.parse().map_err(|_| bad())?;
        let end = if end == "max" {
            u64::MAX
        } else {
            end.parse().map_err(|_| bad())?
        };
        return Ok(SpanArg {
            mode: SpanMode::Range,
            start,
            end,
        });
    }
    if let Some((start, size)) = s.split_once('+') {
        let start: u64 = start.parse().map_err(|_| bad())?;
        let size: u64 = size.parse().map_err(|_| bad())?;
        if size == 0 {
            return Err(bad());
        }
        return Ok(SpanArg {
            mode: SpanMode::Range,
            start,
            end: start + size - 1,
        });
    }
    Err(bad())
}

/// What the inspector was asked to do
#[derive(Clone, Debug, Default)]
pub(crate) struct ReportOptions {
    /// Print identity information
    pub info: bool,
    /// Run and print the health check
    pub health: bool,
    /// Print capability information
    pub capabilities: bool,
    /// Print the attribute table
    pub attributes: bool,
    /// Logs to print
    pub logs: Vec<LogRequest>,
    /// Tests to start
    pub tests: Vec<TestRequest>,
    /// Abort a running self-test
    pub abort: bool,
    /// Run self-tests in captive (foreground) mode
    pub captive: bool,
    /// Enable or disable SMART
    pub smart: Option<bool>,
    /// Enable or disable automatic offline testing
    pub auto_offline: Option<bool>,
    /// Enable or disable attribute autosave
    pub auto_save: Option<bool>,
    /// Skip the check when below this power state
    pub nocheck: PowerFloor,
    /// Decoder policy
    pub policy: ProtocolPolicy,
    /// Attribute display definitions
    pub attr_defs: AttrDefs,
    /// Keep going after failed mandatory commands?
    pub permissive: bool,
}

/// Abort subcommand of SMART EXECUTE OFF-LINE IMMEDIATE
const SUBCOMMAND_ABORT: u8 = 127;

/// Accumulated exit bits
#[derive(Debug, Default)]
struct ReportStatus {
    /// Exit code bits
    bits: i32,
}

impl ReportStatus {
    /// Record a failed SMART command
    fn command_failed(&mut self, what: &str, err: &DeviceError) {
        log::error!("{what} failed: {err}");
        self.bits |= FAILSMART;
    }
}

/// Run the inspector on an open device, returning the exit bits
pub(crate) fn run(device: &mut Device, options: &ReportOptions) -> i32 {
    match device {
        Device::Ata(tunnel) => run_ata(tunnel, options),
        Device::Scsi(handle) => {
            let port = handle.port_mut();
            run_scsi(port, options)
        }
    }
}

/// Inspect an ATA device
#[expect(clippy::too_many_lines)]
fn run_ata(dev: &mut TunnelDevice, options: &ReportOptions) -> i32 {
    let mut status = ReportStatus::default();

    // honor the power state floor before waking the drive with reads
    if options.nocheck != PowerFloor::Never {
        match ops::check_power_mode(dev) {
            Ok(mode) => {
                let skip = match mode {
                    crate::ata::PowerMode::Standby => options.nocheck >= PowerFloor::Standby,
                    crate::ata::PowerMode::Idle => options.nocheck >= PowerFloor::Idle,
                    crate::ata::PowerMode::Active => false,
                };
                if skip {
                    println!("Device is in {mode} mode, exit(2)");
                    return FAILDEV;
                }
            }
            Err(_) if options.nocheck >= PowerFloor::Sleep => {
                println!("Device is in SLEEP mode, exit(2)");
                return FAILDEV;
            }
            Err(_) => {}
        }
    }

    let identify = match ops::read_identify(dev, &options.policy) {
        Ok(identify) => Some(identify),
        Err(e) => {
            status.command_failed("IDENTIFY DEVICE", &e);
            if !options.permissive {
                // a drive that cannot identify will not answer anything else
                return status.bits;
            }
            None
        }
    };

    if options.info {
        if let Some(id) = &identify {
            println!("=== START OF INFORMATION SECTION ===");
            println!("Model Number:     {}", id.model);
            println!("Serial Number:    {}", id.serial);
            println!("Firmware Version: {}", id.firmware);
            println!(
                "User Capacity:    {} sectors ({} bytes)",
                id.num_sectors,
                id.num_sectors * 512
            );
            println!(
                "SMART support is: {}",
                match (id.smart_supported, id.smart_enabled) {
                    (false, _) => "Unavailable",
                    (true, false) => "Disabled",
                    (true, true) => "Enabled",
                }
            );
        }
    }

    if let Some(enable) = options.smart {
        let req = if enable {
            SmartRequest::Enable
        } else {
            SmartRequest::Disable
        };
        match ops::smart_exec(dev, req, &mut []) {
            Ok(_) => println!("SMART {}", if enable { "Enabled" } else { "Disabled" }),
            Err(e) => status.command_failed("SMART ENABLE/DISABLE", &e),
        }
    }
    if let Some(enable) = options.auto_offline {
        match ops::smart_exec(dev, SmartRequest::AutoOffline { enable }, &mut []) {
            Ok(_) => println!(
                "SMART automatic offline testing {}",
                if enable { "enabled" } else { "disabled" }
            ),
            Err(e) => status.command_failed("SMART AUTO OFFLINE", &e),
        }
    }
    if let Some(enable) = options.auto_save {
        match ops::smart_exec(dev, SmartRequest::AutoSave { enable }, &mut []) {
            Ok(_) => println!(
                "SMART attribute autosave {}",
                if enable { "enabled" } else { "disabled" }
            ),
            Err(e) => status.command_failed("SMART AUTOSAVE", &e),
        }
    }

    if options.health {
        match ops::status_check(dev) {
            Ok(HealthStatus::Ok) => {
                println!("SMART overall-health self-assessment test result: PASSED");
            }
            Ok(HealthStatus::Failing) => {
                println!("SMART overall-health self-assessment test result: FAILED!");
                println!("Drive failure expected in less than 24 hours. SAVE ALL DATA.");
                status.bits |= FAILSTATUS;
            }
            Err(e) => status.command_failed("SMART STATUS", &e),
        }
    }

    let values = if options.capabilities || options.attributes || !options.tests.is_empty() {
        match ops::read_values(dev, &options.policy) {
            Ok(values) => Some(values),
            Err(e) => {
                status.command_failed("SMART READ DATA", &e);
                None
            }
        }
    } else {
        None
    };

    if options.capabilities {
        if let Some(values) = &values {
            println!("=== START OF READ SMART DATA SECTION ===");
            println!(
                "Offline data collection status: ({:#04x})",
                values.offline_status
            );
            println!(
                "Self-test execution status:     ({:#05x})",
                values.self_test_exec_status
            );
            println!(
                "Self-test supported:            {}",
                if values.supports_self_test() { "yes" } else { "no" }
            );
            println!(
                "Conveyance self-test supported: {}",
                if values.supports_conveyance_test() { "yes" } else { "no" }
            );
            println!(
                "Selective self-test supported:  {}",
                if values.supports_selective_test() { "yes" } else { "no" }
            );
            println!(
                "Error logging supported:        {}",
                if values.supports_error_log() { "yes" } else { "no" }
            );
            println!("Short self-test time:           {} minutes", values.short_test_minutes);
            println!(
                "Extended self-test time:        {} minutes",
                values.extended_test_minutes
            );
        }
    }

    if options.attributes {
        if let Some(values) = &values {
            match ops::read_thresholds(dev, &options.policy) {
                Ok(thresholds) => {
                    print_attributes(values, &thresholds, &options.attr_defs, &mut status);
                }
                Err(e) => status.command_failed("SMART READ THRESHOLDS", &e),
            }
        }
    }

    for log in &options.logs {
        match log {
            LogRequest::Error => match ops::read_error_count(dev, &options.policy) {
                Ok(count) => {
                    println!("ATA Error Count: {count}");
                    if count > 0 {
                        status.bits |= FAILLOG;
                    }
                }
                Err(e) => status.command_failed("SMART ERROR LOG", &e),
            },
            LogRequest::SelfTest => match ops::read_selftest_log(dev, &options.policy) {
                Ok(log) => print_selftest_log(&log, &mut status),
                Err(e) => status.command_failed("SMART SELF-TEST LOG", &e),
            },
            LogRequest::ExtSelfTest(nsectors) => {
                match ops::read_ext_selftest_log(dev, *nsectors, &options.policy) {
                    Ok(log) => print_selftest_log(&log, &mut status),
                    Err(e) => status.command_failed("EXTENDED SELF-TEST LOG", &e),
                }
            }
            LogRequest::Selective => match ops::read_selective_log(dev, &options.policy) {
                Ok(log) => {
                    println!("SMART Selective self-test log data structure revision number {}", log.version);
                    println!(" SPAN  MIN_LBA  MAX_LBA");
                    for (i, (start, end)) in log.spans.iter().enumerate() {
                        println!("    {}  {start}  {end}", i + 1);
                    }
                }
                Err(e) => status.command_failed("SELECTIVE SELF-TEST LOG", &e),
            },
            LogRequest::ScttempSts => match ops::read_sct_status(dev) {
                Ok(sct) => {
                    println!("SCT Status Version:        {}", sct.format_version);
                    if let Some(temp) = sct.current_temp {
                        println!("Current Temperature:       {temp} Celsius");
                    }
                    if let (Some(min), Some(max)) =
                        (sct.power_cycle_min_temp, sct.power_cycle_max_temp)
                    {
                        println!("Power Cycle Min/Max Temperature: {min}/{max} Celsius");
                    }
                    if let (Some(min), Some(max)) = (sct.life_min_temp, sct.life_max_temp) {
                        println!("Lifetime    Min/Max Temperature: {min}/{max} Celsius");
                    }
                }
                Err(e) => status.command_failed("SCT STATUS", &e),
            },
            LogRequest::ScttempHist => match ops::read_sct_temp_history(dev) {
                Ok((_, history)) => {
                    println!(
                        "Temperature history, one sample every {} minute(s):",
                        history.interval
                    );
                    for (i, sample) in history.samples.iter().enumerate() {
                        match sample {
                            Some(temp) => println!("  {i:3}  {temp} Celsius"),
                            None => println!("  {i:3}  ?"),
                        }
                    }
                }
                Err(e) => status.command_failed("SCT TEMPERATURE HISTORY", &e),
            },
            LogRequest::Background => {
                log::warn!("background results log is a SCSI page, ignored on ATA");
            }
        }
    }

    run_ata_tests(dev, options, identify.as_ref(), &mut status);

    if options.abort {
        match ops::smart_exec(
            dev,
            SmartRequest::ImmediateOffline {
                subcommand: SUBCOMMAND_ABORT,
            },
            &mut [],
        ) {
            Ok(_) => println!("Self-test aborted"),
            Err(e) => status.command_failed("SELF-TEST ABORT", &e),
        }
    }

    status.bits
}

/// Start requested tests on an ATA device
fn run_ata_tests(
    dev: &mut TunnelDevice,
    options: &ReportOptions,
    identify: Option<&crate::ata::identify::IdentifyInfo>,
    status: &mut ReportStatus,
) {
    // selective arguments combine into a single log write
    let mut spans: Vec<SpanArg> = Vec::new();
    let mut scan_after = ScanAfter::Keep;
    let mut pending = None;
    for test in &options.tests {
        match test {
            TestRequest::Offline | TestRequest::Short | TestRequest::Long
            | TestRequest::Conveyance => {
                let mut subcommand = match test {
                    TestRequest::Offline => 0,
                    TestRequest::Short => 1,
                    TestRequest::Long => 2,
                    _ => 3,
                };
                // captive variants live 128 above; offline has none
                if options.captive && subcommand != 0 {
                    subcommand += 128;
                }
                match ops::smart_exec(
                    dev,
                    SmartRequest::ImmediateOffline { subcommand },
                    &mut [],
                ) {
                    Ok(_) => println!("Drive command successful, testing has begun."),
                    Err(e) => status.command_failed("SMART EXECUTE OFF-LINE IMMEDIATE", &e),
                }
            }
            TestRequest::Select(s) => spans.extend_from_slice(s),
            TestRequest::Pending(minutes) => pending = Some(*minutes),
            TestRequest::AfterSelect(enable) => {
                scan_after = if *enable { ScanAfter::On } else { ScanAfter::Off };
            }
            TestRequest::ScttempInt(minutes, persist) => {
                match ops::set_sct_temp_interval(dev, *minutes, *persist) {
                    Ok(()) => println!("Temperature logging interval set to {minutes} minute(s)"),
                    Err(e) => status.command_failed("SCT FEATURE CONTROL", &e),
                }
            }
        }
    }
    if !spans.is_empty() || pending.is_some() || scan_after != ScanAfter::Keep {
        let num_sectors = identify.map_or(0, |id| id.num_sectors);
        match ops::write_selective_log(
            dev,
            num_sectors,
            &spans,
            scan_after,
            pending,
            &options.policy,
        ) {
            Ok(written) => {
                for (i, (start, end)) in written
                    .spans
                    .iter()
                    .enumerate()
                    .filter(|(_, (s, e))| *s != 0 || *e != 0)
                {
                    println!("Span {i} from LBA {start} to {end}");
                }
                let subcommand = if options.captive { 132 } else { 4 };
                match ops::smart_exec(
                    dev,
                    SmartRequest::ImmediateOffline { subcommand },
                    &mut [],
                ) {
                    Ok(_) => println!("Selective self-test has begun."),
                    Err(e) => status.command_failed("SELECTIVE SELF-TEST START", &e),
                }
            }
            Err(DeviceError::Busy(e)) => {
                log::error!("{e}; use '-X' to abort the running test first");
                status.bits |= FAILSMART;
            }
            Err(e) => status.command_failed("SELECTIVE SELF-TEST LOG WRITE", &e),
        }
    }
}

/// Print the attribute table and set the failure bits
fn print_attributes(
    values: &crate::ata::attr::SmartValues,
    thresholds: &crate::ata::attr::SmartThresholds,
    defs: &AttrDefs,
    status: &mut ReportStatus,
) {
    println!(
        "SMART Attributes Data Structure revision number: {}",
        values.revision
    );
    println!("ID# ATTRIBUTE_NAME          FLAG     VALUE WORST THRESH TYPE      WHEN_FAILED RAW_VALUE");
    for (slot_idx, slot) in values.table.iter().enumerate() {
        if slot.id == 0 {
            continue;
        }
        let def = defs.get(slot.id);
        let state = attr_state(slot, thresholds.row(slot_idx), def);
        let threshold = thresholds
            .row(slot_idx)
            .map_or("---".to_owned(), |(_, t)| format!("{t:03}"));
        let when_failed = match state {
            AttrState::FailedNow => {
                status.bits |= if slot.is_prefailure() { FAILATTR } else { FAILAGE };
                "FAILING_NOW"
            }
            AttrState::FailedPast => {
                status.bits |= FAILPREV;
                "In_the_past"
            }
            _ => "-",
        };
        let name = def
            .name
            .as_deref()
            .unwrap_or("Unknown_Attribute")
            .to_owned();
        println!(
            "{:3} {name:<23} {:#06x}   {:03}   {:03}   {threshold}    {:<9} {when_failed:<11} {}",
            slot.id,
            slot.flags.bits(),
            slot.current,
            slot.worst,
            if slot.is_prefailure() { "Pre-fail" } else { "Old_age" },
            attr::render_raw(slot, def),
        );
    }
}

/// Print a decoded self-test log and set the log failure bit
fn print_selftest_log(log: &crate::ata::selftest::SelfTestLog, status: &mut ReportStatus) {
    println!(
        "SMART Self-test log structure revision number {}",
        log.revision
    );
    if log.entries.is_empty() {
        println!("No self-tests have been logged.");
        return;
    }
    println!("Num  Status                                 Remaining  LifeTime(hours)  LBA_of_first_error");
    for (i, entry) in log.entries.iter().enumerate() {
        println!(
            "# {:2}  {:<38} {:3}%       {:>5}            {}",
            i + 1,
            entry.status.to_string(),
            entry.remaining_pct,
            entry.hour,
            entry
                .failing_lba
                .map_or("-".to_owned(), |lba| lba.to_string()),
        );
    }
    let (errors, _) = log.error_count_and_hour();
    if errors > 0 {
        status.bits |= FAILLOG;
    }
}

/// Inspect a SCSI device
fn run_scsi(port: &mut dyn crate::dev::port::Port, options: &ReportOptions) -> i32 {
    let mut status = ReportStatus::default();

    if options.info {
        let mut inq = [0_u8; 64];
        match scsi::inquiry(port, &mut inq[..36]) {
            Ok(()) => {
                let text = |range: std::ops::Range<usize>| {
                    String::from_utf8_lossy(inq.get(range).unwrap_or_default())
                        .trim()
                        .to_owned()
                };
                println!("Vendor:   {}", text(8..16));
                println!("Product:  {}", text(16..32));
                println!("Revision: {}", text(32..36));
            }
            Err(e) => status.command_failed("INQUIRY", &e),
        }
        // unit serial number vital product data page
        let mut vpd = [0_u8; 64];
        if scsi::inquiry_vpd(port, 0x80, &mut vpd).is_ok() && vpd[1] == 0x80 {
            let len = usize::from(vpd[3]).min(vpd.len() - 4);
            let serial = String::from_utf8_lossy(vpd.get(4..4 + len).unwrap_or_default());
            let serial = serial.trim();
            if !serial.is_empty() {
                println!("Serial:   {serial}");
            }
        }
    }

    if options.health {
        let mut page = [0_u8; 64];
        let health = scsi::log_sense(port, scsi_health::PAGE_IE, &mut page)
            .and_then(|()| scsi_health::IePage::decode(&page))
            .map(|ie| ie.health());
        match health {
            Ok(scsi_health::IeHealth::Ok) => {
                println!("SMART Health Status: OK");
            }
            Ok(scsi_health::IeHealth::Failing(class)) => {
                println!("SMART Health Status: {class} [asc=0x5d]");
                status.bits |= FAILSTATUS;
            }
            Err(e) => status.command_failed("INFORMATIONAL EXCEPTIONS", &e),
        }
    }

    if options.attributes {
        let mut page = [0_u8; 64];
        match scsi::log_sense(port, scsi_health::PAGE_TEMPERATURE, &mut page)
            .and_then(|()| scsi_health::decode_temperature_page(&page))
        {
            Ok((Some(current), reference)) => {
                println!("Current Drive Temperature:     {current} C");
                if let Some(reference) = reference {
                    println!("Drive Trip Temperature:        {reference} C");
                }
            }
            Ok((None, _)) => println!("Temperature could not be read"),
            Err(e) => status.command_failed("TEMPERATURE PAGE", &e),
        }
        let mut cycles = [0_u8; 64];
        if let Ok(counters) = scsi::log_sense(port, scsi_health::PAGE_START_STOP, &mut cycles)
            .and_then(|()| scsi_health::decode_start_stop_page(&cycles))
        {
            if let Some(date) = counters.manufacture_date {
                println!("Manufactured in {date}");
            }
            if let Some(specified) = counters.specified_cycles {
                println!("Specified cycle count over device lifetime: {specified}");
            }
            if let Some(accumulated) = counters.accumulated_cycles {
                println!("Accumulated start-stop cycles: {accumulated}");
            }
        }
    }

    for log in &options.logs {
        if matches!(log, LogRequest::Error) {
            // tape libraries report their trouble through TapeAlert
            let mut page = [0_u8; 128];
            match scsi::log_sense(port, scsi_health::PAGE_TAPE_ALERT, &mut page)
                .and_then(|()| scsi_health::decode_tape_alert_page(&page))
            {
                Ok(active) if active.is_empty() => println!("TapeAlert: OK"),
                Ok(active) => {
                    for flag in active {
                        println!("TapeAlert flag {flag} active");
                    }
                    status.bits |= FAILLOG;
                }
                Err(e) => log::debug!("TapeAlert page unavailable: {e}"),
            }
        }
        if matches!(log, LogRequest::SelfTest | LogRequest::Background) {
            let mut page = [0_u8; 512];
            match scsi::log_sense(port, scsi_health::PAGE_SELF_TEST, &mut page)
                .and_then(|()| scsi_health::decode_self_test_page(&page))
            {
                Ok(results) => {
                    println!("Num  Test       Status      LifeTime(hours)  LBA_of_first_error");
                    for result in &results {
                        println!(
                            "#{:3}  code {:#x}   result {:#x}  {:>5}            {}",
                            result.index,
                            result.code,
                            result.result,
                            result.hour,
                            result
                                .failing_lba
                                .map_or("-".to_owned(), |lba| lba.to_string()),
                        );
                        if result.is_failure() {
                            status.bits |= FAILLOG;
                        }
                    }
                }
                Err(e) => status.command_failed("SELF-TEST RESULTS PAGE", &e),
            }
        }
    }

    for test in &options.tests {
        let diagnostic = match (test, options.captive) {
            (TestRequest::Short, false) => Some(scsi::DiagnosticTest::BackgroundShort),
            (TestRequest::Short, true) => Some(scsi::DiagnosticTest::ForegroundShort),
            (TestRequest::Long, false) => Some(scsi::DiagnosticTest::BackgroundExtended),
            (TestRequest::Long, true) => Some(scsi::DiagnosticTest::ForegroundExtended),
            (TestRequest::Offline, _) => Some(scsi::DiagnosticTest::Default),
            _ => None,
        };
        if let Some(diagnostic) = diagnostic {
            match scsi::send_diagnostic(port, diagnostic) {
                Ok(()) => println!("Self-test ({diagnostic}) started"),
                Err(e) => status.command_failed("SEND DIAGNOSTIC", &e),
            }
        } else {
            log::warn!("test type not available on SCSI devices");
        }
    }

    if options.abort {
        match scsi::send_diagnostic(port, scsi::DiagnosticTest::Abort) {
            Ok(()) => println!("Self-test aborted"),
            Err(e) => status.command_failed("SEND DIAGNOSTIC (ABORT)", &e),
        }
    }

    status.bits
}

#[cfg(test)]
#[expect(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        ata::OutRegs,
        dev::port::MockPort,
        tunnel::sat::tests::ard_sense,
    };

    /// Report options asking only for the health section
    fn health_options() -> ReportOptions {
        ReportOptions {
            health: true,
            ..ReportOptions::default()
        }
    }

    /// SAT tunnel device over a mock port
    fn mock_device(port: MockPort) -> Device {
        Device::Ata(crate::ata::ops::tests::mock_tunnel(port))
    }

    #[test]
    fn healthy_drive_clears_failstatus() {
        let mut port = MockPort::default();
        port.push_data(crate::ata::identify::tests::sample_identify());
        port.push_sense(ard_sense(&OutRegs {
            lba_mid: 0x4f,
            lba_high: 0xc2,
            status: 0x50,
            ..OutRegs::default()
        }));
        let mut device = mock_device(port);
        let bits = run(&mut device, &health_options());
        assert_eq!(bits & FAILSTATUS, 0);
    }

    #[test]
    fn failing_drive_sets_failstatus() {
        let mut port = MockPort::default();
        port.push_data(crate::ata::identify::tests::sample_identify());
        port.push_sense(ard_sense(&OutRegs {
            lba_mid: 0xf4,
            lba_high: 0x2c,
            status: 0x50,
            ..OutRegs::default()
        }));
        let mut device = mock_device(port);
        let bits = run(&mut device, &health_options());
        assert_eq!(bits & FAILSTATUS, FAILSTATUS);
    }

    #[test]
    fn failed_command_sets_failsmart() {
        let mut port = MockPort::default();
        port.push_err(DeviceError::Io("no identify".to_owned()));
        port.push_err(DeviceError::Io("no status".to_owned()));
        let mut device = mock_device(port);
        let bits = run(&mut device, &health_options());
        assert_eq!(bits & FAILSMART, FAILSMART);
    }

    #[test]
    fn attribute_failures_set_bits() {
        // prefail attribute 5 below threshold
        let mut page = crate::ata::attr::tests::sample_values_page();
        crate::ata::attr::tests::put_attr(&mut page, 0, 5, 0x0033, 20, 20, &[0; 6]);
        page[511] = 0;
        page[511] = crate::bytes::page_checksum(&page, 0);
        let mut port = MockPort::default();
        port.push_data(crate::ata::identify::tests::sample_identify());
        port.push_data(page);
        port.push_data(crate::ata::attr::tests::sample_thresholds_page());
        let mut device = mock_device(port);
        let options = ReportOptions {
            attributes: true,
            ..ReportOptions::default()
        };
        let bits = run(&mut device, &options);
        assert_eq!(bits & FAILATTR, FAILATTR);
    }

    #[test]
    fn selftest_log_errors_set_faillog() {
        let page = crate::ata::selftest::tests::selftest_page(&[(2, 0x70, 99, 1234)]);
        let mut port = MockPort::default();
        port.push_data(crate::ata::identify::tests::sample_identify());
        port.push_data(page);
        let mut device = mock_device(port);
        let options = ReportOptions {
            logs: vec![LogRequest::SelfTest],
            ..ReportOptions::default()
        };
        let bits = run(&mut device, &options);
        assert_eq!(bits & FAILLOG, FAILLOG);
    }

    #[test]
    fn log_request_parsing() {
        assert_eq!("error".parse::<LogRequest>().unwrap(), LogRequest::Error);
        assert_eq!(
            "selftest".parse::<LogRequest>().unwrap(),
            LogRequest::SelfTest
        );
        assert_eq!(
            "xselftest,4".parse::<LogRequest>().unwrap(),
            LogRequest::ExtSelfTest(4)
        );
        assert_eq!(
            "xselftest".parse::<LogRequest>().unwrap(),
            LogRequest::ExtSelfTest(1)
        );
        assert_eq!(
            "scttemp".parse::<LogRequest>().unwrap(),
            LogRequest::ScttempSts
        );
        assert!("wibble".parse::<LogRequest>().is_err());
    }

    #[test]
    fn test_request_parsing() {
        assert_eq!("short".parse::<TestRequest>().unwrap(), TestRequest::Short);
        assert_eq!(
            "pending,45".parse::<TestRequest>().unwrap(),
            TestRequest::Pending(45)
        );
        assert_eq!(
            "afterselect,on".parse::<TestRequest>().unwrap(),
            TestRequest::AfterSelect(true)
        );
        assert_eq!(
            "scttempint,10,p".parse::<TestRequest>().unwrap(),
            TestRequest::ScttempInt(10, true)
        );
        assert!("sideways".parse::<TestRequest>().is_err());
    }

    #[test]
    fn span_parsing() {
        let span = parse_span("100-200").unwrap();
        assert_eq!((span.start, span.end), (100, 200));
        assert_eq!(span.mode, SpanMode::Range);
        let span = parse_span("100-max").unwrap();
        assert_eq!(span.end, u64::MAX);
        let span = parse_span("1000+500").unwrap();
        assert_eq!((span.start, span.end), (1000, 1499));
        let span = parse_span("next").unwrap();
        assert_eq!(span.mode, SpanMode::Next);
        let span = parse_span("redo+100").unwrap();
        assert_eq!(span.mode, SpanMode::Redo);
        assert_eq!(span.end, 100);
        let span = parse_span("cont").unwrap();
        assert_eq!(span.mode, SpanMode::Cont);
        assert!(parse_span("badness").is_err());
        assert!(parse_span("5+0").is_err());
    }

    #[test]
    fn scsi_health_report() {
        let mut port = MockPort::default();
        port.push_data(crate::scsi::health::tests::ie_page(0x5d, 0x20, None));
        let handle = crate::dev::ScsiHandle::new(Box::new(port), "/dev/_mock", "scsi");
        let mut device = Device::Scsi(handle);
        let bits = run(&mut device, &health_options());
        assert_eq!(bits & FAILSTATUS, FAILSTATUS);
    }

    #[test]
    fn scsi_healthy_report() {
        let mut port = MockPort::default();
        port.push_data(crate::scsi::health::tests::ie_page(0, 0, None));
        let handle = crate::dev::ScsiHandle::new(Box::new(port), "/dev/_mock", "scsi");
        let mut device = Device::Scsi(handle);
        let bits = run(&mut device, &health_options());
        assert_eq!(bits, 0);
    }
}
