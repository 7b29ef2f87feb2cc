//! Monitor daemon: registration, main loop, signals, pidfile

use std::{
    fs,
    io::Write as _,
    os::{
        fd::{AsFd as _, AsRawFd as _, IntoRawFd as _, OwnedFd},
        unix::fs::OpenOptionsExt as _,
    },
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicI32, Ordering},
    time::Duration,
};

use itertools::Itertools as _;
use nix::{
    poll::{PollFd, PollFlags, PollTimeout},
    sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction},
};

use crate::{
    ata::{SmartRequest, ops},
    conf::{self, ConfEntry},
    dev::{self, Device, DeviceType},
    error::DeviceError,
    mon::{DeviceMonitor, notify::NotifyTarget},
    scsi,
};

/// Daemon exit code: bad command line
pub(crate) const EXIT_BADCMD: i32 = 1;
/// Daemon exit code: bad configuration file
pub(crate) const EXIT_BADCONF: i32 = 2;
/// Daemon exit code: startup failure
pub(crate) const EXIT_STARTUP: i32 = 3;
/// Daemon exit code: pidfile failure
pub(crate) const EXIT_PID: i32 = 4;
/// Daemon exit code: configuration file missing
pub(crate) const EXIT_NOCONF: i32 = 5;
/// Daemon exit code: configuration file unreadable
pub(crate) const EXIT_READCONF: i32 = 6;
/// Daemon exit code: out of memory
pub(crate) const EXIT_NOMEM: i32 = 8;
/// Daemon exit code: internal error
pub(crate) const EXIT_BADCODE: i32 = 10;
/// Daemon exit code: device registration failed
pub(crate) const EXIT_BADDEV: i32 = 16;
/// Daemon exit code: no devices to monitor
pub(crate) const EXIT_NODEV: i32 = 17;
/// Daemon exit code: terminated by signal (clean)
pub(crate) const EXIT_SIGNAL: i32 = 0;

/// Grace before re-reading the power mode in a cycle
const POWER_MODE_GRACE: Duration = Duration::from_secs(5);

/// Signal that requested the exit, 0 when none
static EXIT_SIGNAL_FLAG: AtomicI32 = AtomicI32::new(0);
/// SIGHUP seen: reload the configuration after the current cycle
static RELOAD_FLAG: AtomicBool = AtomicBool::new(false);
/// SIGUSR1 seen: run a cycle immediately
static POLL_NOW_FLAG: AtomicBool = AtomicBool::new(false);
/// Write end of the self-pipe, -1 before setup
static WAKE_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

/// Async-signal-safe handler: record the signal, poke the self-pipe
extern "C" fn handle_signal(sig: nix::libc::c_int) {
    match sig {
        nix::libc::SIGHUP => RELOAD_FLAG.store(true, Ordering::SeqCst),
        nix::libc::SIGUSR1 => POLL_NOW_FLAG.store(true, Ordering::SeqCst),
        _ => EXIT_SIGNAL_FLAG.store(sig, Ordering::SeqCst),
    }
    let fd = WAKE_PIPE_WR.load(Ordering::SeqCst);
    if fd >= 0 {
        // write(2) is async-signal-safe; a full pipe just drops the byte
        // SAFETY: fd is the daemon's pipe write end, kept open for life
        unsafe {
            nix::libc::write(fd, [0x78_u8].as_ptr().cast(), 1);
        }
    }
}

/// Install handlers and return the self-pipe read end
fn install_signal_handlers() -> Result<OwnedFd, DeviceError> {
    let (read_fd, write_fd) = nix::unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK)
        .map_err(|e| DeviceError::Io(format!("failed to create wake pipe: {e}")))?;
    WAKE_PIPE_WR.store(write_fd.into_raw_fd(), Ordering::SeqCst);
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [
        Signal::SIGHUP,
        Signal::SIGUSR1,
        Signal::SIGTERM,
        Signal::SIGQUIT,
        Signal::SIGINT,
    ] {
        // SAFETY: the handler only touches atomics and write(2)
        unsafe { sigaction(signal, &action) }
            .map_err(|e| DeviceError::Io(format!("failed to install {signal} handler: {e}")))?;
    }
    Ok(read_fd)
}

/// Compute the next wall-clock wake time.
/// A backwards clock step resets the wake; forward steps are absorbed
/// by advancing in whole intervals.
fn next_wake(mut wake: i64, now: i64, interval: i64) -> i64 {
    if wake > now + interval {
        // system clock stepped backwards
        wake = now + interval;
    }
    while wake <= now {
        wake += interval;
    }
    wake
}

/// Is this a whole-disk block device name (`sda`, not `sda1`)?
fn is_disk_name(name: &str) -> bool {
    name.strip_prefix("sd")
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_lowercase()))
}

/// Enumerate candidate device paths for `DEVICESCAN`
fn scan_devices() -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = fs::read_dir("/dev")
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(is_disk_name)
        })
        .map(|e| e.path())
        .collect();
    paths.sort();
    paths
}

/// Daemon settings from the command line
#[derive(Debug)]
pub(crate) struct DaemonOptions {
    /// Configuration file, `None` scans for devices
    pub conf_path: Option<PathBuf>,
    /// Polling interval
    pub interval: Duration,
    /// Pidfile path
    pub pidfile: Option<PathBuf>,
    /// Start even when no device can be registered
    pub quit_nodev: bool,
}

/// A device that registered successfully
struct Registered {
    /// Path to reopen every cycle
    path: PathBuf,
    /// Requested device type
    device_type: DeviceType,
    /// Monitoring state
    monitor: DeviceMonitor,
}

/// Expand configuration entries, resolving `DEVICESCAN`
fn resolve_entries(options: &DaemonOptions) -> Result<Vec<ConfEntry>, DeviceError> {
    let entries = match &options.conf_path {
        Some(path) => conf::load(path)?,
        None => conf::parse(&format!("{} -a\n", conf::DEVICESCAN))?,
    };
    let mut resolved = Vec::new();
    for entry in entries {
        if entry.is_scan() {
            for path in scan_devices() {
                let mut scanned = conf::parse(&format!("{} -a\n", path.display()))?;
                if let Some(scanned) = scanned.pop() {
                    resolved.push(ConfEntry {
                        monitor: crate::mon::MonitorConfig {
                            name: path.display().to_string(),
                            ..entry.monitor.clone()
                        },
                        ..scanned
                    });
                }
            }
        } else {
            resolved.push(entry);
        }
    }
    Ok(resolved)
}

/// Probe and register one configured device
fn register(entry: ConfEntry, interval: Duration) -> Result<Registered, DeviceError> {
    let path = PathBuf::from(&entry.device);
    let mut device = dev::open(&path, &entry.device_type, None)?;
    let policy = entry.monitor.policy;
    let result = match &mut device {
        Device::Ata(tunnel) => {
            let identify = ops::read_identify(tunnel, &policy)?;
            if !identify.smart_supported {
                Err(DeviceError::Unsupported(format!(
                    "{}: SMART not supported",
                    entry.device
                )))
            } else {
                log::info!(
                    "Device: {}, {} [{}], registered",
                    entry.device,
                    identify.model,
                    identify.firmware
                );
                if !identify.smart_enabled {
                    ops::smart_exec(tunnel, SmartRequest::Enable, &mut [])?;
                    log::info!("Device: {}, enabled SMART", entry.device);
                }
                if let Some(enable) = entry.auto_offline {
                    ops::smart_exec(tunnel, SmartRequest::AutoOffline { enable }, &mut [])?;
                }
                if let Some(enable) = entry.auto_save {
                    ops::smart_exec(tunnel, SmartRequest::AutoSave { enable }, &mut [])?;
                }
                Ok(())
            }
        }
        Device::Scsi(handle) => {
            setup_scsi_reporting(handle, &entry.device);
            Ok(())
        }
    };
    let close_result = device.close();
    result?;
    close_result?;
    let target = NotifyTarget {
        device_string: entry.monitor.name.clone(),
        device_type: format!("{:?}", entry.device_type),
        device: entry.device.clone(),
    };
    Ok(Registered {
        path,
        device_type: entry.device_type.clone(),
        monitor: DeviceMonitor::new(entry.monitor, target, interval.as_secs()),
    })
}

/// Probe the informational exceptions mode page and enable reporting
/// when it is off. A readable page is the SCSI way of saying "SMART
/// supported"; some targets only answer the 10-byte MODE SENSE.
fn setup_scsi_reporting(handle: &mut crate::dev::ScsiHandle, device: &str) {
    let mut mode6 = [0_u8; 64];
    let sensed6 = scsi::mode_sense6(handle.port_mut(), scsi::health::MODE_PAGE_IEC, &mut mode6)
        .and_then(|()| scsi::health::IecModePage::from_mode6(&mode6));
    match sensed6 {
        Ok(page) => {
            if !page.reporting_enabled() {
                let mut select = page.with_reporting(true);
                match scsi::mode_select6(handle.port_mut(), &mut select) {
                    Ok(()) => log::info!("Device: {device}, enabled exception reporting"),
                    Err(e) => log::warn!(
                        "Device: {device}, could not enable exception reporting: {e}"
                    ),
                }
            }
            log::info!("Device: {device}, registered");
        }
        Err(_) => {
            let mut mode10 = [0_u8; 64];
            let sensed10 =
                scsi::mode_sense10(handle.port_mut(), scsi::health::MODE_PAGE_IEC, &mut mode10)
                    .and_then(|()| scsi::health::IecModePage::from_mode10(&mode10));
            match sensed10 {
                Ok(page) => {
                    if !page.reporting_enabled() {
                        let mut select = page.with_reporting(true);
                        match scsi::mode_select10(handle.port_mut(), &mut select) {
                            Ok(()) => {
                                log::info!("Device: {device}, enabled exception reporting");
                            }
                            Err(e) => log::warn!(
                                "Device: {device}, could not enable exception reporting: {e}"
                            ),
                        }
                    }
                    log::info!("Device: {device}, registered");
                }
                Err(e) => {
                    log::warn!(
                        "Device: {device}, informational exceptions unavailable ({e}), monitoring readiness only"
                    );
                }
            }
        }
    }
}

/// Register all resolved entries, logging failures
fn register_all(options: &DaemonOptions) -> Result<Vec<Registered>, i32> {
    let entries = resolve_entries(options).map_err(|e| {
        log::error!("Failed to read configuration: {e}");
        match e {
            DeviceError::NotFound(_) => EXIT_NOCONF,
            DeviceError::AccessDenied(_) | DeviceError::Io(_) => EXIT_READCONF,
            _ => EXIT_BADCONF,
        }
    })?;
    let attempted = entries.len();
    let mut registered = Vec::new();
    for entry in entries {
        let name = entry.device.clone();
        match register(entry, options.interval) {
            Ok(device) => registered.push(device),
            Err(e) => log::error!("Device: {name}, not registered: {e}"),
        }
    }
    if registered.is_empty() && !options.quit_nodev {
        log::error!("No devices to monitor");
        // explicitly named devices all failing is a different condition
        // than an empty scan
        return Err(if attempted > 0 { EXIT_BADDEV } else { EXIT_NODEV });
    }
    Ok(registered)
}

/// Name of a daemon exit code, for the exit log line
pub(crate) fn exit_code_name(code: i32) -> &'static str {
    match code {
        EXIT_SIGNAL => "clean exit",
        EXIT_BADCMD => "bad command line",
        EXIT_BADCONF => "bad configuration",
        EXIT_STARTUP => "startup failure",
        EXIT_PID => "pidfile failure",
        EXIT_NOCONF => "configuration file missing",
        EXIT_READCONF => "configuration file unreadable",
        EXIT_NOMEM => "out of memory",
        EXIT_BADCODE => "internal error",
        EXIT_BADDEV => "device registration failed",
        EXIT_NODEV => "no devices",
        _ => "unknown",
    }
}

/// One polling cycle over all registered devices.
/// Handles are opened fresh each cycle and closed on every return path.
fn run_cycle(registered: &mut [Registered]) {
    let now = chrono::Local::now();
    for device in registered.iter_mut() {
        match dev::open(&device.path, &device.device_type, None) {
            Ok(mut open_device) => {
                match &mut open_device {
                    Device::Ata(tunnel) => {
                        device.monitor.check_ata(tunnel, &now, POWER_MODE_GRACE);
                    }
                    Device::Scsi(handle) => device.monitor.check_scsi(handle, &now),
                }
                if let Err(e) = open_device.close() {
                    log::warn!("Device: {}, close failed: {e}", device.monitor.name());
                }
            }
            Err(e) => device.monitor.report_open_failure(&e, now.timestamp()),
        }
    }
}

/// Write the daemon pid, mode 0600
fn write_pidfile(path: &Path) -> Result<(), DeviceError> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| DeviceError::from_os(&path.display().to_string(), &e))?;
    writeln!(file, "{}", nix::unistd::getpid())
        .map_err(|e| DeviceError::Io(format!("failed to write pidfile: {e}")))?;
    Ok(())
}

/// Sleep until the wake time or a signal pokes the self-pipe
fn sleep_until(wake_fd: &OwnedFd, wake: i64) {
    let now = chrono::Local::now().timestamp();
    let remaining = wake.saturating_sub(now).max(0);
    #[expect(clippy::cast_possible_truncation)]
    let ms = remaining.saturating_mul(1000).min(i64::from(i32::MAX)) as i32;
    let timeout = PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX);
    let mut fds = [PollFd::new(wake_fd.as_fd(), PollFlags::POLLIN)];
    let _ = nix::poll::poll(&mut fds, timeout);
    // drain whatever the handlers wrote
    let mut buf = [0_u8; 16];
    while nix::unistd::read(wake_fd, &mut buf).is_ok_and(|n| n > 0) {}
}

/// Run the monitor daemon until a terminating signal arrives
pub(crate) fn run(options: &DaemonOptions) -> i32 {
    let mut registered = match register_all(options) {
        Ok(registered) => registered,
        Err(code) => return code,
    };
    if let Some(pidfile) = &options.pidfile {
        if let Err(e) = write_pidfile(pidfile) {
            log::error!("Failed to write pidfile: {e}");
            return EXIT_PID;
        }
    }
    let wake_fd = match install_signal_handlers() {
        Ok(fd) => fd,
        Err(e) => {
            log::error!("{e}");
            return EXIT_STARTUP;
        }
    };
    log::info!(
        "Monitoring {} device(s) [{}], polling every {:?}",
        registered.len(),
        registered.iter().map(|r| r.monitor.name()).join(", "),
        options.interval
    );

    let interval = i64::try_from(options.interval.as_secs().max(1)).unwrap_or(i64::MAX);
    let mut wake = chrono::Local::now().timestamp();
    loop {
        run_cycle(&mut registered);
        wake = next_wake(wake, chrono::Local::now().timestamp(), interval);
        loop {
            if EXIT_SIGNAL_FLAG.load(Ordering::SeqCst) != 0 {
                break;
            }
            if POLL_NOW_FLAG.swap(false, Ordering::SeqCst) {
                log::info!("Signal USR1, checking devices now");
                break;
            }
            if RELOAD_FLAG.swap(false, Ordering::SeqCst) {
                log::info!("Signal HUP, reloading configuration");
                registered.clear();
                match register_all(options) {
                    Ok(reloaded) => registered = reloaded,
                    Err(code) => {
                        log::error!("Reload failed, exiting");
                        cleanup(options);
                        return code;
                    }
                }
                break;
            }
            if chrono::Local::now().timestamp() >= wake {
                break;
            }
            sleep_until(&wake_fd, wake);
        }
        let exit_signal = EXIT_SIGNAL_FLAG.load(Ordering::SeqCst);
        if exit_signal != 0 {
            log::info!("Exiting on signal {exit_signal}");
            cleanup(options);
            return EXIT_SIGNAL;
        }
    }
}

/// Remove daemon state on the way out
fn cleanup(options: &DaemonOptions) {
    if let Some(pidfile) = &options.pidfile {
        if let Err(e) = fs::remove_file(pidfile) {
            log::warn!("Failed to remove pidfile: {e}");
        }
    }
}
