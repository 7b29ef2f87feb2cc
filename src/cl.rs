//! Command line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::{
    ata::{FirmwareBug, attr::ParsedAttrDef},
    dev::DeviceType,
    error::ChecksumPolicy,
    mon::PowerFloor,
    report::{LogRequest, TestRequest},
};

/// Hddhealthd command line arguments
#[derive(Parser, Debug)]
#[command(version, about)]
pub(crate) struct Args {
    /// Level of logging output (TRACE, DEBUG, INFO, WARN, ERROR).
    #[arg(short, default_value_t = log::Level::Info)]
    pub verbosity: log::Level,

    /// Main action
    #[command(subcommand)]
    pub command: Command,
}

/// On/off switch argument
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum OnOff {
    /// Enable
    On,
    /// Disable
    Off,
}

impl OnOff {
    /// As a plain flag
    pub(crate) fn enabled(self) -> bool {
        self == Self::On
    }
}

/// How strictly mandatory SMART commands are required
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub(crate) enum Tolerance {
    /// Fail when mandatory commands are unsupported
    #[default]
    Normal,
    /// Give up on the first unexpected condition
    Conservative,
    /// Try optional paths when mandatory ones fail
    Permissive,
    /// Like permissive, twice
    Verypermissive,
}

/// Drive preset database handling
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub(crate) enum Presets {
    /// Apply presets for known drives
    #[default]
    Use,
    /// Ignore the preset database
    Ignore,
    /// Show presets for this drive
    Show,
    /// Show presets for all known drives
    Showall,
}

/// Inspector subcommand arguments
#[derive(clap::Args, Debug)]
pub(crate) struct ReportArgs {
    /// Device path (ie. `/dev/sdX`).
    pub device: PathBuf,

    /// Device type (ie. `sat`, `usbjmicron,0`, `3ware,2`).
    /// Autodetected when not given.
    #[arg(short = 'd', long = "device")]
    pub device_type: Option<DeviceType>,

    /// Print identity information read from the drive.
    #[arg(short, long)]
    pub info: bool,

    /// Run the SMART health check.
    #[arg(short = 'H', long)]
    pub health: bool,

    /// Print SMART capabilities.
    #[arg(short, long)]
    pub capabilities: bool,

    /// Print the vendor attribute table with thresholds.
    #[arg(short = 'A', long)]
    pub attributes: bool,

    /// Print everything: identity, health, capabilities, attributes,
    /// error and self-test logs.
    #[arg(short, long)]
    pub all: bool,

    /// Print a device log
    /// (`error`, `selftest`, `xselftest[,N]`, `selective`,
    /// `scttemp[sts]`, `scttemphist`, `background`).
    #[arg(short, long = "log")]
    pub logs: Vec<LogRequest>,

    /// Start a self-test
    /// (`offline`, `short`, `long`, `conveyance`, `select,N-M`,
    /// `select,redo|next|cont[+SIZE]`, `pending,N`,
    /// `afterselect,on|off`, `scttempint,N[,p]`).
    #[arg(short, long = "test")]
    pub tests: Vec<TestRequest>,

    /// Run self-tests in captive (foreground) mode.
    #[arg(short = 'C', long)]
    pub captive: bool,

    /// Abort a running self-test.
    #[arg(short = 'X', long)]
    pub abort: bool,

    /// Enable or disable SMART on the drive.
    #[arg(short, long)]
    pub smart: Option<OnOff>,

    /// Enable or disable automatic offline testing.
    #[arg(short = 'o', long)]
    pub offlineauto: Option<OnOff>,

    /// Enable or disable attribute autosave.
    #[arg(short = 'S', long)]
    pub saveauto: Option<OnOff>,

    /// What to do when a page checksum does not verify.
    #[arg(short = 'b', long, default_value_t)]
    pub badsum: ChecksumPolicy,

    /// Firmware bug workaround.
    #[arg(short = 'F', long, default_value_t)]
    pub firmwarebug: FirmwareBug,

    /// Attribute display override, `ID,FORMAT[+][,NAME]` or `N,FORMAT`.
    #[arg(short = 'v', long)]
    pub vendorattribute: Vec<ParsedAttrDef>,

    /// Skip the check when the drive is at or below this power state.
    #[arg(short = 'n', long, default_value_t)]
    pub nocheck: PowerFloor,

    /// Tolerance towards drives not implementing mandatory commands.
    #[arg(short = 'T', long, value_enum, default_value_t)]
    pub tolerance: Tolerance,

    /// Drive preset database handling.
    #[arg(short = 'P', long, value_enum, default_value_t)]
    pub presets: Presets,
}

/// Daemon subcommand arguments
#[derive(clap::Args, Debug)]
pub(crate) struct DaemonArgs {
    /// Configuration file, one device per line.
    /// Without one, all disks found by a device scan are monitored.
    #[arg(short, long)]
    pub configfile: Option<PathBuf>,

    /// Interval between device polls, ie. '30m', '1800s'.
    #[arg(short, long, default_value = "30m")]
    pub interval: humantime::Duration,

    /// Write the daemon process id to this file.
    #[arg(short, long)]
    pub pidfile: Option<PathBuf>,

    /// Start even when no device registers successfully.
    #[arg(short, long)]
    pub quit_nodev: bool,
}

/// Main command
#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Print a device health report
    Report(ReportArgs),

    /// Start the monitoring daemon
    Daemon(DaemonArgs),
}
