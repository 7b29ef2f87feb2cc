//! Monitor the health of directly-attached drives via SMART

use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

mod ata;
mod bytes;
mod cl;
mod conf;
mod daemon;
mod dev;
mod error;
mod mon;
mod report;
mod scsi;
#[cfg(test)]
mod tests;
mod tunnel;

use crate::ata::attr::DefPriority;

/// Build inspector options from the parsed arguments
fn report_options(args: &cl::ReportArgs) -> report::ReportOptions {
    let mut options = report::ReportOptions {
        info: args.info || args.all,
        health: args.health || args.all,
        capabilities: args.capabilities || args.all,
        attributes: args.attributes || args.all,
        logs: args.logs.clone(),
        tests: args.tests.clone(),
        abort: args.abort,
        captive: args.captive,
        smart: args.smart.map(cl::OnOff::enabled),
        auto_offline: args.offlineauto.map(cl::OnOff::enabled),
        auto_save: args.saveauto.map(cl::OnOff::enabled),
        nocheck: args.nocheck,
        policy: ata::ProtocolPolicy {
            checksum: args.badsum,
            firmware: args.firmwarebug,
        },
        attr_defs: ata::attr::AttrDefs::default(),
        permissive: matches!(
            args.tolerance,
            cl::Tolerance::Permissive | cl::Tolerance::Verypermissive
        ),
    };
    if args.all {
        options.logs.push(report::LogRequest::Error);
        options.logs.push(report::LogRequest::SelfTest);
    }
    // later -v directives shadow earlier ones at equal priority
    for def in &args.vendorattribute {
        options.attr_defs.apply(def, DefPriority::User);
    }
    options
}

/// Run the inspector and compute its exit bits
fn run_report(args: &cl::ReportArgs) -> i32 {
    if matches!(args.presets, cl::Presets::Show | cl::Presets::Showall) {
        // the drive preset database ships separately
        println!("Drive presets are provided by an external preset database; none bundled.");
    }
    let options = report_options(args);
    let device_type = args.device_type.clone().unwrap_or_default();
    let mut device = match dev::open(&args.device, &device_type, None) {
        Ok(device) => device,
        Err(e) => {
            log::error!("{e}");
            return report::FAILDEV;
        }
    };
    println!("Device: {device}");
    let bits = report::run(&mut device, &options);
    if let Err(e) = device.close() {
        log::warn!("Failed to close device: {e}");
    }
    bits
}

fn main() -> ExitCode {
    // parse cl args
    let args = match cl::Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(u8::try_from(report::FAILCMD).unwrap_or(1));
        }
    };

    // init logger
    if let Err(e) =
        simple_logger::init_with_level(args.verbosity).context("Failed to init logger")
    {
        eprintln!("{e:#}");
        return ExitCode::from(u8::try_from(daemon::EXIT_STARTUP).unwrap_or(3));
    }

    let code = match &args.command {
        cl::Command::Report(report_args) => run_report(report_args),
        cl::Command::Daemon(daemon_args) => {
            let options = daemon::DaemonOptions {
                conf_path: daemon_args.configfile.clone(),
                interval: *daemon_args.interval,
                pidfile: daemon_args.pidfile.clone(),
                quit_nodev: daemon_args.quit_nodev,
            };
            let code = daemon::run(&options);
            log::info!("Daemon exit code {code} ({})", daemon::exit_code_name(code));
            code
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX))
}
