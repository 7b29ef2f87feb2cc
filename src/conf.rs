//! Monitor daemon configuration file
//!
//! One device per line: a pathname or the `DEVICESCAN` directive,
//! followed by directives mirroring the inspector flags. `#` starts a
//! comment, `\` continues a line.

use std::{fs, path::Path, str::FromStr as _};

use crate::{
    ata::attr::{DefPriority, ParsedAttrDef},
    dev::DeviceType,
    error::DeviceError,
    mon::{MonitorConfig, PowerFloor, notify::Cadence, schedule::TestSchedule},
};

/// Maximum raw line length
const MAX_LINE_LEN: usize = 256;
/// Maximum assembled length of a continued line
const MAX_CONTINUED_LEN: usize = 1023;
/// Directive asking the daemon to enumerate devices itself
pub(crate) const DEVICESCAN: &str = "DEVICESCAN";

/// One configured device
#[derive(Debug, Default)]
pub(crate) struct ConfEntry {
    /// Device path, or [`DEVICESCAN`]
    pub device: String,
    /// Requested device type
    pub device_type: DeviceType,
    /// Monitoring configuration
    pub monitor: MonitorConfig,
    /// Enable or disable automatic offline testing at registration
    pub auto_offline: Option<bool>,
    /// Enable or disable attribute autosave at registration
    pub auto_save: Option<bool>,
}

impl ConfEntry {
    /// Is this the scan directive rather than a concrete path?
    pub(crate) fn is_scan(&self) -> bool {
        self.device == DEVICESCAN
    }
}

/// Error with the offending line number
fn line_err(line_no: usize, message: &str) -> DeviceError {
    DeviceError::InvalidArgument(format!("config line {line_no}: {message}"))
}

/// Join continuation lines and strip comments, keeping line numbers
fn logical_lines(text: &str) -> Result<Vec<(usize, String)>, DeviceError> {
    let mut lines = Vec::new();
    let mut pending: Option<(usize, String)> = None;
    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        if raw.len() > MAX_LINE_LEN {
            return Err(line_err(
                line_no,
                &format!("line is longer than {MAX_LINE_LEN} characters"),
            ));
        }
        let stripped = raw
            .split_once('#')
            .map_or(raw, |(before, _comment)| before);
        let (content, continued) = match stripped.trim_end().strip_suffix('\\') {
            Some(head) => (head, true),
            None => (stripped, false),
        };
        let (start_no, mut assembled) = pending.take().unwrap_or((line_no, String::new()));
        assembled.push_str(content);
        assembled.push(' ');
        if assembled.len() > MAX_CONTINUED_LEN {
            return Err(line_err(
                start_no,
                &format!("continued line is longer than {MAX_CONTINUED_LEN} characters"),
            ));
        }
        if continued {
            pending = Some((start_no, assembled));
        } else if !assembled.trim().is_empty() {
            lines.push((start_no, assembled));
        }
    }
    if let Some((start_no, _)) = pending {
        return Err(line_err(start_no, "line ends with a dangling continuation"));
    }
    Ok(lines)
}

/// Apply the `-a` equivalent default set of checks
fn enable_default_checks(monitor: &mut MonitorConfig) {
    monitor.check_health = true;
    monitor.monitor_usage = true;
    monitor.report_prefail_changes = true;
    monitor.report_usage_changes = true;
    monitor.check_selftest_log = true;
    monitor.check_error_log = true;
    monitor.pending_id = crate::ata::attr::ATTR_CURRENT_PENDING;
    monitor.uncorrectable_id = crate::ata::attr::ATTR_OFFLINE_UNCORRECTABLE;
}

/// Parse one device line
fn parse_entry(line_no: usize, line: &str) -> Result<ConfEntry, DeviceError> {
    let mut tokens = line.split_whitespace();
    let device = tokens
        .next()
        .ok_or_else(|| line_err(line_no, "missing device path"))?
        .to_owned();
    let mut entry = ConfEntry {
        monitor: MonitorConfig {
            name: device.clone(),
            ..MonitorConfig::default()
        },
        device,
        ..ConfEntry::default()
    };
    let mut any_directive = false;
    let next_value = |tokens: &mut std::str::SplitWhitespace<'_>, directive: &str| {
        tokens
            .next()
            .map(ToOwned::to_owned)
            .ok_or_else(|| line_err(line_no, &format!("directive {directive} needs an argument")))
    };
    while let Some(token) = tokens.next() {
        any_directive = true;
        match token {
            "-a" => enable_default_checks(&mut entry.monitor),
            "-H" => entry.monitor.check_health = true,
            "-f" => entry.monitor.monitor_usage = true,
            "-p" => entry.monitor.report_prefail_changes = true,
            "-u" => entry.monitor.report_usage_changes = true,
            "-t" => {
                entry.monitor.report_prefail_changes = true;
                entry.monitor.report_usage_changes = true;
            }
            "-l" => match next_value(&mut tokens, "-l")?.as_str() {
                "error" => entry.monitor.check_error_log = true,
                "selftest" => entry.monitor.check_selftest_log = true,
                other => {
                    return Err(line_err(line_no, &format!("unknown log type {other:?}")));
                }
            },
            "-d" => {
                entry.device_type = next_value(&mut tokens, "-d")?
                    .parse()
                    .map_err(|e: DeviceError| line_err(line_no, &e.to_string()))?;
            }
            "-o" => {
                entry.auto_offline = Some(parse_on_off(line_no, &next_value(&mut tokens, "-o")?)?);
            }
            "-S" => {
                entry.auto_save = Some(parse_on_off(line_no, &next_value(&mut tokens, "-S")?)?);
            }
            "-s" => {
                let pattern = next_value(&mut tokens, "-s")?;
                entry.monitor.schedule = Some(
                    TestSchedule::new(&pattern)
                        .map_err(|e| line_err(line_no, &e.to_string()))?,
                );
            }
            "-m" => entry.monitor.notify.address = Some(next_value(&mut tokens, "-m")?),
            "-M" => match next_value(&mut tokens, "-M")?.as_str() {
                "once" => entry.monitor.notify.cadence = Cadence::Once,
                "daily" => entry.monitor.notify.cadence = Cadence::Daily,
                "diminishing" => entry.monitor.notify.cadence = Cadence::Diminishing,
                "test" => entry.monitor.notify.test = true,
                "exec" => {
                    entry.monitor.notify.exec_path =
                        Some(next_value(&mut tokens, "-M exec")?.into());
                }
                other => {
                    return Err(line_err(line_no, &format!("unknown -M argument {other:?}")));
                }
            },
            "-i" => {
                let id = parse_attr_id(line_no, &next_value(&mut tokens, "-i")?)?;
                entry.monitor.bitsets.track_ignore.set(id);
            }
            "-I" => {
                let id = parse_attr_id(line_no, &next_value(&mut tokens, "-I")?)?;
                entry.monitor.bitsets.failure_ignore.set(id);
            }
            "-r" => {
                let id = parse_attr_id(line_no, &next_value(&mut tokens, "-r")?)?;
                entry.monitor.bitsets.raw_print.set(id);
            }
            "-R" => {
                let id = parse_attr_id(line_no, &next_value(&mut tokens, "-R")?)?;
                entry.monitor.bitsets.raw_track.set(id);
            }
            "-C" => {
                entry.monitor.pending_id = parse_attr_id_or_zero(
                    line_no,
                    &next_value(&mut tokens, "-C")?,
                )?;
            }
            "-U" => {
                entry.monitor.uncorrectable_id = parse_attr_id_or_zero(
                    line_no,
                    &next_value(&mut tokens, "-U")?,
                )?;
            }
            "-W" => {
                let spec = next_value(&mut tokens, "-W")?;
                let mut parts = spec.splitn(3, ',');
                let parse_temp = |part: Option<&str>| -> Result<u8, DeviceError> {
                    part.map_or(Ok(0), |p| {
                        p.parse()
                            .map_err(|_| line_err(line_no, &format!("bad temperature {p:?}")))
                    })
                };
                entry.monitor.temp_diff = parse_temp(parts.next())?;
                entry.monitor.temp_info = parse_temp(parts.next())?;
                entry.monitor.temp_crit = parse_temp(parts.next())?;
            }
            "-n" => {
                entry.monitor.power_floor = PowerFloor::from_str(&next_value(&mut tokens, "-n")?)
                    .map_err(|_| line_err(line_no, "unknown power mode"))?;
            }
            "-F" => {
                entry.monitor.policy.firmware =
                    crate::ata::FirmwareBug::from_str(&next_value(&mut tokens, "-F")?)
                        .map_err(|_| line_err(line_no, "unknown firmware workaround"))?;
            }
            "-v" => {
                let def: ParsedAttrDef = next_value(&mut tokens, "-v")?
                    .parse()
                    .map_err(|e: DeviceError| line_err(line_no, &e.to_string()))?;
                entry.monitor.attr_defs.apply(&def, DefPriority::User);
            }
            other => {
                return Err(line_err(line_no, &format!("unknown directive {other:?}")));
            }
        }
    }
    // a bare device line monitors everything, like an explicit -a
    if !any_directive {
        enable_default_checks(&mut entry.monitor);
    }
    Ok(entry)
}

/// Parse on/off directive values
fn parse_on_off(line_no: usize, value: &str) -> Result<bool, DeviceError> {
    match value {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(line_err(line_no, &format!("expected on or off, got {other:?}"))),
    }
}

/// Parse an attribute id in 1..=255
fn parse_attr_id(line_no: usize, value: &str) -> Result<u8, DeviceError> {
    clap_num::number_range(value, 1, 255)
        .map_err(|e| line_err(line_no, &format!("bad attribute id {value:?}: {e}")))
}

/// Parse an attribute id where 0 disables the check
fn parse_attr_id_or_zero(line_no: usize, value: &str) -> Result<u8, DeviceError> {
    clap_num::number_range(value, 0, 255)
        .map_err(|e| line_err(line_no, &format!("bad attribute id {value:?}: {e}")))
}

/// Parse configuration text into device entries.
/// `DEVICESCAN` must be the only device line when present.
pub(crate) fn parse(text: &str) -> Result<Vec<ConfEntry>, DeviceError> {
    let mut entries = Vec::new();
    for (line_no, line) in logical_lines(text)? {
        entries.push(parse_entry(line_no, &line)?);
    }
    if entries.iter().any(ConfEntry::is_scan) && entries.len() > 1 {
        return Err(DeviceError::InvalidArgument(format!(
            "{DEVICESCAN} must be the only device line"
        )));
    }
    Ok(entries)
}

/// Load and parse a configuration file
pub(crate) fn load(path: &Path) -> Result<Vec<ConfEntry>, DeviceError> {
    let text = fs::read_to_string(path)
        .map_err(|e| DeviceError::from_os(&path.display().to_string(), &e))?;
    parse(&text)
}

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn bare_device_gets_default_checks() {
        let entries = parse("/dev/sda\n").unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.device, "/dev/sda");
        assert!(entry.monitor.check_health);
        assert!(entry.monitor.check_selftest_log);
        assert!(entry.monitor.check_error_log);
        assert_eq!(entry.monitor.pending_id, 197);
        assert_eq!(entry.monitor.uncorrectable_id, 198);
    }

    #[test]
    fn comments_and_blanks_ignored() {
        let text = "# leading comment\n\n/dev/sda -H # trailing comment\n";
        let entries = parse(text).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].monitor.check_health);
        assert!(!entries[0].monitor.check_error_log);
    }

    #[test]
    fn continuation_lines_joined() {
        let text = "/dev/sda -H \\\n  -l error \\\n  -l selftest\n";
        let entries = parse(text).unwrap();
        assert!(entries[0].monitor.check_error_log);
        assert!(entries[0].monitor.check_selftest_log);
    }

    #[test]
    fn full_directive_set() {
        let text = "/dev/sdb -a -d sat -s S/../../[1-5]/03 -m root@localhost -M diminishing \
                    -W 5,45,55 -n standby -C 197 -U 198 -i 194 -R 5 -F samsung \
                    -v 9,min2hour,Power_On_Minutes -o on -S off\n";
        let entries = parse(text).unwrap();
        let entry = &entries[0];
        assert_eq!(
            entry.device_type,
            crate::dev::DeviceType::Sat {
                cdb_len: crate::tunnel::SatCdbLen::Len16
            }
        );
        assert!(entry.monitor.schedule.is_some());
        assert_eq!(
            entry.monitor.notify.address.as_deref(),
            Some("root@localhost")
        );
        assert_eq!(entry.monitor.notify.cadence, Cadence::Diminishing);
        assert_eq!(entry.monitor.temp_diff, 5);
        assert_eq!(entry.monitor.temp_info, 45);
        assert_eq!(entry.monitor.temp_crit, 55);
        assert_eq!(entry.monitor.power_floor, PowerFloor::Standby);
        assert!(entry.monitor.bitsets.track_ignore.get(194));
        assert!(entry.monitor.bitsets.raw_track.get(5));
        assert_eq!(
            entry.monitor.policy.firmware,
            crate::ata::FirmwareBug::Samsung
        );
        assert_eq!(entry.auto_offline, Some(true));
        assert_eq!(entry.auto_save, Some(false));
        assert_eq!(
            entry.monitor.attr_defs.get(9).format,
            crate::ata::attr::RawFormat::Min2Hour
        );
    }

    #[test]
    fn exec_hook_directive() {
        let text = "/dev/sda -m root -M exec /usr/local/bin/alert\n";
        let entries = parse(text).unwrap();
        assert_eq!(
            entries[0].monitor.notify.exec_path.as_deref(),
            Some(std::path::Path::new("/usr/local/bin/alert"))
        );
    }

    #[test]
    fn devicescan_alone() {
        let entries = parse("DEVICESCAN -H\n").unwrap();
        assert!(entries[0].is_scan());
        assert!(parse("DEVICESCAN\n/dev/sda\n").is_err());
    }

    #[test]
    fn unknown_directive_rejected() {
        assert!(parse("/dev/sda -Z\n").is_err());
        assert!(parse("/dev/sda -l wibble\n").is_err());
        assert!(parse("/dev/sda -M sometimes\n").is_err());
    }

    #[test]
    fn missing_argument_rejected() {
        assert!(parse("/dev/sda -l\n").is_err());
        assert!(parse("/dev/sda -W\n").is_err());
    }

    #[test]
    fn pending_check_disabled_with_zero() {
        let entries = parse("/dev/sda -a -C 0 -U 0\n").unwrap();
        assert_eq!(entries[0].monitor.pending_id, 0);
        assert_eq!(entries[0].monitor.uncorrectable_id, 0);
    }

    #[test]
    fn overlong_lines_rejected() {
        let long = format!("/dev/sda {}\n", "-H ".repeat(120));
        assert!(parse(&long).is_err());
        // continued lines may be longer, up to the continued limit
        let text = format!(
            "/dev/sda \\\n{}\n",
            "-H -f -p -u -l error -l selftest ".repeat(5)
        );
        assert!(parse(&text).is_ok());
    }

    #[test]
    fn dangling_continuation_rejected() {
        assert!(parse("/dev/sda -H \\\n").is_err());
    }

    #[test]
    fn schedule_pattern_validated() {
        assert!(parse("/dev/sda -s (L|S/../../../..\n").is_err());
    }
}
