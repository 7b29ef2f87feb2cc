//! Rate-limited notification dispatch

use std::{
    path::PathBuf,
    process::{Command, Stdio},
};

use chrono::TimeZone as _;

/// Failure categories a notification can report
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub(crate) enum Category {
    /// Requested test notification
    EmailTest,
    /// SMART health check reported failing
    Health,
    /// A usage attribute failed
    Usage,
    /// Self-test log gained an error
    SelfTest,
    /// ATA error log count increased
    ErrorCount,
    /// SMART health check could not be run
    FailedHealthCheck,
    /// SMART attribute data could not be read
    FailedReadSmartData,
    /// SMART error log could not be read
    FailedReadSmartErrorLog,
    /// SMART self-test log could not be read
    FailedReadSmartSelfTestLog,
    /// Device could not be opened
    FailedOpenDevice,
    /// Currently pending sectors detected
    CurrentPendingSector,
    /// Offline uncorrectable sectors detected
    OfflineUncorrectableSector,
    /// Temperature limit crossed
    Temperature,
}

/// Number of categories, one notification slot each
pub(crate) const NUM_CATEGORIES: usize = 13;

impl Category {
    /// Slot index of this category
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Delivery cadence for repeated notifications of one category
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum Cadence {
    /// Deliver at most one notification ever
    #[default]
    Once,
    /// Suppress within 24 hours of the previous one
    Daily,
    /// Suppress within 2^(n-1) days of the previous one
    Diminishing,
}

/// Per-category delivery record
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct NotifySlot {
    /// Deliveries so far
    pub times_sent: u32,
    /// Epoch of the first delivery
    pub first_sent: i64,
    /// Epoch of the most recent delivery
    pub last_sent: i64,
}

/// Seconds per day
const DAY: i64 = 24 * 3600;

impl NotifySlot {
    /// Should another notification go out now?
    fn should_send(&self, cadence: Cadence, now: i64) -> bool {
        if self.times_sent == 0 {
            return true;
        }
        match cadence {
            Cadence::Once => false,
            Cadence::Daily => now >= self.last_sent + DAY,
            Cadence::Diminishing => {
                let days = 1_i64 << (self.times_sent - 1).min(32);
                now >= self.last_sent + days * DAY
            }
        }
    }
}

/// Identity strings exported to the notifier
#[derive(Clone, Debug, Default)]
pub(crate) struct NotifyTarget {
    /// Device string as written in the configuration
    pub device_string: String,
    /// Effective device type
    pub device_type: String,
    /// Device pathname
    pub device: String,
}

/// Notification settings for one device
#[derive(Clone, Debug, Default)]
pub(crate) struct NotifyConfig {
    /// Recipient address list, comma separated
    pub address: Option<String>,
    /// Exec hook invoked instead of (or as) the mailer
    pub exec_path: Option<PathBuf>,
    /// Delivery cadence
    pub cadence: Cadence,
    /// Send one test notification on startup
    pub test: bool,
}

/// Rate-limited notification dispatcher for one device
#[derive(Debug, Default)]
pub(crate) struct Notifier {
    /// Settings
    config: NotifyConfig,
    /// One slot per category
    slots: [NotifySlot; NUM_CATEGORIES],
}

impl Notifier {
    /// Build a dispatcher from settings
    pub(crate) fn new(config: NotifyConfig) -> Self {
        Self {
            config,
            slots: [NotifySlot::default(); NUM_CATEGORIES],
        }
    }

    /// Slot for a category
    pub(crate) fn slot(&self, category: Category) -> &NotifySlot {
        // the array always holds NUM_CATEGORIES entries
        self.slots.get(category.index()).unwrap_or(&EMPTY_SLOT)
    }

    /// Dispatch a notification, subject to the cadence.
    /// `times_sent` is incremented after invoking the notifier, not
    /// after its success, so delivery failures do not amplify retries.
    /// Returns whether a delivery was attempted.
    pub(crate) fn notify(
        &mut self,
        target: &NotifyTarget,
        category: Category,
        message: &str,
        now: i64,
    ) -> bool {
        if self.config.address.is_none() && self.config.exec_path.is_none() {
            return false;
        }
        let Some(slot) = self.slots.get_mut(category.index()) else {
            return false;
        };
        // a test notification goes out exactly once, regardless of cadence
        let send = if category == Category::EmailTest {
            slot.times_sent == 0
        } else {
            slot.should_send(self.config.cadence, now)
        };
        if !send {
            return false;
        }
        if slot.times_sent == 0 {
            slot.first_sent = now;
        }
        slot.last_sent = now;

        let hostname = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "[Unknown]".to_owned());
        let subject = format!("SMART error ({category}) detected on host: {hostname}");
        let first_sent_text = chrono::Local
            .timestamp_opt(slot.first_sent, 0)
            .single()
            .map(|t| t.to_rfc2822())
            .unwrap_or_default();
        let full_message = format!(
            "This message was generated by the hddhealthd daemon running on:\n\
             \x20  host name: {hostname}\n\n{message}\n\n\
             Device info:\n{}, type {}\n",
            target.device_string, target.device_type
        );

        match &self.config.exec_path {
            Some(exec_path) => {
                let mut command = Command::new(exec_path);
                command
                    .stdin(Stdio::null())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit())
                    .env("SMARTD_MAILER", exec_path)
                    .env("SMARTD_MESSAGE", message)
                    .env("SMARTD_SUBJECT", &subject)
                    .env("SMARTD_TFIRST", &first_sent_text)
                    .env("SMARTD_TFIRSTEPOCH", slot.first_sent.to_string())
                    .env("SMARTD_FAILTYPE", category.to_string())
                    .env("SMARTD_DEVICESTRING", &target.device_string)
                    .env("SMARTD_DEVICETYPE", &target.device_type)
                    .env("SMARTD_DEVICE", &target.device)
                    .env("SMARTD_FULLMESSAGE", &full_message);
                if let Some(address) = &self.config.address {
                    command.env("SMARTD_ADDRESS", address.replace(',', " "));
                    command.arg(address);
                }
                match command.status() {
                    Ok(status) if status.success() => {
                        log::info!("Notification ({category}) sent via {exec_path:?}");
                    }
                    Ok(status) => {
                        log::error!("Notifier {exec_path:?} failed with {status}");
                    }
                    Err(e) => {
                        log::error!("Failed to run notifier {exec_path:?}: {e}");
                    }
                }
            }
            None => {
                log::warn!("{subject}: {message}");
            }
        }
        slot.times_sent += 1;
        true
    }
}

/// Shared empty slot for out-of-range lookups
static EMPTY_SLOT: NotifySlot = NotifySlot {
    times_sent: 0,
    first_sent: 0,
    last_sent: 0,
};
