//! Scheduled self-test time patterns

use chrono::{Datelike as _, Timelike as _};

use crate::error::DeviceError;

/// Self-test type, in scheduling priority order
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub(crate) enum TestType {
    /// Long (extended) self-test
    #[strum(serialize = "Long")]
    Long,
    /// Short self-test
    #[strum(serialize = "Short")]
    Short,
    /// Conveyance self-test
    #[strum(serialize = "Conveyance")]
    Conveyance,
    /// Immediate offline data collection
    #[strum(serialize = "Offline")]
    Offline,
}

/// All test types, highest priority first
pub(crate) const TEST_PRIORITY: [TestType; 4] = [
    TestType::Long,
    TestType::Short,
    TestType::Conveyance,
    TestType::Offline,
];

impl TestType {
    /// Pattern letter of this test type
    pub(crate) fn letter(self) -> char {
        match self {
            Self::Long => 'L',
            Self::Short => 'S',
            Self::Conveyance => 'C',
            Self::Offline => 'O',
        }
    }

    /// Index into per-type state arrays
    pub(crate) fn index(self) -> usize {
        match self {
            Self::Long => 0,
            Self::Short => 1,
            Self::Conveyance => 2,
            Self::Offline => 3,
        }
    }
}

/// Compiled `T/MM/DD/D/HH` schedule with double-fire suppression
#[derive(Clone, Debug)]
pub(crate) struct TestSchedule {
    /// Pattern as written in the configuration
    pattern: String,
    /// Compiled, fully anchored expression
    regex: regex::Regex,
    /// Hour-of-year bucket of the last scheduled test
    last_bucket: Option<u32>,
    /// Type of the last scheduled test
    last_type: Option<TestType>,
}

impl TestSchedule {
    /// Compile a schedule pattern.
    /// Anchoring ensures the entire `T/MM/DD/D/HH` string must match.
    pub(crate) fn new(pattern: &str) -> Result<Self, DeviceError> {
        let regex = regex::Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
            DeviceError::InvalidArgument(format!("invalid test schedule {pattern:?}: {e}"))
        })?;
        Ok(Self {
            pattern: pattern.to_owned(),
            regex,
            last_bucket: None,
            last_type: None,
        })
    }

    /// Pattern as written in the configuration
    pub(crate) fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The `T/MM/DD/D/HH` string for a test type at a local time.
    /// Weekday is 1 (Monday) to 7 (Sunday).
    fn match_string(test: TestType, now: &chrono::DateTime<chrono::Local>) -> String {
        format!(
            "{}/{:02}/{:02}/{}/{:02}",
            test.letter(),
            now.month(),
            now.day(),
            now.weekday().number_from_monday(),
            now.hour()
        )
    }

    /// Hour-of-year bucket, unique per hour over a seven year cycle
    fn bucket(now: &chrono::DateTime<chrono::Local>) -> u32 {
        #[expect(clippy::cast_sign_loss)] // rem_euclid is non-negative
        let year_mod = now.year().rem_euclid(7) as u32;
        1 + now.hour() + 24 * (now.ordinal0() + 366 * year_mod)
    }

    /// Does the pattern match this test at this time? Pure, no state.
    pub(crate) fn matches(&self, test: TestType, now: &chrono::DateTime<chrono::Local>) -> bool {
        self.regex.is_match(&Self::match_string(test, now))
    }

    /// Is this test due now? Records the firing so no second test starts
    /// in the same hour bucket; a lower-priority same-hour match is
    /// logged and skipped by the caller seeing `false`.
    pub(crate) fn due(
        &mut self,
        test: TestType,
        now: &chrono::DateTime<chrono::Local>,
    ) -> bool {
        if !self.matches(test, now) {
            return false;
        }
        let bucket = Self::bucket(now);
        if self.last_bucket == Some(bucket) {
            if self.last_type != Some(test) {
                log::info!(
                    "Did test of type {} in current hour, skipping test of type {}",
                    self.last_type.map_or('?', TestType::letter),
                    test.letter()
                );
            }
            return false;
        }
        self.last_bucket = Some(bucket);
        self.last_type = Some(test);
        true
    }
}
