//! ATA taskfile model and SMART command family

pub(crate) mod attr;
pub(crate) mod identify;
pub(crate) mod ops;
pub(crate) mod sct;
pub(crate) mod selftest;

use crate::{error::DeviceError, scsi::Direction};

/// SMART command opcode
pub(crate) const CMD_SMART: u8 = 0xb0;
/// IDENTIFY DEVICE opcode
pub(crate) const CMD_IDENTIFY: u8 = 0xec;
/// IDENTIFY PACKET DEVICE opcode
pub(crate) const CMD_IDENTIFY_PACKET: u8 = 0xa1;
/// CHECK POWER MODE opcode
pub(crate) const CMD_CHECK_POWER_MODE: u8 = 0xe5;

/// SMART feature register: read attribute values
pub(crate) const SMART_READ_VALUES: u8 = 0xd0;
/// SMART feature register: read attribute thresholds
pub(crate) const SMART_READ_THRESHOLDS: u8 = 0xd1;
/// SMART feature register: attribute autosave
pub(crate) const SMART_AUTOSAVE: u8 = 0xd2;
/// SMART feature register: execute immediate offline
pub(crate) const SMART_IMMEDIATE_OFFLINE: u8 = 0xd4;
/// SMART feature register: read log sector
pub(crate) const SMART_READ_LOG: u8 = 0xd5;
/// SMART feature register: write log sector
pub(crate) const SMART_WRITE_LOG: u8 = 0xd6;
/// SMART feature register: enable operations
pub(crate) const SMART_ENABLE: u8 = 0xd8;
/// SMART feature register: disable operations
pub(crate) const SMART_DISABLE: u8 = 0xd9;
/// SMART feature register: return status
pub(crate) const SMART_STATUS: u8 = 0xda;
/// SMART feature register: automatic offline
pub(crate) const SMART_AUTO_OFFLINE: u8 = 0xdb;

/// SMART signature value for the LBA mid register
pub(crate) const SMART_CYL_LOW: u8 = 0x4f;
/// SMART signature value for the LBA high register
pub(crate) const SMART_CYL_HI: u8 = 0xc2;

/// Input registers of a 28-bit taskfile
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct InRegs {
    /// Features register
    pub features: u8,
    /// Sector count register
    pub sector_count: u8,
    /// LBA low register
    pub lba_low: u8,
    /// LBA mid register
    pub lba_mid: u8,
    /// LBA high register
    pub lba_high: u8,
    /// Device register
    pub device: u8,
    /// Command register
    pub command: u8,
}

/// "Previous content" register bank of a 48-bit taskfile
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct PrevRegs {
    /// Features register, high half
    pub features: u8,
    /// Sector count register, high half
    pub sector_count: u8,
    /// LBA low register, high half
    pub lba_low: u8,
    /// LBA mid register, high half
    pub lba_mid: u8,
    /// LBA high register, high half
    pub lba_high: u8,
}

impl PrevRegs {
    /// Any register of the high bank set?
    pub(crate) fn is_set(self) -> bool {
        self != Self::default()
    }
}

/// Full input taskfile: current bank plus 48-bit previous bank
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Taskfile {
    /// Current register bank
    pub regs: InRegs,
    /// Previous register bank, all zero for 28-bit commands
    pub prev: PrevRegs,
}

impl Taskfile {
    /// True when the previous bank carries data, i.e. a real 48-bit command
    pub(crate) fn is_48bit(&self) -> bool {
        self.prev.is_set()
    }
}

/// Output registers returned after command completion
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct OutRegs {
    /// Error register
    pub error: u8,
    /// Sector count register
    pub sector_count: u8,
    /// LBA low register
    pub lba_low: u8,
    /// LBA mid register
    pub lba_mid: u8,
    /// LBA high register
    pub lba_high: u8,
    /// Device register
    pub device: u8,
    /// Status register
    pub status: u8,
    /// High halves for 48-bit commands
    pub prev: PrevRegs,
}

bitflags::bitflags! {
    /// Which output registers the caller needs back
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub(crate) struct OutNeeded: u8 {
        /// Error register
        const ERROR = 1 << 0;
        /// Sector count register
        const SECTOR_COUNT = 1 << 1;
        /// LBA low register
        const LBA_LOW = 1 << 2;
        /// LBA mid register
        const LBA_MID = 1 << 3;
        /// LBA high register
        const LBA_HIGH = 1 << 4;
        /// Device register
        const DEVICE = 1 << 5;
        /// Status register
        const STATUS = 1 << 6;
    }
}

/// One ATA command: taskfile, direction, needed outputs.
/// The data buffer travels alongside, sized `sector_count * 512`.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct AtaCmd {
    /// Input taskfile
    pub taskfile: Taskfile,
    /// Data phase direction
    pub direction: Direction,
    /// Output registers to return
    pub out_needed: OutNeeded,
}

/// What an ATA transport (tunnel dialect) can carry
#[derive(Copy, Clone, Debug)]
pub(crate) struct TransportCaps {
    /// Data-out (host to device) phases supported
    pub data_out: bool,
    /// Multi-sector transfers supported
    pub multi_sector: bool,
    /// Real 48-bit commands supported
    pub ata_48bit: bool,
}

impl AtaCmd {
    /// Check the command against the buffer and transport capabilities.
    /// For a data command, `sector_count * 512` must equal the buffer size.
    pub(crate) fn check(&self, buf_len: usize, caps: TransportCaps) -> Result<(), DeviceError> {
        if self.direction != Direction::None {
            let sectors = usize::from(self.taskfile.regs.sector_count)
                | (usize::from(self.taskfile.prev.sector_count) << 8);
            if sectors * 512 != buf_len {
                return Err(DeviceError::InvalidArgument(format!(
                    "buffer size {buf_len} does not match sector count {sectors}"
                )));
            }
            if sectors > 1 && !caps.multi_sector {
                return Err(DeviceError::Unsupported(
                    "multi-sector transfers not supported by this transport".to_owned(),
                ));
            }
        }
        if self.direction == Direction::Out && !caps.data_out {
            return Err(DeviceError::Unsupported(
                "data-out commands not supported by this transport".to_owned(),
            ));
        }
        if self.taskfile.is_48bit() && !caps.ata_48bit {
            return Err(DeviceError::Unsupported(
                "48-bit commands not supported by this transport".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Typed request for the SMART command family
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SmartRequest {
    /// Read the attribute value table
    ReadValues,
    /// Read the attribute threshold table
    ReadThresholds,
    /// Read `nsectors` sectors of the log at `addr`
    ReadLog {
        /// Log address
        addr: u8,
        /// Sector count
        nsectors: u8,
    },
    /// Write one sector of the log at `addr`
    WriteLog {
        /// Log address
        addr: u8,
    },
    /// IDENTIFY DEVICE
    Identify,
    /// IDENTIFY PACKET DEVICE
    PacketIdentify,
    /// Enable SMART operations
    Enable,
    /// Disable SMART operations
    Disable,
    /// Enable or disable automatic offline testing
    AutoOffline {
        /// Enable when true
        enable: bool,
    },
    /// Enable or disable attribute autosave
    AutoSave {
        /// Enable when true
        enable: bool,
    },
    /// Execute immediate offline test
    ImmediateOffline {
        /// Subcommand selector (test type)
        subcommand: u8,
    },
    /// SMART RETURN STATUS without reading registers back
    Status,
    /// SMART RETURN STATUS reading the signature registers back
    StatusCheck,
    /// CHECK POWER MODE
    CheckPowerMode,
}

impl SmartRequest {
    /// Expected data phase size in bytes
    pub(crate) fn data_len(self) -> usize {
        match self {
            Self::ReadValues
            | Self::ReadThresholds
            | Self::WriteLog { .. }
            | Self::Identify
            | Self::PacketIdentify => 512,
            Self::ReadLog { nsectors, .. } => usize::from(nsectors) * 512,
            Self::Enable
            | Self::Disable
            | Self::AutoOffline { .. }
            | Self::AutoSave { .. }
            | Self::ImmediateOffline { .. }
            | Self::Status
            | Self::StatusCheck
            | Self::CheckPowerMode => 0,
        }
    }

    /// Encode the request as a taskfile command
    pub(crate) fn command(self) -> AtaCmd {
        let mut regs = InRegs {
            lba_mid: SMART_CYL_LOW,
            lba_high: SMART_CYL_HI,
            command: CMD_SMART,
            ..InRegs::default()
        };
        let mut direction = Direction::None;
        let mut out_needed = OutNeeded::empty();
        match self {
            Self::ReadValues => {
                regs.features = SMART_READ_VALUES;
                regs.sector_count = 1;
                direction = Direction::In;
            }
            Self::ReadThresholds => {
                regs.features = SMART_READ_THRESHOLDS;
                regs.sector_count = 1;
                regs.lba_low = 1;
                direction = Direction::In;
            }
            Self::ReadLog { addr, nsectors } => {
                regs.features = SMART_READ_LOG;
                regs.sector_count = nsectors;
                regs.lba_low = addr;
                direction = Direction::In;
            }
            Self::WriteLog { addr } => {
                regs.features = SMART_WRITE_LOG;
                regs.sector_count = 1;
                regs.lba_low = addr;
                direction = Direction::Out;
            }
            Self::Identify => {
                regs = InRegs {
                    sector_count: 1,
                    command: CMD_IDENTIFY,
                    ..InRegs::default()
                };
                direction = Direction::In;
            }
            Self::PacketIdentify => {
                regs = InRegs {
                    sector_count: 1,
                    command: CMD_IDENTIFY_PACKET,
                    ..InRegs::default()
                };
                direction = Direction::In;
            }
            Self::Enable => {
                regs.features = SMART_ENABLE;
                regs.lba_low = 1;
            }
            Self::Disable => {
                regs.features = SMART_DISABLE;
                regs.lba_low = 1;
            }
            Self::AutoOffline { enable } => {
                regs.features = SMART_AUTO_OFFLINE;
                regs.sector_count = if enable { 248 } else { 0 };
            }
            Self::AutoSave { enable } => {
                regs.features = SMART_AUTOSAVE;
                regs.sector_count = if enable { 241 } else { 0 };
            }
            Self::ImmediateOffline { subcommand } => {
                regs.features = SMART_IMMEDIATE_OFFLINE;
                regs.lba_low = subcommand;
            }
            Self::Status => {
                regs.features = SMART_STATUS;
            }
            Self::StatusCheck => {
                regs.features = SMART_STATUS;
                out_needed = OutNeeded::LBA_MID | OutNeeded::LBA_HIGH;
            }
            Self::CheckPowerMode => {
                regs = InRegs {
                    command: CMD_CHECK_POWER_MODE,
                    ..InRegs::default()
                };
                out_needed = OutNeeded::SECTOR_COUNT;
            }
        }
        AtaCmd {
            taskfile: Taskfile {
                regs,
                prev: PrevRegs::default(),
            },
            direction,
            out_needed,
        }
    }
}

/// Drive health verdict from SMART RETURN STATUS
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub(crate) enum HealthStatus {
    /// Thresholds not exceeded
    Ok,
    /// Threshold exceeded, failure predicted
    Failing,
}

/// Interpret the signature registers returned by a SMART status check.
///
/// Some USB bridges truncate the response and only the LBA mid register
/// carries the signature; that degraded form is accepted with a warning.
/// An LBA mid matching neither signature is a protocol error, whatever
/// the high register says.
pub(crate) fn decode_smart_status(out: &OutRegs) -> Result<HealthStatus, DeviceError> {
    match (out.lba_mid, out.lba_high) {
        (SMART_CYL_LOW, SMART_CYL_HI) => Ok(HealthStatus::Ok),
        (0xf4, 0x2c) => Ok(HealthStatus::Failing),
        (SMART_CYL_LOW, _) => {
            log::warn!(
                "SMART status: half healthy response sequence ({:#04x}/{:#04x}), probable SAT/USB truncation",
                out.lba_mid,
                out.lba_high
            );
            Ok(HealthStatus::Ok)
        }
        (0xf4, _) => {
            log::warn!(
                "SMART status: half unhealthy response sequence ({:#04x}/{:#04x}), probable SAT/USB truncation",
                out.lba_mid,
                out.lba_high
            );
            Ok(HealthStatus::Failing)
        }
        (mid, high) => Err(DeviceError::Protocol(format!(
            "SMART status signature unrecognized: {mid:#04x}/{high:#04x}"
        ))),
    }
}

/// Drive power mode from CHECK POWER MODE
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum PowerMode {
    /// Spun down
    Standby,
    /// Spun up but idle
    Idle,
    /// Fully active or idle
    Active,
}

impl PowerMode {
    /// Decode the sector count register returned by CHECK POWER MODE
    pub(crate) fn decode(sector_count: u8) -> Result<Self, DeviceError> {
        match sector_count {
            0x00 => Ok(Self::Standby),
            0x80 => Ok(Self::Idle),
            0xff => Ok(Self::Active),
            other => Err(DeviceError::Protocol(format!(
                "unexpected CHECK POWER MODE value {other:#04x}"
            ))),
        }
    }
}

/// Firmware bug workarounds selectable per drive
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum FirmwareBug {
    /// No workaround
    #[default]
    None,
    /// Byte-swapped attribute and log data
    Samsung,
    /// Byte-swapped attribute data only
    Samsung2,
    /// Self-test-in-progress byte unreliable after test completion
    Samsung3,
    /// Attribute ids swapped within each table pair
    #[strum(serialize = "swapid")]
    SwapId,
}

/// Decoder-side policy: checksum handling and firmware workarounds
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct ProtocolPolicy {
    /// What to do on page checksum mismatch
    pub checksum: crate::error::ChecksumPolicy,
    /// Firmware bug workaround in effect
    pub firmware: FirmwareBug,
}

/// Verify the one's-complement checksum of a 512-byte page and route a
/// mismatch through the policy. The page itself is never modified.
pub(crate) fn check_page_checksum(
    page: &[u8],
    what: &str,
    policy: &ProtocolPolicy,
) -> Result<(), DeviceError> {
    if crate::bytes::page_sum(page) == 0 {
        Ok(())
    } else {
        policy.checksum.apply(what)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Permissive transport for checks
    const ALL_CAPS: TransportCaps = TransportCaps {
        data_out: true,
        multi_sector: true,
        ata_48bit: true,
    };

    #[test]
    fn smart_subcommand_registers() {
        let cmd = SmartRequest::ReadValues.command();
        assert_eq!(cmd.taskfile.regs.command, 0xb0);
        assert_eq!(cmd.taskfile.regs.features, 0xd0);
        assert_eq!(cmd.taskfile.regs.lba_mid, 0x4f);
        assert_eq!(cmd.taskfile.regs.lba_high, 0xc2);
        assert_eq!(cmd.direction, Direction::In);
        assert_eq!(SmartRequest::ReadValues.data_len(), 512);

        let cmd = SmartRequest::WriteLog { addr: 0x09 }.command();
        assert_eq!(cmd.taskfile.regs.features, 0xd6);
        assert_eq!(cmd.taskfile.regs.lba_low, 0x09);
        assert_eq!(cmd.direction, Direction::Out);

        let cmd = SmartRequest::Identify.command();
        assert_eq!(cmd.taskfile.regs.command, 0xec);
        assert_eq!(cmd.taskfile.regs.lba_mid, 0);

        let cmd = SmartRequest::PacketIdentify.command();
        assert_eq!(cmd.taskfile.regs.command, 0xa1);

        let cmd = SmartRequest::CheckPowerMode.command();
        assert_eq!(cmd.taskfile.regs.command, 0xe5);
        assert!(cmd.out_needed.contains(OutNeeded::SECTOR_COUNT));

        let cmd = SmartRequest::AutoOffline { enable: true }.command();
        assert_eq!(cmd.taskfile.regs.features, 0xdb);
        assert_eq!(cmd.taskfile.regs.sector_count, 248);

        let cmd = SmartRequest::AutoSave { enable: true }.command();
        assert_eq!(cmd.taskfile.regs.features, 0xd2);
        assert_eq!(cmd.taskfile.regs.sector_count, 241);

        let cmd = SmartRequest::StatusCheck.command();
        assert_eq!(cmd.taskfile.regs.features, 0xda);
        assert!(cmd.out_needed.contains(OutNeeded::LBA_MID | OutNeeded::LBA_HIGH));
        assert_eq!(cmd.direction, Direction::None);
    }

    #[test]
    fn buffer_size_invariant_enforced() {
        let cmd = SmartRequest::ReadValues.command();
        assert!(cmd.check(512, ALL_CAPS).is_ok());
        assert!(matches!(
            cmd.check(256, ALL_CAPS),
            Err(DeviceError::InvalidArgument(_))
        ));
        // non-data command does not care
        let cmd = SmartRequest::Enable.command();
        assert!(cmd.check(0, ALL_CAPS).is_ok());
    }

    #[test]
    fn transport_caps_enforced() {
        let no_out = TransportCaps {
            data_out: false,
            multi_sector: true,
            ata_48bit: true,
        };
        let cmd = SmartRequest::WriteLog { addr: 0x09 }.command();
        assert!(matches!(
            cmd.check(512, no_out),
            Err(DeviceError::Unsupported(_))
        ));

        let no_48 = TransportCaps {
            data_out: true,
            multi_sector: true,
            ata_48bit: false,
        };
        let mut cmd = SmartRequest::ReadValues.command();
        cmd.taskfile.prev.sector_count = 1;
        assert!(matches!(
            cmd.check(512 * 257, no_48),
            Err(DeviceError::Unsupported(_))
        ));
    }

    #[test]
    fn health_ok_signature() {
        let out = OutRegs {
            lba_mid: 0x4f,
            lba_high: 0xc2,
            ..OutRegs::default()
        };
        assert_eq!(decode_smart_status(&out).ok(), Some(HealthStatus::Ok));
    }

    #[test]
    fn health_failing_signature() {
        let out = OutRegs {
            lba_mid: 0xf4,
            lba_high: 0x2c,
            ..OutRegs::default()
        };
        assert_eq!(decode_smart_status(&out).ok(), Some(HealthStatus::Failing));
    }

    #[test]
    fn health_half_truncated_signatures() {
        // only the mid register decides the degraded cases
        let out = OutRegs {
            lba_mid: 0x4f,
            lba_high: 0x00,
            ..OutRegs::default()
        };
        assert_eq!(decode_smart_status(&out).ok(), Some(HealthStatus::Ok));
        let out = OutRegs {
            lba_mid: 0xf4,
            lba_high: 0x00,
            ..OutRegs::default()
        };
        assert_eq!(decode_smart_status(&out).ok(), Some(HealthStatus::Failing));
    }

    #[test]
    fn health_garbage_is_protocol_error() {
        let out = OutRegs {
            lba_mid: 0x12,
            lba_high: 0x34,
            ..OutRegs::default()
        };
        assert!(matches!(
            decode_smart_status(&out),
            Err(DeviceError::Protocol(_))
        ));
        // a signature in the high register alone proves nothing
        let out = OutRegs {
            lba_mid: 0x00,
            lba_high: 0xc2,
            ..OutRegs::default()
        };
        assert!(matches!(
            decode_smart_status(&out),
            Err(DeviceError::Protocol(_))
        ));
        let out = OutRegs {
            lba_mid: 0x00,
            lba_high: 0x2c,
            ..OutRegs::default()
        };
        assert!(matches!(
            decode_smart_status(&out),
            Err(DeviceError::Protocol(_))
        ));
    }

    #[test]
    fn power_mode_decode() {
        assert_eq!(PowerMode::decode(0x00).ok(), Some(PowerMode::Standby));
        assert_eq!(PowerMode::decode(0x80).ok(), Some(PowerMode::Idle));
        assert_eq!(PowerMode::decode(0xff).ok(), Some(PowerMode::Active));
        assert!(PowerMode::decode(0x42).is_err());
    }

    #[test]
    fn checksum_policy_routes_mismatch() {
        let mut page = [0_u8; 512];
        page[0] = 1;
        let exit = ProtocolPolicy {
            checksum: crate::error::ChecksumPolicy::Exit,
            ..ProtocolPolicy::default()
        };
        assert!(check_page_checksum(&page, "test", &exit).is_err());
        let warn = ProtocolPolicy::default();
        assert!(check_page_checksum(&page, "test", &warn).is_ok());
        page[511] = crate::bytes::page_checksum(&page, page[511]);
        assert!(check_page_checksum(&page, "test", &exit).is_ok());
    }
}
