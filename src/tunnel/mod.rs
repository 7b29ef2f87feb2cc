//! ATA-over-SCSI tunnel dialects

pub(crate) mod cciss;
pub(crate) mod cypress;
pub(crate) mod highpoint;
pub(crate) mod jmicron;
pub(crate) mod sat;
pub(crate) mod sunplus;
pub(crate) mod threeware;
pub(crate) mod usbtable;

use std::fmt;

use crate::{
    ata::{AtaCmd, OutRegs, TransportCaps},
    dev::ScsiHandle,
    error::DeviceError,
};

/// SAT pass-through CDB length
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) enum SatCdbLen {
    /// ATA PASS-THROUGH (12), no 48-bit support
    Len12,
    /// ATA PASS-THROUGH (16)
    #[default]
    Len16,
}

/// 3ware controller firmware generation
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub(crate) enum ThreeWareGen {
    /// 6000/7000/8000 series (`twe` driver)
    #[strum(serialize = "678K")]
    Gen678K,
    /// 9000 series (`twa` driver)
    #[strum(serialize = "9000")]
    Gen9000,
}

/// CDB-level encoding scheme carrying an ATA taskfile
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Dialect {
    /// SAT ATA PASS-THROUGH
    Sat {
        /// CDB length to use
        cdb_len: SatCdbLen,
    },
    /// Cypress USB bridge ATACB
    Cypress {
        /// Vendor-specific signature byte, 0x24 unless reconfigured
        signature: u8,
    },
    /// JMicron USB bridge
    JMicron {
        /// Bridge port the drive is attached to (0 or 1)
        port: u8,
    },
    /// SunplusIT USB bridge
    Sunplus,
    /// 3ware RAID enclosure
    ThreeWare {
        /// Firmware generation
        generation: ThreeWareGen,
        /// Disk behind the controller, 0 to 31
        unit: u8,
    },
    /// Highpoint RAID enclosure
    Highpoint {
        /// Internal device id resolved from (controller, channel, pmport)
        device_id: u8,
    },
}

impl Dialect {
    /// Transport capabilities of this dialect
    pub(crate) fn caps(self) -> TransportCaps {
        match self {
            Self::Sat { cdb_len } => TransportCaps {
                data_out: true,
                multi_sector: true,
                ata_48bit: cdb_len == SatCdbLen::Len16,
            },
            Self::Cypress { .. } | Self::JMicron { .. } => TransportCaps {
                data_out: true,
                multi_sector: false,
                ata_48bit: false,
            },
            Self::Sunplus => TransportCaps {
                data_out: true,
                multi_sector: false,
                ata_48bit: true,
            },
            Self::ThreeWare { .. } | Self::Highpoint { .. } => TransportCaps {
                data_out: true,
                multi_sector: false,
                ata_48bit: false,
            },
        }
    }

    /// Effective `-d` type name of this dialect
    pub(crate) fn type_name(self) -> String {
        match self {
            Self::Sat {
                cdb_len: SatCdbLen::Len16,
            } => "sat".to_owned(),
            Self::Sat {
                cdb_len: SatCdbLen::Len12,
            } => "sat,12".to_owned(),
            Self::Cypress { .. } => "usbcypress".to_owned(),
            Self::JMicron { port } => format!("usbjmicron,{port}"),
            Self::Sunplus => "usbsunplus".to_owned(),
            Self::ThreeWare { generation, unit } => format!("3ware,{unit} ({generation})"),
            Self::Highpoint { device_id } => format!("hpt (device {device_id})"),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// ATA device implemented on top of an owned SCSI handle.
/// Closing the tunnel closes the inner handle exactly once.
pub(crate) struct TunnelDevice {
    /// The owned inner SCSI handle
    inner: ScsiHandle,
    /// Encoding scheme in use
    dialect: Dialect,
}

impl TunnelDevice {
    /// Wrap a SCSI handle in a dialect
    pub(crate) fn new(inner: ScsiHandle, dialect: Dialect) -> Self {
        Self { inner, dialect }
    }

    /// Dialect in use
    pub(crate) fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Device path of the inner handle
    pub(crate) fn path(&self) -> &str {
        self.inner.path()
    }

    /// Transport capabilities of the dialect in use
    pub(crate) fn caps(&self) -> TransportCaps {
        self.dialect.caps()
    }

    /// Borrow the owned inner handle
    pub(crate) fn inner_mut(&mut self) -> &mut ScsiHandle {
        &mut self.inner
    }

    /// Take the inner handle back out, consuming the tunnel
    pub(crate) fn into_inner(self) -> ScsiHandle {
        self.inner
    }

    /// Encode the command per the dialect, ship it, decode the response
    pub(crate) fn ata_pass_through(
        &mut self,
        cmd: &AtaCmd,
        buf: &mut [u8],
    ) -> Result<OutRegs, DeviceError> {
        cmd.check(buf.len(), self.caps())?;
        let port = self.inner.port_mut();
        match self.dialect {
            Dialect::Sat { cdb_len } => sat::ata_pass_through(port, cdb_len, cmd, buf),
            Dialect::Cypress { signature } => cypress::ata_pass_through(port, signature, cmd, buf),
            Dialect::JMicron { port: bridge_port } => {
                jmicron::ata_pass_through(port, bridge_port, cmd, buf)
            }
            Dialect::Sunplus => sunplus::ata_pass_through(port, cmd, buf),
            Dialect::ThreeWare { generation, unit } => {
                threeware::ata_pass_through(port, generation, unit, cmd, buf)
            }
            Dialect::Highpoint { device_id } => {
                highpoint::ata_pass_through(port, device_id, cmd, buf)
            }
        }
    }

    /// Close the tunnel, cascading to the inner handle
    pub(crate) fn close(&mut self) -> Result<(), DeviceError> {
        self.inner.close()
    }
}

impl fmt::Display for TunnelDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.inner.path(), self.dialect)
    }
}
