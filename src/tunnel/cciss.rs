//! CCISS (HP Smart Array) SCSI pass-through
//!
//! A thin wrapper around the controller's block pass-through ioctl,
//! taking a plain CDB plus a disk number. Only compiled in when the
//! `cciss` feature is enabled (the ioctl header is not available
//! everywhere); otherwise construction reports the dialect as
//! unavailable.

use std::path::Path;

use crate::{dev::port::Port, error::DeviceError, scsi::ScsiCmd};

/// SCSI port addressing one physical disk behind a CCISS controller
#[derive(Debug)]
pub(crate) struct CcissPort {
    /// Open controller node, `None` once closed
    #[cfg(feature = "cciss")]
    file: Option<std::fs::File>,
    /// Controller path, for error messages
    #[cfg(feature = "cciss")]
    path: String,
    /// Physical disk number behind the controller
    #[cfg(feature = "cciss")]
    disk: u8,
}

#[cfg(feature = "cciss")]
mod ioctl {
    //! CCISS pass-through ioctl plumbing

    use crate::scsi::MAX_SENSE_LEN;

    /// Command targets a physical device
    const CMD_TYPE: u8 = 0x00;
    /// Simple queue attribute
    const ATTR_SIMPLE: u8 = 0x04 << 3;

    /// 8-byte peripheral device address
    #[repr(C)]
    #[derive(Debug, Default)]
    pub(super) struct LunAddr {
        /// Raw address bytes; byte 0 carries the disk number
        pub lun_addr_bytes: [u8; 8],
    }

    /// CDB request block
    #[repr(C)]
    #[derive(Debug)]
    pub(super) struct RequestBlock {
        /// CDB length
        pub cdb_len: u8,
        /// Packed type/attribute/direction bits
        pub type_attr_dir: u8,
        /// Timeout in seconds
        pub timeout: u16,
        /// The CDB itself
        pub cdb: [u8; 16],
    }

    /// Error info returned by the controller
    #[repr(C)]
    #[derive(Debug)]
    pub(super) struct ErrorInfo {
        /// SCSI status byte
        pub scsi_status: u8,
        /// Valid sense bytes
        pub sense_len: u8,
        /// Controller command status
        pub command_status: u16,
        /// Residual count
        pub residual: u32,
        /// Vendor error details
        pub more_err_info: [u8; 8],
        /// Sense buffer
        pub sense_info: [u8; MAX_SENSE_LEN],
    }

    /// The IOCTL_Command_struct payload
    #[repr(C)]
    #[derive(Debug)]
    pub(super) struct CommandStruct {
        /// Target address
        pub lun_info: LunAddr,
        /// Request block
        pub request: RequestBlock,
        /// Error info filled by the controller
        pub error_info: ErrorInfo,
        /// Data buffer size
        pub buf_size: u16,
        /// Data buffer
        pub buf: *mut u8,
    }

    /// Pack the direction bits: 0 none, 1 write, 2 read
    pub(super) fn type_attr_dir(direction: u8) -> u8 {
        CMD_TYPE | ATTR_SIMPLE | (direction << 6)
    }

    nix::ioctl_readwrite!(
        /// CCISS_PASSTHRU from the cciss ioctl header
        cciss_passthru,
        b'B',
        11,
        CommandStruct
    );
}

impl CcissPort {
    /// Open a controller node for pass-through to one disk
    #[cfg(feature = "cciss")]
    pub(crate) fn open(path: &Path, disk: u8) -> Result<Self, DeviceError> {
        let path_str = path.display().to_string();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| DeviceError::from_os(&path_str, &e))?;
        Ok(Self {
            file: Some(file),
            path: path_str,
            disk,
        })
    }

    /// Without the build-time header the dialect is unavailable
    #[cfg(not(feature = "cciss"))]
    pub(crate) fn open(_path: &Path, _disk: u8) -> Result<Self, DeviceError> {
        Err(DeviceError::Unsupported(
            "CCISS support not compiled in (enable the 'cciss' feature)".to_owned(),
        ))
    }
}

impl Port for CcissPort {
    #[cfg(feature = "cciss")]
    fn scsi_pass_through(&mut self, cmd: &mut ScsiCmd<'_>) -> Result<(), DeviceError> {
        use std::os::fd::AsRawFd as _;

        use crate::scsi::{Direction, MAX_SENSE_LEN};

        let file = self
            .file
            .as_ref()
            .ok_or_else(|| DeviceError::Io(format!("{}: device is closed", self.path)))?;
        let mut cdb = [0_u8; 16];
        let cdb_len = cmd.cdb.len().min(16);
        if let (Some(dst), Some(src)) = (cdb.get_mut(..cdb_len), cmd.cdb.get(..cdb_len)) {
            dst.copy_from_slice(src);
        }
        let direction = match cmd.direction {
            Direction::None => 0,
            Direction::Out => 1,
            Direction::In => 2,
        };
        let mut packet = ioctl::CommandStruct {
            lun_info: ioctl::LunAddr {
                lun_addr_bytes: [self.disk, 0, 0, 0, 0, 0, 0, 0],
            },
            request: ioctl::RequestBlock {
                cdb_len: u8::try_from(cdb_len).unwrap_or(16),
                type_attr_dir: ioctl::type_attr_dir(direction),
                timeout: u16::try_from(cmd.timeout.as_secs()).unwrap_or(u16::MAX),
                cdb,
            },
            error_info: ioctl::ErrorInfo {
                scsi_status: 0,
                sense_len: 0,
                command_status: 0,
                residual: 0,
                more_err_info: [0; 8],
                sense_info: [0; MAX_SENSE_LEN],
            },
            buf_size: u16::try_from(cmd.data.len())
                .map_err(|_| DeviceError::InvalidArgument("oversized data buffer".to_owned()))?,
            buf: cmd.data.as_mut_ptr(),
        };
        // SAFETY: packet and its buffer pointer stay alive across the ioctl,
        // and the driver writes at most buf_size data bytes
        unsafe { ioctl::cciss_passthru(file.as_raw_fd(), &raw mut packet) }
            .map_err(|e| DeviceError::Io(format!("{}: CCISS_PASSTHRU failed: {e}", self.path)))?;
        cmd.status = packet.error_info.scsi_status;
        cmd.sense_len = usize::from(packet.error_info.sense_len).min(MAX_SENSE_LEN);
        cmd.sense = packet.error_info.sense_info;
        Ok(())
    }

    #[cfg(not(feature = "cciss"))]
    fn scsi_pass_through(&mut self, _cmd: &mut ScsiCmd<'_>) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported(
            "CCISS support not compiled in".to_owned(),
        ))
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        #[cfg(feature = "cciss")]
        drop(self.file.take());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "cciss"))]
    #[test]
    fn unavailable_without_feature() {
        assert!(matches!(
            CcissPort::open(Path::new("/dev/cciss/c0d0"), 0),
            Err(DeviceError::Unsupported(_))
        ));
    }
}
