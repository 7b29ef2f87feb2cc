//! Platform I/O port: ships raw CDBs to the kernel

use std::{
    fs::{File, OpenOptions},
    os::fd::AsRawFd as _,
    path::Path,
};

use crate::{
    error::DeviceError,
    scsi::{Direction, MAX_SENSE_LEN, ScsiCmd},
};

/// Transport for raw SCSI commands.
///
/// The Linux port only implements the SCSI half; ATA taskfiles reach the
/// drive through a tunnel dialect that wraps them in a vendor or SAT CDB.
pub(crate) trait Port {
    /// Ship one CDB and run its data phase
    fn scsi_pass_through(&mut self, cmd: &mut ScsiCmd<'_>) -> Result<(), DeviceError>;

    /// Ship one vendor ioctl packet (RAID enclosure pass-through).
    /// The packet is overwritten with the controller's response.
    fn vendor_pass_through(
        &mut self,
        _packet: &mut Vec<u8>,
        _direction: Direction,
        _data: &mut [u8],
    ) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported(
            "vendor pass-through not available on this device".to_owned(),
        ))
    }

    /// Release the underlying handle. Idempotent: a second close is a no-op.
    fn close(&mut self) -> Result<(), DeviceError>;
}

/// `sg_io_hdr` interface id, always ASCII 'S'
const SG_INTERFACE_ID: i32 = 'S' as i32;
/// SG_IO ioctl request number
const SG_IO: u64 = 0x2285;
/// sg data direction: no transfer
const SG_DXFER_NONE: i32 = -1;
/// sg data direction: host to device
const SG_DXFER_TO_DEV: i32 = -2;
/// sg data direction: device to host
const SG_DXFER_FROM_DEV: i32 = -3;

/// Linux generic SCSI pass-through header, v3 interface
#[repr(C)]
#[derive(Debug)]
struct SgIoHdr {
    /// Always [`SG_INTERFACE_ID`]
    interface_id: i32,
    /// One of the `SG_DXFER_*` values
    dxfer_direction: i32,
    /// CDB length
    cmd_len: u8,
    /// Max sense bytes the kernel may return
    mx_sb_len: u8,
    /// Scatter-gather count, unused here
    iovec_count: u16,
    /// Data phase byte count
    dxfer_len: u32,
    /// Data buffer
    dxferp: *mut u8,
    /// CDB buffer
    cmdp: *mut u8,
    /// Sense buffer
    sbp: *mut u8,
    /// Timeout in milliseconds
    timeout: u32,
    /// Request flags
    flags: u32,
    /// Unused pack id
    pack_id: i32,
    /// Unused user pointer
    usr_ptr: *mut u8,
    /// SCSI status byte
    status: u8,
    /// Status masked per the sg driver
    masked_status: u8,
    /// Message status
    msg_status: u8,
    /// Sense bytes actually written
    sb_len_wr: u8,
    /// Host adapter status
    host_status: u16,
    /// Mid-level driver status
    driver_status: u16,
    /// Residual byte count
    resid: i32,
    /// Command duration
    duration: u32,
    /// Info bits
    info: u32,
}

nix::ioctl_readwrite_bad!(
    /// Issue one SG_IO request
    sg_io_ioctl,
    SG_IO,
    SgIoHdr
);

/// SCSI generic port backed by the Linux `SG_IO` ioctl
#[derive(Debug)]
pub(crate) struct SgPort {
    /// Open device node, `None` once closed
    file: Option<File>,
    /// Device path, for error messages
    path: String,
}

impl SgPort {
    /// Open a device node for pass-through commands
    pub(crate) fn open(path: &Path) -> Result<Self, DeviceError> {
        let path_str = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| DeviceError::from_os(&path_str, &e))?;
        Ok(Self {
            file: Some(file),
            path: path_str,
        })
    }
}

impl Port for SgPort {
    fn scsi_pass_through(&mut self, cmd: &mut ScsiCmd<'_>) -> Result<(), DeviceError> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| DeviceError::Io(format!("{}: device is closed", self.path)))?;
        let (dxfer_direction, dxfer_len) = match cmd.direction {
            Direction::None => (SG_DXFER_NONE, 0),
            Direction::In => (SG_DXFER_FROM_DEV, cmd.data.len()),
            Direction::Out => (SG_DXFER_TO_DEV, cmd.data.len()),
        };
        let timeout_ms = u32::try_from(cmd.timeout.as_millis()).unwrap_or(u32::MAX);
        let mut hdr = SgIoHdr {
            interface_id: SG_INTERFACE_ID,
            dxfer_direction,
            cmd_len: u8::try_from(cmd.cdb.len())
                .map_err(|_| DeviceError::InvalidArgument("oversized CDB".to_owned()))?,
            mx_sb_len: u8::try_from(MAX_SENSE_LEN).unwrap_or(u8::MAX),
            iovec_count: 0,
            dxfer_len: u32::try_from(dxfer_len)
                .map_err(|_| DeviceError::InvalidArgument("oversized data buffer".to_owned()))?,
            dxferp: cmd.data.as_mut_ptr(),
            cmdp: cmd.cdb.as_mut_ptr(),
            sbp: cmd.sense.as_mut_ptr(),
            timeout: timeout_ms,
            flags: 0,
            pack_id: 0,
            usr_ptr: std::ptr::null_mut(),
            status: 0,
            masked_status: 0,
            msg_status: 0,
            sb_len_wr: 0,
            host_status: 0,
            driver_status: 0,
            resid: 0,
            duration: 0,
            info: 0,
        };
        // SAFETY: hdr points at buffers that outlive the ioctl call, and the
        // sg driver writes at most mx_sb_len/dxfer_len bytes into them
        unsafe { sg_io_ioctl(file.as_raw_fd(), &raw mut hdr) }.map_err(|e| {
            if e == nix::errno::Errno::ENODEV {
                DeviceError::Io(format!("{}: device disappeared", self.path))
            } else {
                DeviceError::Io(format!("{}: SG_IO failed: {e}", self.path))
            }
        })?;
        cmd.status = hdr.status;
        cmd.sense_len = usize::from(hdr.sb_len_wr).min(MAX_SENSE_LEN);
        if hdr.host_status != 0 || hdr.driver_status & 0x0f != 0 {
            return Err(DeviceError::Io(format!(
                "{}: transport error, host status {:#x}, driver status {:#x}",
                self.path, hdr.host_status, hdr.driver_status
            )));
        }
        log::trace!(
            "{}: CDB {:02x?} -> status {:#x}, {} sense bytes",
            self.path,
            cmd.cdb,
            cmd.status,
            cmd.sense_len
        );
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        // drop closes the fd; second call finds None and succeeds
        drop(self.file.take());
        Ok(())
    }
}

/// Char-device port for RAID enclosure vendor ioctls (3ware, Highpoint).
/// Carries no plain-CDB path; only the vendor packet ioctl is wired up.
#[derive(Debug)]
pub(crate) struct VendorPort {
    /// Open controller node, `None` once closed
    file: Option<File>,
    /// Controller path, for error messages
    path: String,
    /// Ioctl magic byte, controller family specific
    magic: u8,
    /// Ioctl command number within the magic group
    number: u8,
}

impl VendorPort {
    /// Open a controller char device for vendor packets
    pub(crate) fn open(path: &Path, magic: u8, number: u8) -> Result<Self, DeviceError> {
        let path_str = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| DeviceError::from_os(&path_str, &e))?;
        Ok(Self {
            file: Some(file),
            path: path_str,
            magic,
            number,
        })
    }
}

impl Port for VendorPort {
    fn scsi_pass_through(&mut self, _cmd: &mut ScsiCmd<'_>) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported(format!(
            "{}: controller node takes vendor packets, not CDBs",
            self.path
        )))
    }

    fn vendor_pass_through(
        &mut self,
        packet: &mut Vec<u8>,
        direction: Direction,
        data: &mut [u8],
    ) -> Result<(), DeviceError> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| DeviceError::Io(format!("{}: device is closed", self.path)))?;
        // the controller expects header and data contiguous; split again
        // after the ioctl so callers keep their separate buffers
        let header_len = packet.len();
        let mut io_buf = std::mem::take(packet);
        io_buf.extend_from_slice(data);
        // ioctl request numbers are platform specific; size is part of
        // the encoding, so it is computed per call
        let request = nix::request_code_readwrite!(self.magic, self.number, io_buf.len());
        // SAFETY: io_buf stays alive across the ioctl and the driver
        // writes at most its length back
        let res = unsafe {
            nix::libc::ioctl(
                file.as_raw_fd(),
                request as nix::libc::c_ulong,
                io_buf.as_mut_ptr(),
            )
        };
        if res < 0 {
            let errno = nix::errno::Errno::last();
            return Err(DeviceError::Io(format!(
                "{}: vendor ioctl failed: {errno}",
                self.path
            )));
        }
        if direction == Direction::In {
            let n = data.len().min(io_buf.len().saturating_sub(header_len));
            if let (Some(dst), Some(src)) =
                (data.get_mut(..n), io_buf.get(header_len..header_len + n))
            {
                dst.copy_from_slice(src);
            }
        }
        io_buf.truncate(header_len);
        *packet = io_buf;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        drop(self.file.take());
        Ok(())
    }
}

/// Canned-response port for tests.
/// State is shared behind an `Rc` so a test can keep a clone while the
/// port itself is moved into a handle or tunnel.
#[cfg(test)]
#[derive(Clone, Debug, Default)]
pub(crate) struct MockPort {
    /// Shared mock state
    state: std::rc::Rc<std::cell::RefCell<MockState>>,
}

/// Mutable innards of a [`MockPort`]
#[cfg(test)]
#[derive(Debug, Default)]
struct MockState {
    /// Replies to hand out, front first
    responses: std::collections::VecDeque<MockReply>,
    /// CDBs issued so far
    log: Vec<Vec<u8>>,
    /// Data buffers sent for `Direction::Out` commands
    written: Vec<Vec<u8>>,
    /// Vendor packet replies: (response packet, data)
    vendor_responses: std::collections::VecDeque<(Vec<u8>, Vec<u8>)>,
    /// Vendor packets issued so far
    vendor_log: Vec<Vec<u8>>,
    /// Close call count
    closes: u32,
}

/// One canned reply
#[cfg(test)]
#[derive(Debug, Default)]
struct MockReply {
    /// Bytes copied into the data buffer
    data: Vec<u8>,
    /// Bytes copied into the sense buffer
    sense: Vec<u8>,
    /// SCSI status byte
    status: u8,
    /// Port-level failure instead of a reply
    err: Option<DeviceError>,
}

#[cfg(test)]
impl MockPort {
    /// Queue a data-phase reply
    pub(crate) fn push_data(&mut self, data: Vec<u8>) {
        self.state.borrow_mut().responses.push_back(MockReply {
            data,
            ..MockReply::default()
        });
    }

    /// Queue an empty success reply
    pub(crate) fn push_ok(&mut self) {
        self.state
            .borrow_mut()
            .responses
            .push_back(MockReply::default());
    }

    /// Queue a reply carrying sense data
    pub(crate) fn push_sense(&mut self, sense: Vec<u8>) {
        self.state.borrow_mut().responses.push_back(MockReply {
            sense,
            status: 0x02, // CHECK CONDITION
            ..MockReply::default()
        });
    }

    /// Queue a reply carrying sense data and a data phase
    pub(crate) fn push_data_and_sense(&mut self, data: Vec<u8>, sense: Vec<u8>) {
        self.state.borrow_mut().responses.push_back(MockReply {
            data,
            sense,
            status: 0x02,
            ..MockReply::default()
        });
    }

    /// Queue a port-level error
    pub(crate) fn push_err(&mut self, err: DeviceError) {
        self.state.borrow_mut().responses.push_back(MockReply {
            err: Some(err),
            ..MockReply::default()
        });
    }

    /// Queue a vendor packet reply
    pub(crate) fn push_vendor(&mut self, packet: Vec<u8>, data: Vec<u8>) {
        self.state
            .borrow_mut()
            .vendor_responses
            .push_back((packet, data));
    }

    /// CDBs issued so far
    pub(crate) fn issued(&self) -> Vec<Vec<u8>> {
        self.state.borrow().log.clone()
    }

    /// Vendor packets issued so far
    pub(crate) fn vendor_issued(&self) -> Vec<Vec<u8>> {
        self.state.borrow().vendor_log.clone()
    }

    /// Data buffers sent by `Direction::Out` commands so far
    pub(crate) fn written(&self) -> Vec<Vec<u8>> {
        self.state.borrow().written.clone()
    }

    /// Close call count
    pub(crate) fn closes(&self) -> u32 {
        self.state.borrow().closes
    }
}

#[cfg(test)]
impl Port for MockPort {
    fn scsi_pass_through(&mut self, cmd: &mut ScsiCmd<'_>) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        state.log.push(cmd.cdb.clone());
        if cmd.direction == Direction::Out {
            let sent = cmd.data.to_vec();
            state.written.push(sent);
        }
        let reply = state
            .responses
            .pop_front()
            .ok_or_else(|| DeviceError::Protocol("mock port ran out of replies".to_owned()))?;
        if let Some(err) = reply.err {
            return Err(err);
        }
        let n = reply.data.len().min(cmd.data.len());
        if let (Some(dst), Some(src)) = (cmd.data.get_mut(..n), reply.data.get(..n)) {
            dst.copy_from_slice(src);
        }
        let sn = reply.sense.len().min(MAX_SENSE_LEN);
        if let (Some(dst), Some(src)) = (cmd.sense.get_mut(..sn), reply.sense.get(..sn)) {
            dst.copy_from_slice(src);
        }
        cmd.sense_len = sn;
        cmd.status = reply.status;
        Ok(())
    }

    fn vendor_pass_through(
        &mut self,
        packet: &mut Vec<u8>,
        direction: Direction,
        data: &mut [u8],
    ) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        state.vendor_log.push(packet.clone());
        let (response, reply_data) = state.vendor_responses.pop_front().ok_or_else(|| {
            DeviceError::Protocol("mock port ran out of vendor replies".to_owned())
        })?;
        *packet = response;
        if direction == Direction::In {
            let n = reply_data.len().min(data.len());
            if let (Some(dst), Some(src)) = (data.get_mut(..n), reply_data.get(..n)) {
                dst.copy_from_slice(src);
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.state.borrow_mut().closes += 1;
        Ok(())
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_device_is_not_found() {
        assert!(matches!(
            SgPort::open(Path::new("/dev/_does_not_exist_")),
            Err(DeviceError::NotFound(_))
        ));
    }

    #[test]
    fn double_close_is_noop() {
        let mut port = MockPort::default();
        port.close().unwrap();
        port.close().unwrap();
        assert_eq!(port.closes(), 2);
    }

    #[test]
    fn mock_replays_data_and_sense() {
        let mut port = MockPort::default();
        port.push_data_and_sense(vec![1, 2, 3], vec![0x70, 0, 0, 0]);
        let mut buf = [0_u8; 3];
        let mut cmd = ScsiCmd::new(vec![0x12, 0, 0, 0, 3, 0], Direction::In, &mut buf);
        port.scsi_pass_through(&mut cmd).unwrap();
        assert_eq!(cmd.status, 0x02);
        assert_eq!(cmd.sense_len, 4);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(port.issued().len(), 1);
    }

    #[test]
    fn mock_exhaustion_is_protocol_error() {
        let mut port = MockPort::default();
        let mut cmd = ScsiCmd::new(vec![0], Direction::None, &mut []);
        assert!(matches!(
            port.scsi_pass_through(&mut cmd),
            Err(DeviceError::Protocol(_))
        ));
    }
}
