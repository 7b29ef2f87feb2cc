//! 3ware RAID enclosure pass-through
//!
//! Two packet shapes exist for the two firmware generations; both embed
//! the ATA taskfile in a vendor ioctl packet shipped through the char
//! device node of the controller. The ioctl numbers themselves are
//! platform specific and live in the port implementation.

use super::ThreeWareGen;
use crate::{
    ata::{AtaCmd, CMD_IDENTIFY_PACKET, OutRegs},
    dev::port::Port,
    error::DeviceError,
};

/// Vendor opcode for an ATA pass-through command
const OPCODE_ATA_PASSTHROUGH: u8 = 0x11;
/// ATA status register bits ERR and DF
const STATUS_ERROR_FAULT: u8 = 0x21;
/// Highest unit number addressable behind a controller
pub(crate) const MAX_UNIT: u8 = 31;

/// 678K packet header length
const HEADER_678K: usize = 16;
/// 9000 packet header length
const HEADER_9000: usize = 20;

/// Build the vendor packet embedding the taskfile
fn build_packet(generation: ThreeWareGen, unit: u8, cmd: &AtaCmd, sectors: u8) -> Vec<u8> {
    let regs = &cmd.taskfile.regs;
    match generation {
        // 6000/7000/8000: compact header, taskfile at offset 6
        ThreeWareGen::Gen678K => {
            let mut packet = vec![0_u8; HEADER_678K];
            packet[0] = OPCODE_ATA_PASSTHROUGH;
            packet[1] = 0x05; // packet size in 32-bit words
            packet[3] = unit;
            packet[5] = sectors;
            packet[6] = regs.features;
            packet[7] = regs.sector_count;
            packet[8] = regs.lba_low;
            packet[9] = regs.lba_mid;
            packet[10] = regs.lba_high;
            packet[11] = regs.device | 0xa0;
            packet[12] = regs.command;
            packet
        }
        // 9000: wider header, taskfile at offset 8
        ThreeWareGen::Gen9000 => {
            let mut packet = vec![0_u8; HEADER_9000];
            packet[0] = OPCODE_ATA_PASSTHROUGH;
            packet[1] = 0x06;
            packet[4] = unit;
            packet[6] = sectors;
            packet[8] = regs.features;
            packet[9] = regs.sector_count;
            packet[10] = regs.lba_low;
            packet[11] = regs.lba_mid;
            packet[12] = regs.lba_high;
            packet[13] = regs.device | 0xa0;
            packet[14] = regs.command;
            packet
        }
    }
}

/// Offsets of (status byte, returned taskfile) per generation
fn response_offsets(generation: ThreeWareGen) -> (usize, usize) {
    match generation {
        ThreeWareGen::Gen678K => (4, 6),
        ThreeWareGen::Gen9000 => (5, 8),
    }
}

/// Ship an ATA command through a 3ware controller.
/// IDENTIFY PACKET DEVICE is refused: 3ware never attaches ATAPI
/// devices internally.
pub(crate) fn ata_pass_through(
    port: &mut dyn Port,
    generation: ThreeWareGen,
    unit: u8,
    cmd: &AtaCmd,
    buf: &mut [u8],
) -> Result<OutRegs, DeviceError> {
    if cmd.taskfile.regs.command == CMD_IDENTIFY_PACKET {
        return Err(DeviceError::Unsupported(
            "3ware controllers do not support ATAPI devices".to_owned(),
        ));
    }
    if unit > MAX_UNIT {
        return Err(DeviceError::InvalidArgument(format!(
            "3ware disk number {unit} out of range 0-{MAX_UNIT}"
        )));
    }
    let sectors = u8::try_from(buf.len() / 512).unwrap_or(u8::MAX);
    let mut packet = build_packet(generation, unit, cmd, sectors);
    port.vendor_pass_through(&mut packet, cmd.direction, buf)?;

    let (status_off, regs_off) = response_offsets(generation);
    let get = |i: usize| packet.get(i).copied().unwrap_or(0);
    if get(status_off) != 0 {
        return Err(DeviceError::Io(format!(
            "3ware pass-through failed, controller status {:#04x}",
            get(status_off)
        )));
    }
    let out = OutRegs {
        error: get(regs_off),
        sector_count: get(regs_off + 1),
        lba_low: get(regs_off + 2),
        lba_mid: get(regs_off + 3),
        lba_high: get(regs_off + 4),
        device: get(regs_off + 5),
        status: get(regs_off + 6),
        ..OutRegs::default()
    };
    // returned command status carries the drive's error and fault bits
    if out.status & STATUS_ERROR_FAULT != 0 {
        return Err(DeviceError::Io(format!(
            "3ware pass-through failed, drive status {:#04x}, error {:#04x}",
            out.status, out.error
        )));
    }
    Ok(out)
}

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::ata::SmartRequest;
    use crate::dev::port::MockPort;

    /// A clean response packet for a generation
    fn ok_response(generation: ThreeWareGen) -> Vec<u8> {
        let mut packet = vec![0_u8; 24];
        let (_, regs_off) = response_offsets(generation);
        packet[regs_off + 3] = 0x4f;
        packet[regs_off + 4] = 0xc2;
        packet[regs_off + 6] = 0x50; // ready, no error
        packet
    }

    #[test]
    fn packet_678k_layout() {
        let cmd = SmartRequest::ReadValues.command();
        let packet = build_packet(ThreeWareGen::Gen678K, 2, &cmd, 1);
        assert_eq!(packet[0], 0x11);
        assert_eq!(packet[3], 2);
        assert_eq!(packet[6], 0xd0);
        assert_eq!(packet[9], 0x4f);
        assert_eq!(packet[10], 0xc2);
        assert_eq!(packet[12], 0xb0);
    }

    #[test]
    fn packet_9000_layout() {
        let cmd = SmartRequest::ReadValues.command();
        let packet = build_packet(ThreeWareGen::Gen9000, 7, &cmd, 1);
        assert_eq!(packet[0], 0x11);
        assert_eq!(packet[4], 7);
        assert_eq!(packet[8], 0xd0);
        assert_eq!(packet[14], 0xb0);
    }

    #[test]
    fn packet_identify_refused() {
        let mut port = MockPort::default();
        let cmd = SmartRequest::PacketIdentify.command();
        let mut buf = [0_u8; 512];
        assert!(matches!(
            ata_pass_through(&mut port, ThreeWareGen::Gen9000, 0, &cmd, &mut buf),
            Err(DeviceError::Unsupported(_))
        ));
    }

    #[test]
    fn unit_range_checked() {
        let mut port = MockPort::default();
        let cmd = SmartRequest::ReadValues.command();
        let mut buf = [0_u8; 512];
        assert!(matches!(
            ata_pass_through(&mut port, ThreeWareGen::Gen9000, 32, &cmd, &mut buf),
            Err(DeviceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn status_check_round_trip() {
        let mut port = MockPort::default();
        port.push_vendor(ok_response(ThreeWareGen::Gen9000), vec![]);
        let cmd = SmartRequest::StatusCheck.command();
        let out = ata_pass_through(&mut port, ThreeWareGen::Gen9000, 0, &cmd, &mut []).unwrap();
        assert_eq!((out.lba_mid, out.lba_high), (0x4f, 0xc2));
        assert_eq!(port.vendor_issued().len(), 1);
    }

    #[test]
    fn controller_status_nonzero_is_io() {
        let mut port = MockPort::default();
        let mut response = ok_response(ThreeWareGen::Gen678K);
        response[4] = 0xc7;
        port.push_vendor(response, vec![]);
        let cmd = SmartRequest::ReadValues.command();
        let mut buf = [0_u8; 512];
        assert!(matches!(
            ata_pass_through(&mut port, ThreeWareGen::Gen678K, 0, &cmd, &mut buf),
            Err(DeviceError::Io(_))
        ));
    }

    #[test]
    fn drive_error_fault_bits_are_io() {
        let mut port = MockPort::default();
        let mut response = ok_response(ThreeWareGen::Gen9000);
        let (_, regs_off) = response_offsets(ThreeWareGen::Gen9000);
        response[regs_off + 6] = 0x51; // ERR set
        response[regs_off] = 0x04; // abort
        port.push_vendor(response, vec![]);
        let cmd = SmartRequest::ReadValues.command();
        let mut buf = [0_u8; 512];
        assert!(matches!(
            ata_pass_through(&mut port, ThreeWareGen::Gen9000, 0, &cmd, &mut buf),
            Err(DeviceError::Io(_))
        ));
    }
}
