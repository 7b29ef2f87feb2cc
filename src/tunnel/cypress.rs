//! Cypress USB bridge ATACB pass-through
//!
//! Output registers are fetched with a second "read taskfile" command.
//! That read is inherently racy against other initiators talking to the
//! same target between the two CDBs; the bridge offers no way to
//! serialize, so none is attempted.

use crate::{
    ata::{AtaCmd, CMD_IDENTIFY_PACKET, OutRegs},
    dev::port::Port,
    error::DeviceError,
    scsi::{Direction, ScsiCmd},
};

/// Default vendor-specific signature byte
pub(crate) const DEFAULT_SIGNATURE: u8 = 0x24;
/// Sub-command byte selecting ATACB
const SUBCOMMAND_ATACB: u8 = 0x24;
/// Register select mask: all taskfile registers except device (bit 6)
/// and the read-taskfile flag position (bit 0)
const REGISTER_SELECT: u8 = 0xff - (1 << 0) - (1 << 6);

/// Build the 16-byte ATACB CDB
fn build_cdb(signature: u8, cmd: &AtaCmd, read_taskfile: bool) -> Vec<u8> {
    let regs = &cmd.taskfile.regs;
    let mut byte2 = 0_u8;
    if regs.command == CMD_IDENTIFY_PACKET {
        byte2 |= 1 << 7; // IdentifyPacketDevice
    }
    if read_taskfile {
        byte2 = 1 << 0;
    }
    vec![
        signature,
        SUBCOMMAND_ATACB,
        byte2,
        REGISTER_SELECT,
        1, // transfer block count: 512-byte blocks
        0,
        regs.features,
        regs.sector_count,
        regs.lba_low,
        regs.lba_mid,
        regs.lba_high,
        0,
        regs.command,
        0,
        0,
        0,
    ]
}

/// Ship an ATA command through the Cypress bridge
pub(crate) fn ata_pass_through(
    port: &mut dyn Port,
    signature: u8,
    cmd: &AtaCmd,
    buf: &mut [u8],
) -> Result<OutRegs, DeviceError> {
    let mut io = ScsiCmd::new(build_cdb(signature, cmd, false), cmd.direction, buf);
    port.scsi_pass_through(&mut io)?;
    if io.sense_info().is_some_and(|s| s.is_error()) {
        // the device rejected ATACB or the ATA command failed
        return Err(DeviceError::Io(
            "Cypress ATACB command failed or unsupported".to_owned(),
        ));
    }
    if cmd.out_needed.is_empty() {
        return Ok(OutRegs::default());
    }

    // second step: fetch the 8 register bytes (racy, see module docs)
    let mut regbuf = [0_u8; 8];
    let mut io = ScsiCmd::new(build_cdb(signature, cmd, true), Direction::In, &mut regbuf);
    port.scsi_pass_through(&mut io)?;
    if io.sense_info().is_some_and(|s| s.is_error()) {
        return Err(DeviceError::Io(
            "Cypress read-taskfile command failed".to_owned(),
        ));
    }
    Ok(OutRegs {
        error: regbuf[1],
        sector_count: regbuf[2],
        lba_low: regbuf[3],
        lba_mid: regbuf[4],
        lba_high: regbuf[5],
        device: regbuf[6],
        status: regbuf[7],
        ..OutRegs::default()
    })
}
