//! SunplusIT USB bridge pass-through

use crate::{
    ata::{AtaCmd, OutRegs},
    dev::port::Port,
    error::DeviceError,
    scsi::{Direction, SENSE_KEY_MEDIUM_ERROR, ScsiCmd},
};

/// Vendor CDB opcode
const OP_SUNPLUS: u8 = 0xf8;
/// Subcommand: preset the previous register bank for 48-bit commands
const SUB_PRESET: u8 = 0x23;
/// Subcommand: execute the pass-through
const SUB_PASSTHROUGH: u8 = 0x22;
/// Subcommand: retrieve output registers
const SUB_GET_STATUS: u8 = 0x21;

/// Run one vendor CDB and translate its failure modes.
/// The bridge reports an ATA-level command failure as sense key 3
/// (medium error), which is not a media failure here.
fn run(port: &mut dyn Port, cdb: Vec<u8>, direction: Direction, data: &mut [u8], what: &str) -> Result<(), DeviceError> {
    let mut io = ScsiCmd::new(cdb, direction, data);
    port.scsi_pass_through(&mut io)?;
    if let Some(sense) = io.sense_info() {
        if sense.key == SENSE_KEY_MEDIUM_ERROR {
            return Err(DeviceError::Io(format!("{what}: ATA command failed")));
        }
        if sense.is_error() {
            return Err(DeviceError::Io(format!(
                "{what}: sense key {:#x}",
                sense.key
            )));
        }
    }
    Ok(())
}

/// Ship an ATA command through the Sunplus bridge
pub(crate) fn ata_pass_through(
    port: &mut dyn Port,
    cmd: &AtaCmd,
    buf: &mut [u8],
) -> Result<OutRegs, DeviceError> {
    let regs = &cmd.taskfile.regs;
    if cmd.taskfile.is_48bit() {
        // preset the previous bank first
        let prev = &cmd.taskfile.prev;
        let cdb = vec![
            OP_SUNPLUS,
            0,
            SUB_PRESET,
            0,
            0,
            prev.features,
            prev.sector_count,
            prev.lba_low,
            prev.lba_mid,
            prev.lba_high,
            0,
            0,
        ];
        run(port, cdb, Direction::None, &mut [], "Sunplus preset")?;
    }

    let protocol = match cmd.direction {
        Direction::None => 0x00,
        Direction::In => 0x10,
        Direction::Out => 0x11,
    };
    let cdb = vec![
        OP_SUNPLUS,
        0,
        SUB_PASSTHROUGH,
        protocol,
        u8::try_from(buf.len() >> 9).unwrap_or(0), // sector count high byte
        regs.features,
        regs.sector_count,
        regs.lba_low,
        regs.lba_mid,
        regs.lba_high,
        regs.device | 0xa0,
        regs.command,
    ];
    run(port, cdb, cmd.direction, buf, "Sunplus pass-through")?;

    if cmd.out_needed.is_empty() {
        return Ok(OutRegs::default());
    }
    // retrieve the 8 output register bytes
    let mut regbuf = [0_u8; 8];
    let cdb = vec![OP_SUNPLUS, 0, SUB_GET_STATUS, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    run(port, cdb, Direction::In, &mut regbuf, "Sunplus get status")?;
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
