//! JMicron USB bridge pass-through

use crate::{
    ata::{AtaCmd, CMD_SMART, OutRegs, SMART_STATUS},
    dev::port::Port,
    error::DeviceError,
    scsi::{Direction, ScsiCmd},
};

/// Vendor CDB opcode
const OP_JMICRON: u8 = 0xdf;
/// Device register mask selecting bridge port 0
const PORT0_SELECT: u8 = 0xa0;
/// Device register mask selecting bridge port 1
const PORT1_SELECT: u8 = 0xb0;
/// Bridge register holding the port status bits
const PORT_STATUS_REGISTER: u16 = 0x720f;
/// Port status bit: device on port 0
const PORT0_PRESENT: u8 = 0x04;
/// Port status bit: device on port 1
const PORT1_PRESENT: u8 = 0x40;

/// Build the 12-byte vendor CDB
fn build_cdb(port: u8, cmd: &AtaCmd, transfer_len: usize) -> Vec<u8> {
    let regs = &cmd.taskfile.regs;
    let rwbit = if cmd.direction == Direction::Out { 0x00 } else { 0x10 };
    vec![
        OP_JMICRON,
        rwbit,
        0,
        u8::try_from(transfer_len >> 8).unwrap_or(0),
        (transfer_len & 0xff) as u8,
        regs.features,
        regs.sector_count,
        regs.lba_low,
        regs.lba_mid,
        regs.lba_high,
        regs.device | if port == 0 { PORT0_SELECT } else { PORT1_SELECT },
        regs.command,
    ]
}

/// Read one or more bridge registers starting at `addr`
fn get_registers(port: &mut dyn Port, addr: u16, buf: &mut [u8]) -> Result<(), DeviceError> {
    let len = buf.len();
    let cdb = vec![
        OP_JMICRON,
        0x10,
        0,
        u8::try_from(len >> 8).unwrap_or(0),
        (len & 0xff) as u8,
        0,
        u8::try_from(addr >> 8).unwrap_or(0),
        (addr & 0xff) as u8,
        0,
        0,
        0,
        0xfd,
    ];
    let mut io = ScsiCmd::new(cdb, Direction::In, buf);
    port.scsi_pass_through(&mut io)?;
    if io.sense_info().is_some_and(|s| s.is_error()) {
        return Err(DeviceError::Io("JMicron register read failed".to_owned()));
    }
    Ok(())
}

/// Detect which bridge port the drive hangs off, when the user did not say.
/// Both ports populated is ambiguous and fails the open.
pub(crate) fn detect_port(port: &mut dyn Port) -> Result<u8, DeviceError> {
    let mut status = [0_u8; 1];
    get_registers(port, PORT_STATUS_REGISTER, &mut status)?;
    let port0 = status[0] & PORT0_PRESENT != 0;
    let port1 = status[0] & PORT1_PRESENT != 0;
    match (port0, port1) {
        (true, false) => Ok(0),
        (false, true) => Ok(1),
        (true, true) => Err(DeviceError::InvalidArgument(
            "Two devices connected, try '-d usbjmicron,[01]'".to_owned(),
        )),
        (false, false) => Err(DeviceError::Io(
            "JMicron reports no device on either port".to_owned(),
        )),
    }
}

/// Ship an ATA command through the JMicron bridge.
/// Output registers are only available for SMART STATUS, decoded from a
/// single transferred status byte.
pub(crate) fn ata_pass_through(
    port: &mut dyn Port,
    bridge_port: u8,
    cmd: &AtaCmd,
    buf: &mut [u8],
) -> Result<OutRegs, DeviceError> {
    let is_smart_status = cmd.taskfile.regs.command == CMD_SMART
        && cmd.taskfile.regs.features == SMART_STATUS;
    if !cmd.out_needed.is_empty() && !is_smart_status {
        return Err(DeviceError::Unsupported(
            "ATA output registers not supported by this bridge".to_owned(),
        ));
    }

    if is_smart_status && !cmd.out_needed.is_empty() {
        // one status byte comes back in the data phase
        let mut status_byte = [0_u8; 1];
        let cdb = build_cdb(bridge_port, cmd, 1);
        let mut io = ScsiCmd::new(cdb, Direction::In, &mut status_byte);
        port.scsi_pass_through(&mut io)?;
        if io.sense_info().is_some_and(|s| s.is_error()) {
            return Err(DeviceError::Io("JMicron SMART STATUS failed".to_owned()));
        }
        let mut out = OutRegs::default();
        match status_byte[0] {
            0x01 | 0xc2 => {
                out.lba_mid = 0x4f;
                out.lba_high = 0xc2;
            }
            0x00 | 0x2c => {
                out.lba_mid = 0xf4;
                out.lba_high = 0x2c;
            }
            other => {
                return Err(DeviceError::Protocol(format!(
                    "unexpected JMicron SMART status byte {other:#04x}"
                )));
            }
        }
        return Ok(out);
    }

    let cdb = build_cdb(bridge_port, cmd, buf.len());
    let mut io = ScsiCmd::new(cdb, cmd.direction, buf);
    port.scsi_pass_through(&mut io)?;
    if io.sense_info().is_some_and(|s| s.is_error()) {
        return Err(DeviceError::Io("JMicron pass-through failed".to_owned()));
    }
    Ok(OutRegs::default())
}
