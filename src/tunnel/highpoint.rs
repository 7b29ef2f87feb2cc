//! Highpoint RAID enclosure pass-through
//!
//! Two-step protocol: a channel-info request maps the user-visible
//! (controller, channel, pmport) triple to the controller's internal
//! device id, then each pass-through names that id in its header.

use crate::{
    ata::{AtaCmd, OutRegs},
    dev::port::Port,
    error::DeviceError,
    scsi::Direction,
};

/// Vendor opcode: get channel info
const OPCODE_CHANNEL_INFO: u8 = 0x01;
/// Vendor opcode: ATA pass-through
const OPCODE_PASSTHROUGH: u8 = 0x02;
/// Device id reported for an empty channel
const NO_DEVICE: u8 = 0xff;
/// Offset of the returned taskfile in the response packet
const RESPONSE_REGS: usize = 4;

/// Resolve (controller, channel, pmport) to the internal device id.
/// Inputs are 1-based as the user writes them.
pub(crate) fn resolve_device_id(
    port: &mut dyn Port,
    controller: u8,
    channel: u8,
    pmport: u8,
) -> Result<u8, DeviceError> {
    if controller == 0 || channel == 0 {
        return Err(DeviceError::InvalidArgument(
            "Highpoint controller and channel are numbered from 1".to_owned(),
        ));
    }
    let mut packet = vec![
        OPCODE_CHANNEL_INFO,
        controller - 1,
        channel - 1,
        pmport,
        NO_DEVICE,
        0,
        0,
        0,
    ];
    port.vendor_pass_through(&mut packet, Direction::None, &mut [])?;
    let device_id = packet.get(4).copied().unwrap_or(NO_DEVICE);
    if device_id == NO_DEVICE {
        return Err(DeviceError::NotFound(format!(
            "no device on Highpoint {controller}/{channel}/{pmport}"
        )));
    }
    Ok(device_id)
}

/// Ship an ATA command through a Highpoint controller.
/// The pass-through header names the registers like the taskfile does.
pub(crate) fn ata_pass_through(
    port: &mut dyn Port,
    device_id: u8,
    cmd: &AtaCmd,
    buf: &mut [u8],
) -> Result<OutRegs, DeviceError> {
    let regs = &cmd.taskfile.regs;
    let sectors = u8::try_from(buf.len() / 512).unwrap_or(u8::MAX);
    let mut packet = vec![
        OPCODE_PASSTHROUGH,
        device_id,
        regs.features,
        regs.sector_count,
        regs.lba_low,
        regs.lba_mid,
        regs.lba_high,
        regs.device | 0xa0,
        regs.command,
        match cmd.direction {
            Direction::None => 0,
            Direction::In => 1,
            Direction::Out => 2,
        },
        sectors,
        0,
    ];
    port.vendor_pass_through(&mut packet, cmd.direction, buf)?;

    let get = |i: usize| packet.get(i).copied().unwrap_or(0);
    if get(1) != 0 {
        return Err(DeviceError::Io(format!(
            "Highpoint pass-through failed, status {:#04x}",
            get(1)
        )));
    }
    Ok(OutRegs {
        error: get(RESPONSE_REGS),
        sector_count: get(RESPONSE_REGS + 1),
        lba_low: get(RESPONSE_REGS + 2),
        lba_mid: get(RESPONSE_REGS + 3),
        lba_high: get(RESPONSE_REGS + 4),
        device: get(RESPONSE_REGS + 5),
        status: get(RESPONSE_REGS + 6),
        ..OutRegs::default()
    })
}
