//! SAT: standardized ATA pass-through over SCSI

use super::SatCdbLen;
use crate::{
    ata::{AtaCmd, OutRegs},
    dev::port::Port,
    error::DeviceError,
    scsi::{Direction, ScsiCmd, sense_descriptor},
};

/// ATA PASS-THROUGH (12) opcode
const OP_PASSTHROUGH_12: u8 = 0xa1;
/// ATA PASS-THROUGH (16) opcode
const OP_PASSTHROUGH_16: u8 = 0x85;
/// Sense descriptor type of the ATA Return Descriptor
const ATA_RETURN_DESCRIPTOR: u8 = 0x09;

/// SAT protocol field: non-data
const PROTO_NON_DATA: u8 = 3;
/// SAT protocol field: PIO data-in
const PROTO_PIO_IN: u8 = 4;
/// SAT protocol field: PIO data-out
const PROTO_PIO_OUT: u8 = 5;

/// Build the 12 or 16 byte pass-through CDB for a command
fn build_cdb(cdb_len: SatCdbLen, cmd: &AtaCmd) -> Result<Vec<u8>, DeviceError> {
    let (protocol, t_dir, t_length) = match cmd.direction {
        Direction::None => (PROTO_NON_DATA, 1_u8, 0_u8),
        Direction::In => (PROTO_PIO_IN, 1, 2), // sector_count holds count
        Direction::Out => (PROTO_PIO_OUT, 0, 2),
    };
    let extend = u8::from(cmd.taskfile.is_48bit());
    if extend == 1 && cdb_len == SatCdbLen::Len12 {
        return Err(DeviceError::Unsupported(
            "48-bit ATA commands require ATA PASS-THROUGH (16)".to_owned(),
        ));
    }
    let ck_cond = u8::from(!cmd.out_needed.is_empty());
    let byte_block = 1_u8;
    let byte1 = (protocol << 1) | extend;
    let byte2 = (ck_cond << 5) | (t_dir << 3) | (byte_block << 2) | t_length;
    let lo = &cmd.taskfile.regs;
    let hi = &cmd.taskfile.prev;
    Ok(match cdb_len {
        SatCdbLen::Len12 => vec![
            OP_PASSTHROUGH_12,
            byte1,
            byte2,
            lo.features,
            lo.sector_count,
            lo.lba_low,
            lo.lba_mid,
            lo.lba_high,
            lo.device,
            lo.command,
            0,
            0,
        ],
        SatCdbLen::Len16 => vec![
            OP_PASSTHROUGH_16,
            byte1,
            byte2,
            hi.features,
            lo.features,
            hi.sector_count,
            lo.sector_count,
            hi.lba_low,
            lo.lba_low,
            hi.lba_mid,
            lo.lba_mid,
            hi.lba_high,
            lo.lba_high,
            lo.device,
            lo.command,
            0,
        ],
    })
}

/// Decode the 14-byte ATA Return Descriptor into output registers
fn decode_return_descriptor(desc: &[u8], want_48bit: bool) -> OutRegs {
    let get = |i: usize| desc.get(i).copied().unwrap_or(0);
    let mut out = OutRegs {
        error: get(3),
        sector_count: get(5),
        lba_low: get(7),
        lba_mid: get(9),
        lba_high: get(11),
        device: get(12),
        status: get(13),
        ..OutRegs::default()
    };
    if want_48bit {
        out.prev.sector_count = get(4);
        out.prev.lba_low = get(6);
        out.prev.lba_mid = get(8);
        out.prev.lba_high = get(10);
    }
    out
}

/// Ship an ATA command through SAT and decode the response
pub(crate) fn ata_pass_through(
    port: &mut dyn Port,
    cdb_len: SatCdbLen,
    cmd: &AtaCmd,
    buf: &mut [u8],
) -> Result<OutRegs, DeviceError> {
    let cdb = build_cdb(cdb_len, cmd)?;
    let ck_cond = !cmd.out_needed.is_empty();
    let mut io = ScsiCmd::new(cdb, cmd.direction, buf);
    port.scsi_pass_through(&mut io)?;

    let sense = io.sense_info();
    let descriptor = io
        .sense
        .get(..io.sense_len)
        .and_then(|s| sense_descriptor(s, ATA_RETURN_DESCRIPTOR))
        .map(|d| decode_return_descriptor(d, cmd.taskfile.is_48bit()));

    if let Some(info) = sense {
        if info.is_error() {
            return Err(DeviceError::Io(format!(
                "SAT command failed: sense key {:#x}, asc/ascq {:#04x}/{:#04x}",
                info.key, info.asc, info.ascq
            )));
        }
    }
    if ck_cond {
        // expecting SAT specific sense data; a missing descriptor is
        // tolerated, the registers then read as zero
        if let Some(out) = descriptor {
            return Ok(out);
        }
        log::debug!("SAT response carried no ATA Return Descriptor");
        return Ok(OutRegs::default());
    }
    // without ck_cond a descriptor accompanied by pass-through sense
    // signals a failed ATA command
    if descriptor.is_some()
        && sense.is_some_and(|s| s.response_code >= 0x72 && s.asc == 0 && s.ascq == 0x1d)
    {
        return Err(DeviceError::Io("SAT command failed".to_owned()));
    }
    Ok(OutRegs::default())
}
