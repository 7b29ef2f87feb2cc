//! IDENTIFY DEVICE data decoding

use super::{ProtocolPolicy, check_page_checksum};
use crate::{bytes, error::DeviceError};

/// Decoded subset of the 512-byte IDENTIFY DEVICE page
#[derive(Clone, Debug, Default)]
pub(crate) struct IdentifyInfo {
    /// Model number string
    pub model: String,
    /// Serial number string
    pub serial: String,
    /// Firmware revision string
    pub firmware: String,
    /// ATAPI packet device (word 0 signature)
    pub packet_device: bool,
    /// SMART feature set supported
    pub smart_supported: bool,
    /// SMART feature set currently enabled
    pub smart_enabled: bool,
    /// 48-bit address feature set supported
    pub ata_48bit: bool,
    /// Total addressable sectors (48-bit count when available)
    pub num_sectors: u64,
    /// SMART Command Transport supported
    pub sct_supported: bool,
    /// SCT Feature Control supported
    pub sct_feature_control: bool,
    /// SCT Data Tables supported
    pub sct_data_tables: bool,
}

/// Read one identify word.
/// With the `netbsd-identify-native` feature the kernel has already
/// normalized the page to host order, otherwise it is little-endian.
fn id_word(raw: &[u8], word: usize) -> u16 {
    #[cfg(feature = "netbsd-identify-native")]
    {
        u16::from_ne_bytes([
            raw.get(word * 2).copied().unwrap_or(0),
            raw.get(word * 2 + 1).copied().unwrap_or(0),
        ])
    }
    #[cfg(not(feature = "netbsd-identify-native"))]
    {
        bytes::le_u16(raw, word * 2)
    }
}

/// Decode an IDENTIFY DEVICE page.
/// The checksum is only validated when word 255 claims one (low byte 0xA5).
pub(crate) fn decode(raw: &[u8], policy: &ProtocolPolicy) -> Result<IdentifyInfo, DeviceError> {
    if raw.len() != 512 {
        return Err(DeviceError::Protocol(format!(
            "IDENTIFY page has {} bytes instead of 512",
            raw.len()
        )));
    }
    if id_word(raw, 255) & 0xff == 0xa5 {
        check_page_checksum(raw, "IDENTIFY DEVICE data", policy)?;
    }

    let word0 = id_word(raw, 0);
    let word83 = id_word(raw, 83);
    let word206 = id_word(raw, 206);
    let ata_48bit = word83 & (1 << 10) != 0;
    let num_sectors = if ata_48bit {
        bytes::le_u64(raw, 100 * 2)
    } else {
        u64::from(bytes::le_u32(raw, 60 * 2))
    };
    Ok(IdentifyInfo {
        model: bytes::ata_string(raw, 27 * 2, 40),
        serial: bytes::ata_string(raw, 10 * 2, 20),
        firmware: bytes::ata_string(raw, 23 * 2, 8),
        packet_device: word0 & 0xc000 == 0x8000,
        smart_supported: id_word(raw, 82) & 1 != 0,
        smart_enabled: id_word(raw, 85) & 1 != 0,
        ata_48bit,
        num_sectors,
        sct_supported: word206 & 1 != 0,
        sct_feature_control: word206 & (1 << 4) != 0,
        sct_data_tables: word206 & (1 << 5) != 0,
    })
}

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::indexing_slicing)]
pub(crate) mod tests {
    use super::*;

    /// Build a plausible IDENTIFY page for a 1e9-sector 48-bit drive
    pub(crate) fn sample_identify() -> Vec<u8> {
        let mut raw = vec![0_u8; 512];
        // model "TESTDISK 1000" at words 27..46, byte-swapped pairs
        let model = b"ETTSIDKS1 00 0";
        raw[54..54 + model.len()].copy_from_slice(model);
        let serial = b"NS12543678";
        raw[20..20 + serial.len()].copy_from_slice(serial);
        let firmware = b"WF102.  ";
        raw[46..46 + firmware.len()].copy_from_slice(firmware);
        bytes::put_le_u16(&mut raw, 82 * 2, 1); // SMART supported
        bytes::put_le_u16(&mut raw, 85 * 2, 1); // SMART enabled
        bytes::put_le_u16(&mut raw, 83 * 2, 1 << 10); // 48-bit
        bytes::put_le_u64(&mut raw, 100 * 2, 1_000_000_000);
        bytes::put_le_u16(&mut raw, 206 * 2, 1 | (1 << 4) | (1 << 5)); // SCT
        bytes::put_le_u16(&mut raw, 255 * 2, 0x00a5);
        raw[511] = bytes::page_checksum(&raw, raw[511]);
        raw
    }

    #[test]
    fn decode_sample() {
        let raw = sample_identify();
        let info = decode(&raw, &ProtocolPolicy::default()).unwrap();
        assert_eq!(info.model, "TESTDISK 1000");
        assert_eq!(info.serial, "SN21456387");
        assert_eq!(info.firmware, "FW01.2");
        assert!(info.smart_supported);
        assert!(info.smart_enabled);
        assert!(info.ata_48bit);
        assert!(!info.packet_device);
        assert_eq!(info.num_sectors, 1_000_000_000);
        assert!(info.sct_supported && info.sct_feature_control && info.sct_data_tables);
    }

    #[test]
    fn bad_checksum_respects_policy() {
        let mut raw = sample_identify();
        raw[511] ^= 0xff;
        assert!(decode(&raw, &ProtocolPolicy::default()).is_ok());
        let exit = ProtocolPolicy {
            checksum: crate::error::ChecksumPolicy::Exit,
            ..ProtocolPolicy::default()
        };
        assert!(matches!(
            decode(&raw, &exit),
            Err(DeviceError::Checksum(_))
        ));
    }

    #[test]
    fn unclaimed_checksum_not_verified() {
        let mut raw = sample_identify();
        bytes::put_le_u16(&mut raw, 255 * 2, 0); // no integrity word
        raw[0] ^= 0x55; // breaks the sum
        let exit = ProtocolPolicy {
            checksum: crate::error::ChecksumPolicy::Exit,
            ..ProtocolPolicy::default()
        };
        assert!(decode(&raw, &exit).is_ok());
    }

    #[test]
    fn short_buffer_rejected() {
        assert!(decode(&[0_u8; 256], &ProtocolPolicy::default()).is_err());
    }

    #[test]
    fn sector_count_28bit_fallback() {
        let mut raw = sample_identify();
        bytes::put_le_u16(&mut raw, 83 * 2, 0);
        bytes::put_le_u16(&mut raw, 60 * 2, 0x5000);
        bytes::put_le_u16(&mut raw, 61 * 2, 0x0001);
        raw[511] = 0;
        raw[511] = bytes::page_checksum(&raw, 0);
        let info = decode(&raw, &ProtocolPolicy::default()).unwrap();
        assert!(!info.ata_48bit);
        assert_eq!(info.num_sectors, 0x0001_5000);
    }
}
