//! Wire-level primitives shared by every device family.
//!
//! Samples arrive as 16- or 24-bit two's complement integers. Control commands
//! are packed bit fields, optionally followed by a CRC-8 byte.

use std::io::{self, Read};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};

use crate::profile::{ByteOrder, SampleFormat, SampleWidth};

// ============================================================================
// Sample Decoding
// ============================================================================

/// Read one sample of the given format from `reader`.
#[inline]
pub fn read_sample<R: Read>(reader: &mut R, format: SampleFormat) -> io::Result<i32> {
    match (format.width, format.order) {
        (SampleWidth::Int16, ByteOrder::BigEndian) => {
            reader.read_i16::<BigEndian>().map(i32::from)
        }
        (SampleWidth::Int16, ByteOrder::LittleEndian) => {
            reader.read_i16::<LittleEndian>().map(i32::from)
        }
        (SampleWidth::Int24, ByteOrder::BigEndian) => reader.read_i24::<BigEndian>(),
        (SampleWidth::Int24, ByteOrder::LittleEndian) => reader.read_i24::<LittleEndian>(),
    }
}

// ============================================================================
// Checksum
// ============================================================================

/// Reflected polynomial used by the OT Bioelettronica command checksum.
const CRC8_POLY: u8 = 0x8C;

/// CRC-8 over `data`, least significant bit first (CRC-8/MAXIM).
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        let mut byte = byte;
        for _ in 0..8 {
            let sum = (crc ^ byte) & 0x01;
            crc >>= 1;
            if sum != 0 {
                crc ^= CRC8_POLY;
            }
            byte >>= 1;
        }
    }
    crc
}

// ============================================================================
// Bit Fields
// ============================================================================

/// Place `value` into a `width`-bit field starting at bit `shift`.
///
/// Bits of `value` beyond `width` are masked off.
#[inline]
pub fn field(value: u8, shift: u8, width: u8) -> u8 {
    let mask = ((1u16 << width) - 1) as u8;
    (value & mask) << shift
}

/// Return `byte` with bit `bit` set or cleared.
#[inline]
pub fn with_bit(byte: u8, bit: u8, on: bool) -> u8 {
    if on {
        byte | (1 << bit)
    } else {
        byte & !(1 << bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8], width: SampleWidth, order: ByteOrder) -> i32 {
        read_sample(&mut &bytes[..], SampleFormat::new(width, order)).unwrap()
    }

    #[test]
    fn int16_covers_full_range() {
        for value in (-32768..=32767).step_by(7) {
            let bytes = (value as i16).to_be_bytes();
            let be = ByteOrder::BigEndian;
            assert_eq!(decode(&bytes, SampleWidth::Int16, be), value);
        }
        assert_eq!(decode(&[0x80, 0x00], SampleWidth::Int16, ByteOrder::BigEndian), -32768);
        assert_eq!(decode(&[0x7F, 0xFF], SampleWidth::Int16, ByteOrder::BigEndian), 32767);
        assert_eq!(decode(&[0xFF, 0xFF], SampleWidth::Int16, ByteOrder::BigEndian), -1);
    }

    #[test]
    fn int24_covers_range_edges() {
        for value in (-8_388_608..=8_388_607).step_by(4099) {
            let b = (value as i32).to_be_bytes();
            assert_eq!(decode(&b[1..], SampleWidth::Int24, ByteOrder::BigEndian), value);
        }
        let be = ByteOrder::BigEndian;
        assert_eq!(decode(&[0x80, 0x00, 0x00], SampleWidth::Int24, be), -8_388_608);
        assert_eq!(decode(&[0x7F, 0xFF, 0xFF], SampleWidth::Int24, be), 8_388_607);
        assert_eq!(decode(&[0xFF, 0xFF, 0xFE], SampleWidth::Int24, be), -2);
    }

    #[test]
    fn little_endian_swaps_significance() {
        let le = ByteOrder::LittleEndian;
        assert_eq!(decode(&[0x34, 0x12], SampleWidth::Int16, le), 0x1234);
        assert_eq!(decode(&[0x00, 0x80], SampleWidth::Int16, le), -32768);
        assert_eq!(decode(&[0x56, 0x34, 0x12], SampleWidth::Int24, le), 0x123456);
        let be = ByteOrder::BigEndian;
        assert_eq!(decode(&[0xFF, 0xFF, 0xFF, 0xAA], SampleWidth::Int24, be), -1);
    }

    #[test]
    fn reads_advance_through_a_buffer() {
        let bytes = [0x00, 0x01, 0xFF, 0xFE];
        let mut reader = &bytes[..];
        let format = SampleFormat::big_endian(SampleWidth::Int16);
        assert_eq!(read_sample(&mut reader, format).unwrap(), 1);
        assert_eq!(read_sample(&mut reader, format).unwrap(), -2);
        assert!(read_sample(&mut reader, format).is_err());
    }

    #[test]
    fn crc8_check_values() {
        assert_eq!(crc8(&[0u8; 39]), 0x00);
        assert_eq!(crc8(b"123456789"), 0xA1);
        assert_eq!(crc8(&[0xFFu8; 39]), 0xCF);
        assert_eq!(crc8(&[]), 0x00);
    }

    #[test]
    fn crc8_quattrocento_command() {
        let mut command = [0u8; 39];
        command[0] = 0x8E;
        for input in 0..12 {
            command[3 + input * 3 + 2] = 0x14;
        }
        assert_eq!(crc8(&command), 0x1E);

        command[0] = 0x8F;
        assert_eq!(crc8(&command), 0x57);
    }

    #[test]
    fn field_masks_and_shifts() {
        assert_eq!(field(0b11, 5, 2), 0b0110_0000);
        assert_eq!(field(0b111, 3, 2), 0b0001_1000);
        assert_eq!(field(1, 7, 1), 0x80);
        assert_eq!(field(0xFF, 0, 8), 0xFF);
    }

    #[test]
    fn with_bit_is_idempotent() {
        let once = with_bit(0x08, 0, true);
        assert_eq!(once, 0x09);
        assert_eq!(with_bit(once, 0, true), 0x09);
        assert_eq!(with_bit(once, 0, false), 0x08);
        assert_eq!(with_bit(0x08, 0, false), 0x08);
    }
}
