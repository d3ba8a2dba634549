use crc_all::CrcAlgo;

/// Computes the BM1380's 5-bit CRC over the first `len` bits of `data`.
///
/// Same LFSR as CRC-5-USB (polynomial 0x05, initial value 0x1f, no
/// reflection, no output XOR), fed most significant bit first. Commands are
/// checksummed over a prefix that ends mid-byte, which the byte-wise table in
/// [`crc5`] cannot express.
///
/// # Panics
///
/// Panics if `len` exceeds the number of bits in `data`.
pub fn crc5_bits(data: &[u8], len: usize) -> u8 {
    assert!(len <= data.len() * 8, "crc5 over {} bits of {} bytes", len, data.len());

    let mut crc = CRC5_INIT;
    for i in 0..len {
        let bit = (data[i / 8] >> (7 - i % 8)) & 1;
        let feedback = bit ^ (crc >> 4);
        crc = (crc << 1) & 0x1f;
        if feedback == 1 {
            crc ^= CRC5_POLY;
        }
    }
    crc
}

/// Calculates a 5-bit CRC over whole bytes.
///
/// Equivalent to `crc5_bits(data, data.len() * 8)`.
pub fn crc5(data: &[u8]) -> u8 {
    let mut crc = CRC5_INIT;
    CRC5.update_crc(&mut crc, data);
    CRC5.finish_crc(&crc)
}

/// Writes the checksum of the first 27 bits into the low 5 bits of the
/// last byte of a 4-byte command.
pub fn stamp_command(frame: &mut [u8; 4]) {
    frame[3] &= 0xe0;
    frame[3] |= crc5_bits(frame, 27);
}

/// True if a frame carries a valid trailing checksum.
///
/// The CRC of a frame including its own checksum is zero.
pub fn crc5_is_valid(frame: &[u8]) -> bool {
    crc5(frame) == 0
}

const CRC5_INIT: u8 = 0x1f;
const CRC5_POLY: u8 = 0x05;

const CRC5: CrcAlgo<u8> = CrcAlgo::<u8>::new(
    CRC5_POLY, // polynomial
    5,         // width
    CRC5_INIT, // init
    0,         // xorout
    false,     // reflect
);
