//! BM1380 wire protocol.
//!
//! Outbound traffic is either a 4-byte command (opcode, two parameter bytes,
//! CRC5 in the low bits of the last byte) or a 64-byte job frame. Everything
//! the chips send back is a fixed 5-byte response:
//!
//! ```text
//! byte:  0    1    2    3    4
//!       [ nonce / register data ][ flags | slot or CRC5 ]
//! ```
//!
//! Register responses end in a CRC5 over all 40 bits. Nonce responses put
//! the job slot id in the low 5 bits of byte 4 instead, so only register
//! traffic is checksum-validated.

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use super::crc::{crc5_is_valid, stamp_command};
use super::error::ProtocolError;
use crate::tracing::prelude::*;
use crate::types::MiningJob;

/// The chips' default UART speed.
pub const BAUD_RATE: u32 = 115_200;

/// Length of every frame the chips send.
pub const RESPONSE_LEN: usize = 5;

/// Length of a job frame.
pub const JOB_FRAME_LEN: usize = 64;

/// Mask applied to the work counter to form a job slot id.
pub const SLOT_MASK: u32 = 0x1f;

/// Supported core clocks and the PLL words that select them.
const FREQUENCY_TABLE: &[(u32, u16)] = &[
    (100, 0x0381),
    (125, 0x0481),
    (150, 0x0581),
    (175, 0x0681),
    (193, 0x4f02),
    (200, 0x0781),
    (225, 0x0885),
    (250, 0x0981),
    (275, 0x0a81),
    (300, 0x0b81),
    (325, 0x0c81),
    (350, 0x0d81),
    (375, 0x0e81),
    (400, 0x0f81),
];

/// A core clock frequency the chips can be programmed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frequency {
    mhz: u32,
    pll_code: u16,
}

impl Frequency {
    pub const DEFAULT_MHZ: u32 = 193;

    /// Look up a frequency in the chip's PLL table.
    pub fn from_mhz(mhz: u32) -> Result<Self, ProtocolError> {
        FREQUENCY_TABLE
            .iter()
            .find(|(table_mhz, _)| *table_mhz == mhz)
            .map(|&(mhz, pll_code)| Self { mhz, pll_code })
            .ok_or_else(|| ProtocolError::UnsupportedFrequency {
                mhz,
                supported: Self::supported_mhz()
                    .map(|mhz| mhz.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    pub fn supported_mhz() -> impl Iterator<Item = u32> {
        FREQUENCY_TABLE.iter().map(|(mhz, _)| *mhz)
    }

    pub fn mhz(&self) -> u32 {
        self.mhz
    }

    pub fn pll_code(&self) -> u16 {
        self.pll_code
    }
}

impl Default for Frequency {
    fn default() -> Self {
        Self {
            mhz: Self::DEFAULT_MHZ,
            pll_code: 0x4f02,
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} MHz", self.mhz)
    }
}

/// Registers read during chain bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegisterAddress {
    /// Every chip answers a read of this register, which is how the chain
    /// is counted
    ChipStatus = 0x00,
    /// Read back after a clock change to let the PLL settle
    Pll = 0x04,
}

/// A 64-byte job frame.
///
/// Layout: midstate (byte-reversed) at 0..32, zero padding, the job slot id
/// at 51, then the last 12 bytes of the header's first-block remainder
/// (byte-reversed) at 52..64. Job frames carry no checksum.
#[derive(Clone, PartialEq, Eq)]
pub struct JobFrame([u8; JOB_FRAME_LEN]);

impl JobFrame {
    const SLOT_OFFSET: usize = 51;
    const TAIL_OFFSET: usize = 52;

    /// Build a frame from a midstate and header tail as they appear in a
    /// [`MiningJob`].
    pub fn new(midstate: &[u8; 32], header_tail: &[u8; 12], slot: u32) -> Self {
        let mut frame = [0u8; JOB_FRAME_LEN];
        for (dst, src) in frame[..32].iter_mut().zip(midstate.iter().rev()) {
            *dst = *src;
        }
        for (dst, src) in frame[Self::TAIL_OFFSET..]
            .iter_mut()
            .zip(header_tail.iter().rev())
        {
            *dst = *src;
        }
        Self(frame).with_slot(slot)
    }

    pub fn from_job(job: &MiningJob, slot: u32) -> Self {
        Self::new(&job.midstate, &job.header_tail(), slot)
    }

    /// Wrap an already laid out frame.
    pub const fn from_bytes(bytes: [u8; JOB_FRAME_LEN]) -> Self {
        Self(bytes)
    }

    /// Tag the frame with the low 5 bits of `slot`.
    pub fn with_slot(mut self, slot: u32) -> Self {
        self.0[Self::SLOT_OFFSET] = (slot & SLOT_MASK) as u8;
        self
    }

    pub fn slot(&self) -> u8 {
        self.0[Self::SLOT_OFFSET]
    }

    pub fn as_bytes(&self) -> &[u8; JOB_FRAME_LEN] {
        &self.0
    }
}

impl fmt::Debug for JobFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobFrame")
            .field("slot", &self.slot())
            .field("bytes", &hex::encode(self.0))
            .finish()
    }
}

/// Everything that can be sent to the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ask every chip for a register; each answers with one response
    ReadRegister(RegisterAddress),
    /// Put the chain into its inactive (addressing) state
    ChainInactive,
    /// Program the core clock
    SetPll(Frequency),
    /// Start work on a job
    Job(JobFrame),
}

impl Command {
    const OP_SET_PLL: u8 = 0x82;
    const OP_READ_REGISTER: u8 = 0x84;
    const OP_CHAIN_INACTIVE: u8 = 0x85;

    /// The 4-byte form of a non-job command, checksum included.
    fn command_bytes(&self) -> Option<[u8; 4]> {
        let mut frame = match self {
            Command::ReadRegister(reg) => [Self::OP_READ_REGISTER, 0x00, *reg as u8, 0x00],
            Command::ChainInactive => [Self::OP_CHAIN_INACTIVE, 0x00, 0x00, 0x00],
            Command::SetPll(freq) => {
                let [hi, lo] = freq.pll_code().to_be_bytes();
                [Self::OP_SET_PLL, hi, lo, 0x00]
            }
            Command::Job(_) => return None,
        };
        stamp_command(&mut frame);
        Some(frame)
    }

    fn encode(&self, dst: &mut BytesMut) {
        match self {
            Command::Job(frame) => dst.put_slice(frame.as_bytes()),
            _ => {
                if let Some(bytes) = self.command_bytes() {
                    dst.put_slice(&bytes);
                }
            }
        }
    }
}

/// A 5-byte frame from the chain.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Response([u8; RESPONSE_LEN]);

impl Response {
    pub const fn from_bytes(bytes: [u8; RESPONSE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; RESPONSE_LEN] {
        &self.0
    }

    /// Nonce reported by a chip.
    ///
    /// The chips send the header's nonce bytes in header order, so the value
    /// is the little-endian reading of bytes 0..4.
    pub fn nonce(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Job slot id of a nonce response.
    pub fn slot(&self) -> u8 {
        self.0[4] & SLOT_MASK as u8
    }

    /// Address of the chip that sent a register response.
    pub fn chip_address(&self) -> u8 {
        self.0[3]
    }

    /// Whether the trailing CRC5 checks out (register responses only).
    pub fn is_crc_valid(&self) -> bool {
        crc5_is_valid(&self.0)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Response({})", hex::encode(self.0))
    }
}

/// Codec for the chain's serial stream.
///
/// The chips emit fixed 5-byte frames with no preamble, so decoding is plain
/// fixed-length chunking.
#[derive(Default)]
pub struct FrameCodec;

impl Encoder<Command> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        command.encode(dst);
        trace!("TX: {:?} => {:02x?}", command, &dst[start..]);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Response;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < RESPONSE_LEN {
            return Ok(None);
        }

        let mut bytes = [0u8; RESPONSE_LEN];
        src.copy_to_slice(&mut bytes);
        let response = Response::from_bytes(bytes);
        trace!("RX: {:?}", response);
        Ok(Some(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asic::bm1380::crc::crc5_bits;
    use test_case::test_case;

    fn encode(command: Command) -> Vec<u8> {
        let mut buf = BytesMut::new();
        FrameCodec.encode(command, &mut buf).unwrap();
        buf.to_vec()
    }

    #[test_case(Command::ReadRegister(RegisterAddress::ChipStatus), [0x84, 0x00, 0x00, 0x11]; "read_status")]
    #[test_case(Command::SetPll(Frequency::default()), [0x82, 0x4f, 0x02, 0x1d]; "set_pll_default")]
    fn test_command_encoding(command: Command, expected: [u8; 4]) {
        assert_eq!(encode(command), expected);
    }

    #[test_case(Command::ReadRegister(RegisterAddress::Pll); "read_pll")]
    #[test_case(Command::ChainInactive; "chain_inactive")]
    #[test_case(Command::SetPll(Frequency::from_mhz(400).unwrap()); "set_pll_400")]
    fn test_command_checksum_over_27_bits(command: Command) {
        let bytes = encode(command);
        assert_eq!(bytes.len(), 4);
        assert_eq!(bytes[3] & 0x1f, crc5_bits(&bytes, 27));
        assert!(crc5_is_valid(&bytes));
    }

    #[test]
    fn test_frequency_table() {
        let freq = Frequency::from_mhz(250).unwrap();
        assert_eq!(freq.pll_code(), 0x0981);
        assert_eq!(Frequency::default(), Frequency::from_mhz(193).unwrap());
        assert_eq!(Frequency::supported_mhz().count(), 14);
    }

    #[test]
    fn test_unsupported_frequency_lists_options() {
        let err = Frequency::from_mhz(180).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("180 MHz"));
        assert!(message.contains("100, 125, 150, 175, 193, 200"));
        assert!(message.ends_with("400"));
    }

    #[test]
    fn test_job_frame_layout() {
        let midstate: [u8; 32] = core::array::from_fn(|i| i as u8);
        let tail: [u8; 12] = core::array::from_fn(|i| 0xa0 + i as u8);
        let frame = JobFrame::new(&midstate, &tail, 0x25);
        let bytes = frame.as_bytes();

        assert_eq!(bytes[0], 31);
        assert_eq!(bytes[31], 0);
        assert!(bytes[32..51].iter().all(|b| *b == 0));
        assert_eq!(bytes[51], 0x05);
        assert_eq!(bytes[52], 0xab);
        assert_eq!(bytes[63], 0xa0);
        assert_eq!(encode(Command::Job(frame.clone())), bytes.to_vec());
    }

    #[test]
    fn test_decoder_chunks_fixed_frames() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x87, 0xa2, 0x1f, 0x11, 0x22][..]);

        let response = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(response.as_bytes(), &[0x00, 0x01, 0x87, 0xa2, 0x1f]);
        assert_eq!(response.nonce(), 0xa287_0100);
        assert_eq!(response.slot(), 0x1f);

        // Partial frame stays buffered
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 2);

        buf.extend_from_slice(&[0x33, 0x44, 0x85]);
        let response = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(response.as_bytes(), &[0x11, 0x22, 0x33, 0x44, 0x85]);
        assert_eq!(response.slot(), 0x05);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_register_response_crc() {
        let mut bytes = [0x13, 0x80, 0x00, 0x04, 0x00];
        bytes[4] = crc5_bits(&bytes, 35);
        let response = Response::from_bytes(bytes);
        assert!(response.is_crc_valid());
        assert_eq!(response.chip_address(), 0x04);

        bytes[0] ^= 0x80;
        assert!(!Response::from_bytes(bytes).is_crc_valid());
    }
}
