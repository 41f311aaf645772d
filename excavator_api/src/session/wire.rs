//! Datagram wire format: element types, CRC framing, handshake frame.
//!
//! Everything on the wire is little-endian. A payload frame is
//! `N × element_size` bytes followed by a 2-byte CRC-16 of the payload.
//! The handshake frame is exactly [`HANDSHAKE_LEN`] bytes.

use crc::{Crc, CRC_16_IBM_3740};
use thiserror::Error;

/// CRC-16/CCITT (poly 0x1021, init 0xFFFF).
pub const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Handshake frame length in bytes.
pub const HANDSHAKE_LEN: usize = 9;

/// Wire-level decode failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Frame length does not match the negotiated shape.
    #[error("malformed frame: expected {expected} bytes, got {got}")]
    WrongSize {
        /// Expected frame length including CRC.
        expected: usize,
        /// Received length.
        got: usize,
    },

    /// CRC mismatch.
    #[error("corrupted frame: CRC mismatch")]
    BadCrc,

    /// Unknown element-type code in a handshake.
    #[error("unknown element type code {0:#04x}")]
    UnknownElementType(u8),
}

/// Numeric element type carried in each frame slot.
///
/// Codes follow the conventional single-character format letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    /// `b` — signed byte.
    I8,
    /// `B` — unsigned byte.
    U8,
    /// `h` — signed 2 bytes.
    I16,
    /// `H` — unsigned 2 bytes.
    U16,
    /// `i` — signed 4 bytes.
    I32,
    /// `I` — unsigned 4 bytes.
    U32,
    /// `q` — signed 8 bytes.
    I64,
    /// `Q` — unsigned 8 bytes.
    U64,
    /// `f` — 4-byte float.
    F32,
    /// `d` — 8-byte float.
    F64,
}

impl ElementType {
    /// Parse a wire code.
    pub const fn from_code(code: u8) -> Result<Self, WireError> {
        Ok(match code {
            b'b' => Self::I8,
            b'B' => Self::U8,
            b'h' => Self::I16,
            b'H' => Self::U16,
            b'i' => Self::I32,
            b'I' => Self::U32,
            b'q' => Self::I64,
            b'Q' => Self::U64,
            b'f' => Self::F32,
            b'd' => Self::F64,
            other => return Err(WireError::UnknownElementType(other)),
        })
    }

    /// Wire code of this type.
    pub const fn code(self) -> u8 {
        match self {
            Self::I8 => b'b',
            Self::U8 => b'B',
            Self::I16 => b'h',
            Self::U16 => b'H',
            Self::I32 => b'i',
            Self::U32 => b'I',
            Self::I64 => b'q',
            Self::U64 => b'Q',
            Self::F32 => b'f',
            Self::F64 => b'd',
        }
    }

    /// Encoded size of one element [bytes].
    pub const fn size(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }

    fn pack_into(self, value: f64, out: &mut Vec<u8>) {
        match self {
            Self::I8 => out.extend_from_slice(&(value as i8).to_le_bytes()),
            Self::U8 => out.extend_from_slice(&(value as u8).to_le_bytes()),
            Self::I16 => out.extend_from_slice(&(value as i16).to_le_bytes()),
            Self::U16 => out.extend_from_slice(&(value as u16).to_le_bytes()),
            Self::I32 => out.extend_from_slice(&(value as i32).to_le_bytes()),
            Self::U32 => out.extend_from_slice(&(value as u32).to_le_bytes()),
            Self::I64 => out.extend_from_slice(&(value as i64).to_le_bytes()),
            Self::U64 => out.extend_from_slice(&(value as u64).to_le_bytes()),
            Self::F32 => out.extend_from_slice(&(value as f32).to_le_bytes()),
            Self::F64 => out.extend_from_slice(&value.to_le_bytes()),
        }
    }

    fn unpack(self, bytes: &[u8]) -> f64 {
        let word4 = |b: &[u8]| [b[0], b[1], b[2], b[3]];
        let word8 = |b: &[u8]| [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]];
        match self {
            Self::I8 => f64::from(i8::from_le_bytes([bytes[0]])),
            Self::U8 => f64::from(bytes[0]),
            Self::I16 => f64::from(i16::from_le_bytes([bytes[0], bytes[1]])),
            Self::U16 => f64::from(u16::from_le_bytes([bytes[0], bytes[1]])),
            Self::I32 => f64::from(i32::from_le_bytes(word4(bytes))),
            Self::U32 => f64::from(u32::from_le_bytes(word4(bytes))),
            Self::I64 => i64::from_le_bytes(word8(bytes)) as f64,
            Self::U64 => u64::from_le_bytes(word8(bytes)) as f64,
            Self::F32 => f64::from(f32::from_le_bytes(word4(bytes))),
            Self::F64 => f64::from_le_bytes(word8(bytes)),
        }
    }
}

/// Encode `values` as a payload frame with trailing CRC.
pub fn encode_frame(values: &[f64], element_type: ElementType) -> Vec<u8> {
    let mut frame = Vec::with_capacity(values.len() * element_type.size() + 2);
    for value in values {
        element_type.pack_into(*value, &mut frame);
    }
    let checksum = CRC16.checksum(&frame);
    frame.extend_from_slice(&checksum.to_le_bytes());
    frame
}

/// Total frame length for a shape.
pub const fn frame_len(count: usize, element_type: ElementType) -> usize {
    count * element_type.size() + 2
}

/// Decode a payload frame of `count` elements.
pub fn decode_frame(
    frame: &[u8],
    count: usize,
    element_type: ElementType,
) -> Result<Vec<f64>, WireError> {
    let expected = frame_len(count, element_type);
    if frame.len() != expected {
        return Err(WireError::WrongSize { expected, got: frame.len() });
    }
    let (payload, crc_bytes) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    if CRC16.checksum(payload) != received {
        return Err(WireError::BadCrc);
    }
    let size = element_type.size();
    Ok((0..count)
        .map(|i| element_type.unpack(&payload[i * size..(i + 1) * size]))
        .collect())
}

/// The 9-byte handshake both peers exchange before streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Arbitrary peer identifier.
    pub local_id: u16,
    /// Values this peer will send per frame.
    pub num_outputs: u16,
    /// Values this peer expects per frame.
    pub num_inputs: u16,
    /// Element type this peer sends with.
    pub element_type: ElementType,
    /// Freshness budget this peer applies to received samples [ms].
    pub max_age_ms: u16,
}

impl Handshake {
    /// Encode to the 9-byte wire form.
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut frame = [0u8; HANDSHAKE_LEN];
        frame[0..2].copy_from_slice(&self.local_id.to_le_bytes());
        frame[2..4].copy_from_slice(&self.num_outputs.to_le_bytes());
        frame[4..6].copy_from_slice(&self.num_inputs.to_le_bytes());
        frame[6] = self.element_type.code();
        frame[7..9].copy_from_slice(&self.max_age_ms.to_le_bytes());
        frame
    }

    /// Decode from the wire form.
    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        if frame.len() != HANDSHAKE_LEN {
            return Err(WireError::WrongSize { expected: HANDSHAKE_LEN, got: frame.len() });
        }
        Ok(Self {
            local_id: u16::from_le_bytes([frame[0], frame[1]]),
            num_outputs: u16::from_le_bytes([frame[2], frame[3]]),
            num_inputs: u16::from_le_bytes([frame[4], frame[5]]),
            element_type: ElementType::from_code(frame[6])?,
            max_age_ms: u16::from_le_bytes([frame[7], frame[8]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TYPES: [ElementType; 10] = [
        ElementType::I8,
        ElementType::U8,
        ElementType::I16,
        ElementType::U16,
        ElementType::I32,
        ElementType::U32,
        ElementType::I64,
        ElementType::U64,
        ElementType::F32,
        ElementType::F64,
    ];

    #[test]
    fn codes_round_trip() {
        for ty in ALL_TYPES {
            assert_eq!(ElementType::from_code(ty.code()).unwrap(), ty);
        }
        assert!(ElementType::from_code(b'x').is_err());
    }

    #[test]
    fn frames_round_trip_for_every_type() {
        for ty in ALL_TYPES {
            let values = [0.0, 1.0, 7.0];
            let frame = encode_frame(&values, ty);
            assert_eq!(frame.len(), frame_len(3, ty));
            let decoded = decode_frame(&frame, 3, ty).unwrap();
            assert_eq!(decoded, values, "type {ty:?}");
        }
    }

    #[test]
    fn float_frames_keep_fractions() {
        let values = [0.25, -0.5, 0.125];
        let decoded =
            decode_frame(&encode_frame(&values, ElementType::F64), 3, ElementType::F64).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn any_single_bit_flip_is_rejected() {
        let frame = encode_frame(&[0.1, 0.2, 0.3], ElementType::F32);
        let payload_bits = (frame.len() - 2) * 8;
        for bit in 0..payload_bits {
            let mut corrupted = frame.clone();
            corrupted[bit / 8] ^= 1 << (bit % 8);
            assert_eq!(
                decode_frame(&corrupted, 3, ElementType::F32),
                Err(WireError::BadCrc),
                "bit {bit} flip slipped through"
            );
        }
    }

    #[test]
    fn wrong_size_is_malformed_not_corrupted() {
        let frame = encode_frame(&[1.0, 2.0], ElementType::F32);
        let err = decode_frame(&frame[..frame.len() - 1], 2, ElementType::F32).unwrap_err();
        assert!(matches!(err, WireError::WrongSize { .. }));
    }

    #[test]
    fn handshake_round_trips() {
        let hs = Handshake {
            local_id: 7,
            num_outputs: 3,
            num_inputs: 0,
            element_type: ElementType::F64,
            max_age_ms: 1000,
        };
        let encoded = hs.encode();
        assert_eq!(encoded.len(), HANDSHAKE_LEN);
        assert_eq!(Handshake::decode(&encoded).unwrap(), hs);
    }

    #[test]
    fn handshake_rejects_unknown_element() {
        let mut frame = Handshake {
            local_id: 0,
            num_outputs: 1,
            num_inputs: 1,
            element_type: ElementType::F32,
            max_age_ms: 100,
        }
        .encode();
        frame[6] = b'z';
        assert_eq!(Handshake::decode(&frame), Err(WireError::UnknownElementType(b'z')));
    }
}
