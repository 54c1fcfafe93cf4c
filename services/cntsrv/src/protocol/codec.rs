//! Modbus-TCP framing for read holding registers (FC 0x03)
//!
//! Frame layout (all fields big-endian):
//!
//! ```text
//! | transaction id (2) | protocol id (2) = 0 | length (2) | unit id (1) | PDU ... |
//! request PDU:  | 0x03 | start address (2) | quantity (2) |
//! response PDU: | 0x03 | byte count (1) | register words (2 * quantity) |
//! exception:    | 0x83 | exception code (1) |
//! ```
//!
//! The length field counts the unit id plus the PDU. Counter values are built
//! from one (16-bit) or two (32-bit) register words; the word order of 32-bit
//! values differs between vendors and is therefore a parameter.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// MBAP header: transaction id + protocol id + length + unit id
pub const MBAP_HEADER_LEN: usize = 7;

/// Maximum PDU size (RS485 ADU 256 - address 1 - CRC 2)
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum value of the MBAP length field (unit id + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Read Holding Registers
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Maximum registers per FC03 request: (253 - 2) / 2
pub const MAX_READ_REGISTERS: u16 = 125;

const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Invalid register quantity {0} (allowed 1..=125)")]
    InvalidQuantity(u16),

    #[error("Register range {start}+{quantity} exceeds the address space")]
    AddressOverflow { start: u16, quantity: u16 },

    #[error("Frame too short: expected {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("Invalid protocol ID: {0}")]
    InvalidProtocolId(u16),

    #[error("Invalid MBAP length: {0}")]
    InvalidLength(u16),

    #[error("Transaction ID mismatch: expected {expected}, got {actual}")]
    TransactionMismatch { expected: u16, actual: u16 },

    #[error("Unit ID mismatch: expected {expected}, got {actual}")]
    UnitMismatch { expected: u8, actual: u8 },

    #[error("Unexpected function code 0x{0:02X}")]
    UnexpectedFunction(u8),

    #[error("Modbus exception 0x{code:02X} ({})", exception_name(.code))]
    Exception { code: u8 },

    #[error("Byte count mismatch: expected {expected}, got {actual}")]
    ByteCountMismatch { expected: usize, actual: usize },

    #[error("Expected {expected} register words, got {actual}")]
    WordCountMismatch { expected: usize, actual: usize },
}

/// Human-readable name of a Modbus exception code
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Server Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Server Device Busy",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}

fn exception_name(code: &u8) -> &'static str {
    exception_description(*code)
}

// ============================================================================
// Register Width / Word Order
// ============================================================================

/// Counter register width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RegisterWidth {
    Bits16,
    Bits32,
}

impl RegisterWidth {
    /// Number of holding registers occupied by one counter
    pub fn register_count(self) -> u16 {
        match self {
            Self::Bits16 => 1,
            Self::Bits32 => 2,
        }
    }

    /// Largest representable counter value
    pub fn max_value(self) -> u64 {
        match self {
            Self::Bits16 => u64::from(u16::MAX),
            Self::Bits32 => u64::from(u32::MAX),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::Bits16 => 16,
            Self::Bits32 => 32,
        }
    }
}

impl TryFrom<u8> for RegisterWidth {
    type Error = String;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            16 => Ok(Self::Bits16),
            32 => Ok(Self::Bits32),
            other => Err(format!("register width must be 16 or 32, got {}", other)),
        }
    }
}

impl From<RegisterWidth> for u8 {
    fn from(width: RegisterWidth) -> Self {
        width.bits()
    }
}

/// Order of the two words of a 32-bit counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    /// First register holds the high word
    #[default]
    HighFirst,
    /// First register holds the low word
    LowFirst,
}

/// Combine register words into an unsigned counter value
pub fn combine_words(
    words: &[u16],
    width: RegisterWidth,
    order: WordOrder,
) -> Result<u64, CodecError> {
    let expected = width.register_count() as usize;
    if words.len() != expected {
        return Err(CodecError::WordCountMismatch {
            expected,
            actual: words.len(),
        });
    }

    Ok(match (width, order) {
        (RegisterWidth::Bits16, _) => u64::from(words[0]),
        (RegisterWidth::Bits32, WordOrder::HighFirst) => {
            (u64::from(words[0]) << 16) | u64::from(words[1])
        },
        (RegisterWidth::Bits32, WordOrder::LowFirst) => {
            (u64::from(words[1]) << 16) | u64::from(words[0])
        },
    })
}

/// Split a counter value into register words (inverse of [`combine_words`])
///
/// Values wider than `width` are truncated, matching what a device register holds.
pub fn split_value(value: u64, width: RegisterWidth, order: WordOrder) -> Vec<u16> {
    match (width, order) {
        (RegisterWidth::Bits16, _) => vec![value as u16],
        (RegisterWidth::Bits32, WordOrder::HighFirst) => {
            vec![(value >> 16) as u16, value as u16]
        },
        (RegisterWidth::Bits32, WordOrder::LowFirst) => {
            vec![value as u16, (value >> 16) as u16]
        },
    }
}

// ============================================================================
// MBAP Header
// ============================================================================

/// MBAP header for Modbus-TCP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    /// Always 0 for Modbus
    pub protocol_id: u16,
    /// Unit id + PDU byte count
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn new(transaction_id: u16, unit_id: u8, pdu_len: usize) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: (pdu_len + 1) as u16,
            unit_id,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.transaction_id);
        buf.put_u16(self.protocol_id);
        buf.put_u16(self.length);
        buf.put_u8(self.unit_id);
    }

    /// Parse and validate the first 7 bytes of a frame
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < MBAP_HEADER_LEN {
            return Err(CodecError::FrameTooShort {
                expected: MBAP_HEADER_LEN,
                actual: data.len(),
            });
        }

        let header = Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            unit_id: data[6],
        };

        if header.protocol_id != 0 {
            return Err(CodecError::InvalidProtocolId(header.protocol_id));
        }
        // Length covers at least the unit id and a function code
        if header.length < 2 || header.length as usize > MAX_MBAP_LENGTH {
            return Err(CodecError::InvalidLength(header.length));
        }

        Ok(header)
    }

    /// Bytes that follow the header
    pub fn pdu_len(&self) -> usize {
        (self.length as usize).saturating_sub(1)
    }
}

// ============================================================================
// Read Holding Registers
// ============================================================================

/// A single FC03 request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub start_address: u16,
    pub quantity: u16,
}

impl ReadRequest {
    pub fn new(
        transaction_id: u16,
        unit_id: u8,
        start_address: u16,
        quantity: u16,
    ) -> Result<Self, CodecError> {
        if quantity == 0 || quantity > MAX_READ_REGISTERS {
            return Err(CodecError::InvalidQuantity(quantity));
        }
        if u32::from(start_address) + u32::from(quantity) > 0x1_0000 {
            return Err(CodecError::AddressOverflow {
                start: start_address,
                quantity,
            });
        }

        Ok(Self {
            transaction_id,
            unit_id,
            start_address,
            quantity,
        })
    }

    /// Encode the complete ADU (12 bytes)
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + 5);
        MbapHeader::new(self.transaction_id, self.unit_id, 5).encode(&mut buf);
        buf.put_u8(FC_READ_HOLDING_REGISTERS);
        buf.put_u16(self.start_address);
        buf.put_u16(self.quantity);
        buf.freeze()
    }

    /// Validate a response PDU against this request and extract the words
    pub fn decode_response(&self, header: &MbapHeader, pdu: &[u8]) -> Result<Vec<u16>, CodecError> {
        if header.transaction_id != self.transaction_id {
            return Err(CodecError::TransactionMismatch {
                expected: self.transaction_id,
                actual: header.transaction_id,
            });
        }
        if header.unit_id != self.unit_id {
            return Err(CodecError::UnitMismatch {
                expected: self.unit_id,
                actual: header.unit_id,
            });
        }

        let Some(&function) = pdu.first() else {
            return Err(CodecError::FrameTooShort {
                expected: 1,
                actual: 0,
            });
        };

        if function == FC_READ_HOLDING_REGISTERS | EXCEPTION_FLAG {
            let code = pdu.get(1).copied().ok_or(CodecError::FrameTooShort {
                expected: 2,
                actual: pdu.len(),
            })?;
            return Err(CodecError::Exception { code });
        }
        if function != FC_READ_HOLDING_REGISTERS {
            return Err(CodecError::UnexpectedFunction(function));
        }

        let expected = self.quantity as usize * 2;
        let byte_count = pdu.get(1).copied().ok_or(CodecError::FrameTooShort {
            expected: 2 + expected,
            actual: pdu.len(),
        })? as usize;
        if byte_count != expected {
            return Err(CodecError::ByteCountMismatch {
                expected,
                actual: byte_count,
            });
        }
        if pdu.len() < 2 + expected {
            return Err(CodecError::FrameTooShort {
                expected: 2 + expected,
                actual: pdu.len(),
            });
        }

        Ok(pdu[2..2 + expected]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Decode a complete response ADU (header + PDU)
    pub fn decode_frame(&self, frame: &[u8]) -> Result<Vec<u16>, CodecError> {
        let header = MbapHeader::decode(frame)?;
        let end = MBAP_HEADER_LEN + header.pdu_len();
        if frame.len() < end {
            return Err(CodecError::FrameTooShort {
                expected: end,
                actual: frame.len(),
            });
        }
        self.decode_response(&header, &frame[MBAP_HEADER_LEN..end])
    }
}

/// Parse an FC03 request PDU into (start address, quantity)
///
/// Used by the server side of the test simulator.
pub fn parse_read_request_pdu(pdu: &[u8]) -> Result<(u16, u16), CodecError> {
    match pdu {
        [FC_READ_HOLDING_REGISTERS, a0, a1, q0, q1, ..] => Ok((
            u16::from_be_bytes([*a0, *a1]),
            u16::from_be_bytes([*q0, *q1]),
        )),
        [FC_READ_HOLDING_REGISTERS, ..] => Err(CodecError::FrameTooShort {
            expected: 5,
            actual: pdu.len(),
        }),
        [function, ..] => Err(CodecError::UnexpectedFunction(*function)),
        [] => Err(CodecError::FrameTooShort {
            expected: 5,
            actual: 0,
        }),
    }
}

/// Encode a successful FC03 response ADU
pub fn encode_read_response(transaction_id: u16, unit_id: u8, words: &[u16]) -> Bytes {
    let pdu_len = 2 + words.len() * 2;
    let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu_len);
    MbapHeader::new(transaction_id, unit_id, pdu_len).encode(&mut buf);
    buf.put_u8(FC_READ_HOLDING_REGISTERS);
    buf.put_u8((words.len() * 2) as u8);
    for word in words {
        buf.put_u16(*word);
    }
    buf.freeze()
}

/// Encode an FC03 exception response ADU
pub fn encode_exception_response(transaction_id: u16, unit_id: u8, code: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + 2);
    MbapHeader::new(transaction_id, unit_id, 2).encode(&mut buf);
    buf.put_u8(FC_READ_HOLDING_REGISTERS | EXCEPTION_FLAG);
    buf.put_u8(code);
    buf.freeze()
}
