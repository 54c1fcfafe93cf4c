//! Device protocol support
//!
//! Only Modbus-TCP read holding registers is needed for counter devices.

pub mod codec;

pub use codec::{
    combine_words, split_value, CodecError, MbapHeader, ReadRequest, RegisterWidth, WordOrder,
    FC_READ_HOLDING_REGISTERS, MAX_READ_REGISTERS, MBAP_HEADER_LEN,
};
