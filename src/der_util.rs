//! Utility functions for a subset of the Distinguished Encoding Rules.
//!
//! The protocol only ever transports primitive tag-length-value nodes with
//! single-byte tags (plus the two-byte application-class tags emitted by
//! their respective builders), so this module stays deliberately small.


use std::fmt;


/// The longest value representable with the length forms supported here
/// (short form plus the `0x81`/`0x82` long forms).
pub const MAX_VALUE_LEN: usize = 0xFFFF;


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum EncodeError {
    ValueTooLong { maximum: usize, obtained: usize },
}
impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValueTooLong { maximum, obtained }
                => write!(f, "value is {} bytes long, expected at most {} bytes", obtained, maximum),
        }
    }
}
impl std::error::Error for EncodeError {
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum DecodeError {
    EmptyInput,
    TagNotFound { tag: u8 },
    TruncatedTag,
    InvalidLength,
    ValueOverrun { length: usize, remaining: usize },
}
impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyInput
                => write!(f, "input is empty"),
            Self::TagNotFound { tag }
                => write!(f, "no node with tag 0x{:02X}", tag),
            Self::TruncatedTag
                => write!(f, "input ends in the middle of a tag"),
            Self::InvalidLength
                => write!(f, "invalid length field"),
            Self::ValueOverrun { length, remaining }
                => write!(f, "length field says {} bytes but only {} remain", length, remaining),
        }
    }
}
impl std::error::Error for DecodeError {
}


/// Encode a DER primitive value length.
pub fn encode_primitive_length(output: &mut Vec<u8>, length: usize) {
    if length < 128 {
        // single-byte encoding
        output.push(length as u8);
    } else {
        // 0b1nnn_nnnn and then n additional bytes that actually specify the
        // length (big-endian)
        let length_bytes = length.to_be_bytes();
        let mut trimmed_length_slice = &length_bytes[..];
        while trimmed_length_slice[0] == 0x00 {
            trimmed_length_slice = &trimmed_length_slice[1..];
        }
        output.push(0b1000_0000 | (trimmed_length_slice.len() as u8));
        output.extend(trimmed_length_slice);
    }
}


/// Decode a DER primitive value length.
///
/// The length must be at the beginning of the input slice.
///
/// Returns a tuple `(length, rest)` where `rest` is the rest of the input
/// slice once the length has been removed.
pub fn try_decode_primitive_length(input: &[u8]) -> Option<(usize, &[u8])> {
    if input.is_empty() {
        return None;
    }
    let start_byte = input[0];
    let start_lower_bits = start_byte & 0b0111_1111;
    if start_byte & 0b1000_0000 != 0 {
        // multiple bytes
        let length_byte_count: usize = start_lower_bits.into();
        if length_byte_count == 0 {
            return None;
        }
        if length_byte_count > input.len() - 1 {
            // that will never fit
            return None;
        }
        let mut length: usize = 0;
        for length_byte in &input[1..1+length_byte_count] {
            let Some(multiplied) = length.checked_mul(256) else { return None };
            length = multiplied;
            let Some(added) = length.checked_add(usize::from(*length_byte)) else { return None };
            length = added;
        }
        Some((length, &input[1+length_byte_count..]))
    } else {
        let length = start_lower_bits.into();
        Some((length, &input[1..]))
    }
}


/// Encode a single primitive node with the given single-byte tag.
///
/// Values longer than [`MAX_VALUE_LEN`] bytes cannot be represented with the
/// supported length forms and are rejected.
pub fn encode_tlv(tag: u8, value: &[u8]) -> Result<Vec<u8>, EncodeError> {
    if value.len() > MAX_VALUE_LEN {
        return Err(EncodeError::ValueTooLong { maximum: MAX_VALUE_LEN, obtained: value.len() });
    }
    let mut output = Vec::with_capacity(4 + value.len());
    output.push(tag);
    encode_primitive_length(&mut output, value.len());
    output.extend_from_slice(value);
    Ok(output)
}


/// Scan the input for a node with the given single-byte tag and return an
/// owned copy of its value.
///
/// Nodes with other tags are skipped over (including two-byte
/// application-class tags, whose second tag byte is consumed). The returned
/// buffer never aliases the input; callers are free to drop the input
/// immediately.
pub fn decode_tlv(tag: u8, input: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if input.is_empty() {
        return Err(DecodeError::EmptyInput);
    }

    let mut rest = input;
    while !rest.is_empty() {
        let node_tag = rest[0];
        let after_tag = if node_tag & 0b0001_1111 == 0b0001_1111 {
            // high-tag-number form; only two-byte tags ever appear here
            if rest.len() < 2 {
                return Err(DecodeError::TruncatedTag);
            }
            &rest[2..]
        } else {
            &rest[1..]
        };

        let (length, after_length) = try_decode_primitive_length(after_tag)
            .ok_or(DecodeError::InvalidLength)?;
        if length > after_length.len() {
            return Err(DecodeError::ValueOverrun { length, remaining: after_length.len() });
        }

        if node_tag == tag {
            return Ok(after_length[..length].to_vec());
        }
        rest = &after_length[length..];
    }

    Err(DecodeError::TagNotFound { tag })
}
