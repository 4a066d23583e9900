use std::str;

use crate::error::{BencodeParseError, BencodeParseResult};
use crate::value::{DictEntries, Inner, Value};

pub fn decode(bytes: &[u8], pos: usize, depth: usize) -> BencodeParseResult<(Value<'_>, usize)> {
    if depth >= crate::MAX_RECURSION {
        return Err(BencodeParseError::RecursionExceeded {
            pos,
            max: crate::MAX_RECURSION,
        });
    }
    let curr_byte = peek_byte(bytes, pos)?;

    match curr_byte {
        crate::INT_START => {
            let (int, next_pos) = decode_int(bytes, pos + 1, crate::BEN_END)?;
            Ok((Value::new(Inner::Int(int), &bytes[pos..next_pos]), next_pos))
        }
        crate::LIST_START => {
            let (list, next_pos) = decode_list(bytes, pos + 1, depth)?;
            Ok((Value::new(Inner::List(list), &bytes[pos..next_pos]), next_pos))
        }
        crate::DICT_START => {
            let (entries, next_pos) = decode_dict(bytes, pos + 1, depth)?;
            Ok((Value::new(Inner::Dict(entries), &bytes[pos..next_pos]), next_pos))
        }
        crate::BYTE_LEN_LOW..=crate::BYTE_LEN_HIGH => {
            let (string, next_pos) = decode_bytes(bytes, pos)?;
            // Span includes the length prefix, so start at pos.
            Ok((Value::new(Inner::Bytes(string), &bytes[pos..next_pos]), next_pos))
        }
        _ => Err(BencodeParseError::InvalidByte { pos }),
    }
}

fn decode_int(bytes: &[u8], pos: usize, delim: u8) -> BencodeParseResult<(i64, usize)> {
    let (_, begin_decode) = bytes.split_at(pos);

    let Some(relative_end_pos) = begin_decode.iter().position(|n| *n == delim) else {
        return Err(BencodeParseError::IntNoDelimiter { pos });
    };
    let int_byte_slice = &begin_decode[..relative_end_pos];

    if int_byte_slice.len() > 1 {
        // Negative zero is not allowed (this would not be caught when converting)
        if int_byte_slice[0] == b'-' && int_byte_slice[1] == b'0' {
            return Err(BencodeParseError::IntNegativeZero { pos });
        }

        // Zero padding is illegal, and unspecified for key lengths (we disallow both)
        if int_byte_slice[0] == b'0' {
            return Err(BencodeParseError::IntZeroPadding { pos });
        }
    }

    let Ok(int_str) = str::from_utf8(int_byte_slice) else {
        return Err(BencodeParseError::IntParse { pos });
    };

    // Position of end of integer type, next byte is the start of the next value
    let absolute_end_pos = pos + relative_end_pos;
    let next_pos = absolute_end_pos + 1;
    match int_str.parse::<i64>() {
        Ok(n) => Ok((n, next_pos)),
        Err(_) => Err(BencodeParseError::IntParse { pos }),
    }
}

fn decode_bytes(bytes: &[u8], pos: usize) -> BencodeParseResult<(&[u8], usize)> {
    let (num_bytes, start_pos) = decode_int(bytes, pos, crate::BYTE_LEN_END)?;

    let Ok(num_bytes) = usize::try_from(num_bytes) else {
        // Negative, or larger than the address space; either way the
        // buffer cannot contain it.
        return Err(BencodeParseError::LengthOverflow { pos });
    };

    if num_bytes > bytes[start_pos..].len() {
        return Err(BencodeParseError::LengthOverflow { pos });
    }

    let next_pos = start_pos + num_bytes;
    Ok((&bytes[start_pos..next_pos], next_pos))
}

fn decode_list(bytes: &[u8], pos: usize, depth: usize) -> BencodeParseResult<(Vec<Value<'_>>, usize)> {
    let mut list = Vec::new();

    let mut curr_pos = pos;
    let mut curr_byte = peek_byte(bytes, curr_pos)?;

    while curr_byte != crate::BEN_END {
        let (value, next_pos) = decode(bytes, curr_pos, depth + 1)?;

        list.push(value);

        curr_pos = next_pos;
        curr_byte = peek_byte(bytes, curr_pos)?;
    }

    let next_pos = curr_pos + 1;
    Ok((list, next_pos))
}

fn decode_dict(bytes: &[u8], pos: usize, depth: usize) -> BencodeParseResult<(DictEntries<'_>, usize)> {
    let mut entries: DictEntries<'_> = Vec::new();

    let mut curr_pos = pos;
    let mut curr_byte = peek_byte(bytes, curr_pos)?;

    while curr_byte != crate::BEN_END {
        let (key, next_pos) = decode_bytes(bytes, curr_pos)?;

        // The spec requires sorted keys, and the info-hash identity
        // depends on it, so unsorted input is rejected rather than
        // silently re-sorted.
        if let Some((last_key, _)) = entries.last() {
            if key < *last_key {
                return Err(BencodeParseError::KeyOrdering {
                    pos: curr_pos,
                    key: key.to_vec(),
                });
            }
            if key == *last_key {
                return Err(BencodeParseError::KeyDuplicate {
                    pos: curr_pos,
                    key: key.to_vec(),
                });
            }
        }
        curr_pos = next_pos;

        let (value, next_pos) = decode(bytes, curr_pos, depth + 1)?;
        entries.push((key, value));

        curr_pos = next_pos;
        curr_byte = peek_byte(bytes, curr_pos)?;
    }

    let next_pos = curr_pos + 1;
    Ok((entries, next_pos))
}

fn peek_byte(bytes: &[u8], pos: usize) -> BencodeParseResult<u8> {
    bytes
        .get(pos)
        .copied()
        .ok_or(BencodeParseError::UnexpectedEnd { pos })
}
