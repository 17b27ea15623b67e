//! Filesystem- and URL-safe binary-to-text encoding.
//!
//! A base-64-like codec over the alphabet `A-Z a-z 0-9 . _` (no padding, no
//! line breaks), used wherever a digest needs to name a file or appear in a
//! text reference (`refs/root`, `refs/<branch>`). Encodes three input bytes
//! into four output characters, with the usual two-character / three-character
//! tails for inputs not divisible by three.

use crate::error::{CoreError, CoreResult};

fn encode_sextet(out: &mut String, sextet: u8) {
    let ch = match sextet {
        0..=25 => (b'A' + sextet) as char,
        26..=51 => (b'a' + (sextet - 26)) as char,
        52..=61 => (b'0' + (sextet - 52)) as char,
        62 => '.',
        _ => '_',
    };
    out.push(ch);
}

/// Encodes `data` using the filename-safe alphabet. Never fails.
pub fn alt_encode(data: &[u8]) -> String {
    let mut result = String::with_capacity((data.len() * 4).div_ceil(3));
    let mut chunks = data.chunks_exact(3);
    for triple in &mut chunks {
        let accum = ((triple[0] as u32) << 16) | ((triple[1] as u32) << 8) | (triple[2] as u32);
        encode_sextet(&mut result, (accum >> 18) as u8 & 0x3f);
        encode_sextet(&mut result, (accum >> 12) as u8 & 0x3f);
        encode_sextet(&mut result, (accum >> 6) as u8 & 0x3f);
        encode_sextet(&mut result, accum as u8 & 0x3f);
    }
    match chunks.remainder() {
        [a] => {
            let accum = (*a as u32) << 16;
            encode_sextet(&mut result, (accum >> 18) as u8 & 0x3f);
            encode_sextet(&mut result, (accum >> 12) as u8 & 0x3f);
        }
        [a, b] => {
            let accum = ((*a as u32) << 16) | ((*b as u32) << 8);
            encode_sextet(&mut result, (accum >> 18) as u8 & 0x3f);
            encode_sextet(&mut result, (accum >> 12) as u8 & 0x3f);
            encode_sextet(&mut result, (accum >> 6) as u8 & 0x3f);
        }
        [] => {}
        _ => unreachable!("chunks_exact(3) remainder is always < 3 bytes"),
    }
    result
}

fn decode_char(ch: char) -> CoreResult<u8> {
    match ch {
        'A'..='Z' => Ok(ch as u8 - b'A'),
        'a'..='z' => Ok(ch as u8 - b'a' + 26),
        '0'..='9' => Ok(ch as u8 - b'0' + 52),
        '.' => Ok(62),
        '_' => Ok(63),
        other => Err(CoreError::InvalidEncoding(format!(
            "character '{other}' is not in the filename alphabet"
        ))),
    }
}

/// Decodes a string produced by [`alt_encode`]. Rejects any character
/// outside the alphabet with [`CoreError::InvalidEncoding`].
pub fn alt_decode(encoded: &str) -> CoreResult<Vec<u8>> {
    let mut result = Vec::with_capacity(encoded.len() * 3 / 4);
    let mut accum: u32 = 0;
    let mut count = 0usize;
    for ch in encoded.chars() {
        let sextet = decode_char(ch)?;
        accum = (accum << 6) | sextet as u32;
        count += 1;
        if count % 4 == 0 {
            result.push((accum >> 16) as u8);
            result.push((accum >> 8) as u8);
            result.push(accum as u8);
            accum = 0;
        }
    }
    match count % 4 {
        0 => {}
        2 => result.push((accum >> 4) as u8),
        3 => {
            result.push((accum >> 10) as u8);
            result.push((accum >> 2) as u8);
        }
        _ => {
            return Err(CoreError::InvalidEncoding(
                "trailing single character cannot encode a whole byte".into(),
            ))
        }
    }
    Ok(result)
}
