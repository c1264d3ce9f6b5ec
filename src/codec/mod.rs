//! Two-stage chunk compression for the demo format.
//!
//! Chunk payloads are packed as variable-length signed integers first
//! (snapshot data is integer-heavy, so this alone roughly halves it),
//! then run through LZ4. Both stages are reversed on playback.
//!
//! The varint codec operates on 4-byte-aligned buffers: every group of
//! four bytes is treated as one little-endian `i32`. The first byte of
//! a packed integer carries six value bits, a sign flag (0x40) and a
//! continuation flag (0x80); following bytes carry seven value bits
//! each, up to four of them.

use std::io;

/// Errors from the varint and compression stages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Varint input must be a whole number of 4-byte integers.
    #[error("buffer of {0} bytes is not 4-byte aligned")]
    Misaligned(usize),
    /// The packed stream ended in the middle of an integer.
    #[error("truncated varint sequence")]
    Truncated,
    /// Decoded output would exceed the caller's limit.
    #[error("decoded output exceeds the {max} byte limit")]
    TooLarge {
        /// Maximum number of output bytes the caller allowed.
        max: usize,
    },
    /// LZ4 decompression failed (corrupt or truncated block).
    #[error("lz4 decompression failed: {0}")]
    Lz4(#[from] lz4_flex::block::DecompressError),
}

impl From<CodecError> for io::Error {
    fn from(e: CodecError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

const SIGN: u8 = 0x40;
const EXTEND: u8 = 0x80;

fn pack_int(v: i32, out: &mut Vec<u8>) {
    let mut first = 0u8;
    let mut u = if v < 0 {
        first |= SIGN;
        !v as u32
    } else {
        v as u32
    };
    first |= (u & 0x3f) as u8;
    u >>= 6;
    if u == 0 {
        out.push(first);
        return;
    }
    out.push(first | EXTEND);
    while u != 0 {
        let mut b = (u & 0x7f) as u8;
        u >>= 7;
        if u != 0 {
            b |= EXTEND;
        }
        out.push(b);
    }
}

fn unpack_int(src: &[u8], pos: &mut usize) -> Result<i32, CodecError> {
    let first = *src.get(*pos).ok_or(CodecError::Truncated)?;
    *pos += 1;
    let sign = first & SIGN != 0;
    let mut u = (first & 0x3f) as u32;
    if first & EXTEND != 0 {
        for shift in [6u32, 13, 20, 27] {
            let b = *src.get(*pos).ok_or(CodecError::Truncated)?;
            *pos += 1;
            u |= ((b & 0x7f) as u32).wrapping_shl(shift);
            if b & EXTEND == 0 {
                break;
            }
            // a fifth continuation byte cannot carry i32 bits
            if shift == 27 {
                break;
            }
        }
    }
    let v = u as i32;
    Ok(if sign { !v } else { v })
}

/// Pack a 4-byte-aligned buffer of little-endian `i32`s into varints.
pub fn pack_ints(src: &[u8]) -> Result<Vec<u8>, CodecError> {
    if src.len() % 4 != 0 {
        return Err(CodecError::Misaligned(src.len()));
    }
    let mut out = Vec::with_capacity(src.len());
    for word in src.chunks_exact(4) {
        pack_int(i32::from_le_bytes([word[0], word[1], word[2], word[3]]), &mut out);
    }
    Ok(out)
}

/// Unpack a varint stream back into little-endian `i32` bytes.
///
/// The output is always a multiple of four bytes and never exceeds
/// `max_out`.
pub fn unpack_ints(src: &[u8], max_out: usize) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(src.len() * 2);
    let mut pos = 0;
    while pos < src.len() {
        let v = unpack_int(src, &mut pos)?;
        if out.len() + 4 > max_out {
            return Err(CodecError::TooLarge { max: max_out });
        }
        out.extend_from_slice(&v.to_le_bytes());
    }
    Ok(out)
}

/// Compress bytes with LZ4, prepending the uncompressed size.
///
/// The output is self-describing; [`decompress`] needs no size hint
/// beyond an upper bound.
pub fn compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

/// Decompress an LZ4 block produced by [`compress`].
pub fn decompress(data: &[u8], max_out: usize) -> Result<Vec<u8>, CodecError> {
    let out = lz4_flex::decompress_size_prepended(data)?;
    if out.len() > max_out {
        return Err(CodecError::TooLarge { max: max_out });
    }
    Ok(out)
}
