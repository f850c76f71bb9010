//! PGLZ decompression (spec §4.B), reimplemented from the control-byte
//! scheme in `original_source/decode.c`'s `pglz_decompress`: each control
//! byte governs the next eight items, bit=0 copies one literal, bit=1 reads
//! a two-byte match tag (with an optional length-extension byte) and copies
//! `len` bytes from `dst.len() - off` forward, doubling `off` while it is
//! still shorter than the remaining copy to handle overlapping runs.

use crate::error::DecodeError;

/// Decompress `src` into a freshly allocated buffer of exactly `raw_size`
/// bytes. Returns [`DecodeError::DecompressionFailed`] on a corrupt control
/// stream (zero offset, or running past the end of `src`) -- this check is
/// what prevents the overlap-copy loop below from spinning forever.
pub fn decompress(src: &[u8], raw_size: usize) -> Result<Vec<u8>, DecodeError> {
    let mut dst = Vec::with_capacity(raw_size);
    let mut sp = 0usize;

    while sp < src.len() && dst.len() < raw_size {
        let ctrl = src[sp];
        sp += 1;

        for bit in 0..8 {
            if dst.len() >= raw_size || sp >= src.len() {
                break;
            }
            if (ctrl >> bit) & 1 == 1 {
                if sp + 1 >= src.len() {
                    return Err(DecodeError::DecompressionFailed { reason: "match tag ran past end of input" });
                }
                let b0 = src[sp];
                let b1 = src[sp + 1];
                sp += 2;
                let mut len = ((b0 & 0x0f) as usize) + 3;
                let off = (((b0 & 0xf0) as usize) << 4) | b1 as usize;

                if len == 18 {
                    if sp >= src.len() {
                        return Err(DecodeError::DecompressionFailed { reason: "match length extension byte missing" });
                    }
                    len += src[sp] as usize;
                    sp += 1;
                }

                if off == 0 {
                    return Err(DecodeError::DecompressionFailed { reason: "corrupt match tag: zero offset" });
                }
                if off > dst.len() {
                    return Err(DecodeError::DecompressionFailed { reason: "match offset precedes start of output" });
                }

                len = len.min(raw_size - dst.len());
                let mut remaining = len;
                let mut copy_off = off;
                while copy_off < remaining {
                    let start = dst.len() - copy_off;
                    let chunk: Vec<u8> = dst[start..start + copy_off].to_vec();
                    dst.extend_from_slice(&chunk);
                    remaining -= copy_off;
                    copy_off += copy_off;
                }
                let start = dst.len() - copy_off;
                for i in 0..remaining {
                    let b = dst[start + i];
                    dst.push(b);
                }
            } else {
                dst.push(src[sp]);
                sp += 1;
            }
        }
    }

    if dst.len() != raw_size {
        return Err(DecodeError::DecompressionFailed { reason: "decompressed size did not match declared raw size" });
    }
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-assemble a PGLZ stream for "AAAAAAAAAA" (10 literal 'A's
    /// compressed as 3 literals then a match of length 7 at offset 1).
    #[test]
    fn decompress_simple_repeat() {
        let mut src = Vec::new();
        // control byte: bits 0,1,2 literal, bit 3 match, rest unused (0)
        src.push(0b0000_1000);
        src.push(b'A');
        src.push(b'A');
        src.push(b'A');
        // match: len=7 -> low nibble = 7-3=4, offset=1 -> high nibble 0, second byte 1
        src.push(0x04);
        src.push(0x01);

        let out = decompress(&src, 10).unwrap();
        assert_eq!(out, b"AAAAAAAAAA");
    }

    #[test]
    fn zero_offset_is_corrupt() {
        let src = vec![0b0000_0001u8, 0x00, 0x00];
        let err = decompress(&src, 5).unwrap_err();
        assert!(matches!(err, DecodeError::DecompressionFailed { .. }));
    }

    #[test]
    fn literal_only_stream() {
        let mut src = vec![0u8]; // control byte: all literals
        src.extend_from_slice(b"hello!!!");
        let out = decompress(&src, 8).unwrap();
        assert_eq!(out, b"hello!!!");
    }
}
