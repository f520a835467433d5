pub mod block_buffer;
pub mod brotli_constants;
pub mod brotli_convert;
pub mod brotli_meta;
pub mod context_map;
pub mod context_span;
pub mod deflate_constants;
pub mod distance_ring;
pub mod insert_copy;
pub mod prefix_list;
pub mod zlib_convert;
pub mod zlib_util;

#[macro_use]
extern crate static_assertions;

use thiserror::Error;

pub use crate::brotli_convert::BrotliCvt;
pub use crate::zlib_convert::ZlibCvt;

/*
 * Failure side of every fallible engine operation.  The numeric codes are
 * stable and shared with non-Rust consumers of the byte formats, so each
 * variant keeps its historical value (see `ApiError::code`).
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ApiError {
    /* An expected insert-copy code is missing */
    #[error("no insert-copy table row matches the requested lengths")]
    InsCopyMissing,
    /* Expecting a zlib dictionary */
    #[error("input zlib stream requests an external dictionary")]
    ZlibDictionary,
    /* Block buffer may overflow */
    #[error("intermediate command would overflow a block boundary")]
    BlockOverflow,
    /* Array index out of range */
    #[error("array index out of range")]
    OutOfRange,
    /* Numeric overflow produced by a distance code conversion */
    #[error("distance code conversion overflowed")]
    RingDistOverflow,
    /* Negative or zero distance produced by a distance code conversion */
    #[error("distance code conversion produced a non-positive distance")]
    RingDistUnderflow,
    /* Prefix code lengths of same bit count were too numerous */
    #[error("prefix code lengths of one bit count were too numerous")]
    FixCodeAlloc,
    /* Prefix code lengths were too large */
    #[error("prefix code lengths were out of range")]
    FixLenRange,
    /* Error occurred, not sure how to describe it */
    #[error("unknown error")]
    Unknown,
    /* Invalid parameter given */
    #[error("invalid parameter")]
    Param,
    /* Stream sanity check failed */
    #[error("stream sanity check failed")]
    Sanitize,
    /* Memory acquisition error */
    #[error("memory acquisition failed")]
    Memory,
    /* Initialization error */
    #[error("initialization failed")]
    Init,
}

impl ApiError {
    /*
     * Historical numeric value of this error, always negative.
     */
    pub fn code(self) -> i32 {
        match self {
            ApiError::InsCopyMissing => -13,
            ApiError::ZlibDictionary => -12,
            ApiError::BlockOverflow => -11,
            ApiError::OutOfRange => -10,
            ApiError::RingDistOverflow => -9,
            ApiError::RingDistUnderflow => -8,
            ApiError::FixCodeAlloc => -7,
            ApiError::FixLenRange => -6,
            ApiError::Unknown => -5,
            ApiError::Param => -4,
            ApiError::Sanitize => -3,
            ApiError::Memory => -2,
            ApiError::Init => -1,
        }
    }
}

/*
 * Success side of every engine operation.  `Partial` means the caller must
 * re-invoke with fresh buffer space; every suspended state resumes at the
 * exact bit boundary it stopped at.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Success,
    EndOfFile,
    Partial,
}

impl Progress {
    pub fn code(self) -> i32 {
        match self {
            Progress::Success => 0,
            Progress::EndOfFile => 1,
            Progress::Partial => 2,
        }
    }
}

pub type ApiResult = Result<Progress, ApiError>;

/*
 * Map a numeric status code (positive or negative) to a one-line
 * description.  `None` for codes outside the table.
 */
pub fn error_to_str(code: i32) -> Option<&'static str> {
    match code {
        -13 => Some("no insert-copy table row matches the requested lengths"),
        -12 => Some("input zlib stream requests an external dictionary"),
        -11 => Some("intermediate command would overflow a block boundary"),
        -10 => Some("array index out of range"),
        -9 => Some("distance code conversion overflowed"),
        -8 => Some("distance code conversion produced a non-positive distance"),
        -7 => Some("prefix code lengths of one bit count were too numerous"),
        -6 => Some("prefix code lengths were out of range"),
        -5 => Some("unknown error"),
        -4 => Some("invalid parameter"),
        -3 => Some("stream sanity check failed"),
        -2 => Some("memory acquisition failed"),
        -1 => Some("initialization failed"),
        0 => Some("success"),
        1 => Some("end of stream"),
        2 => Some("partial output"),
        _ => None,
    }
}

#[macro_export]
macro_rules! sanitize_check {
    ($cond:expr) => {
        if !$cond {
            return Err($crate::ApiError::Sanitize);
        }
    };
}

/*
 * One-shot drivers.  These loop the incremental entry points over a small
 * staging buffer, which doubles as a continuous exercise of the `Partial`
 * suspension contract.
 */

const DRIVER_CHUNK: usize = 1024;

type StepFn<S> = fn(&mut S, &[u8], &mut usize, &mut [u8], &mut usize) -> ApiResult;
type FinishFn<S> = fn(&mut S, &mut [u8], &mut usize) -> ApiResult;

fn drain_decode<S>(state: &mut S, src: &[u8], step: StepFn<S>) -> Result<Vec<u8>, ApiError> {
    let mut out = Vec::new();
    let mut buf = [0u8; DRIVER_CHUNK];
    let mut src_pos = 0usize;
    loop {
        let mut dst_pos = 0usize;
        let pr = step(state, src, &mut src_pos, &mut buf, &mut dst_pos)?;
        out.extend_from_slice(&buf[..dst_pos]);
        match pr {
            Progress::EndOfFile => return Ok(out),
            Progress::Partial => continue,
            Progress::Success => {
                if src_pos >= src.len() && dst_pos == 0 {
                    /* stream ended without its terminator */
                    return Err(ApiError::Sanitize);
                }
            }
        }
    }
}

fn drain_encode<S>(
    state: &mut S,
    src: &[u8],
    step: StepFn<S>,
    finish: FinishFn<S>,
) -> Result<Vec<u8>, ApiError> {
    let mut out = Vec::new();
    let mut buf = [0u8; DRIVER_CHUNK];
    let mut src_pos = 0usize;
    loop {
        let mut dst_pos = 0usize;
        let pr = step(state, src, &mut src_pos, &mut buf, &mut dst_pos)?;
        out.extend_from_slice(&buf[..dst_pos]);
        match pr {
            Progress::Partial if src_pos >= src.len() => break,
            Progress::EndOfFile => break,
            _ => continue,
        }
    }
    loop {
        let mut dst_pos = 0usize;
        let pr = finish(state, &mut buf, &mut dst_pos)?;
        out.extend_from_slice(&buf[..dst_pos]);
        if pr == Progress::EndOfFile {
            return Ok(out);
        }
    }
}

/* Compress a byte slice into a zlib stream. */
pub fn zlib_encode(data: &[u8]) -> Result<Vec<u8>, ApiError> {
    let mut state = ZlibCvt::new(4096, 32768, 256);
    drain_encode(&mut state, data, ZlibCvt::convert_out, ZlibCvt::unshift)
}

/* Decompress a zlib stream into a byte vector. */
pub fn zlib_decode(data: &[u8]) -> Result<Vec<u8>, ApiError> {
    let mut state = ZlibCvt::new(4096, 32768, 256);
    drain_decode(&mut state, data, ZlibCvt::convert_in)
}

/* Compress a byte slice into a Brotli stream. */
pub fn brotli_encode(data: &[u8]) -> Result<Vec<u8>, ApiError> {
    let mut state = BrotliCvt::new(4096, 65536, 256);
    drain_encode(&mut state, data, BrotliCvt::convert_out, BrotliCvt::unshift)
}

/* Decompress a Brotli stream into a byte vector. */
pub fn brotli_decode(data: &[u8]) -> Result<Vec<u8>, ApiError> {
    let mut state = BrotliCvt::new(4096, 65536, 256);
    drain_decode(&mut state, data, BrotliCvt::convert_in)
}

/* Transcode a zlib stream into a Brotli stream. */
pub fn zlib_to_brotli(data: &[u8]) -> Result<Vec<u8>, ApiError> {
    brotli_encode(&zlib_decode(data)?)
}

/* Transcode a Brotli stream into a zlib stream. */
pub fn brotli_to_zlib(data: &[u8]) -> Result<Vec<u8>, ApiError> {
    zlib_encode(&brotli_decode(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(ApiError::InsCopyMissing.code(), -13);
        assert_eq!(ApiError::Sanitize.code(), -3);
        assert_eq!(Progress::Partial.code(), 2);
        for code in -13..=2 {
            assert!(error_to_str(code).is_some(), "code {} undescribed", code);
        }
        assert!(error_to_str(3).is_none());
        assert!(error_to_str(-14).is_none());
    }

    #[test]
    fn transcode_both_ways() {
        let text: Vec<u8> = b"the quick brown fox jumps over the lazy dog, \
            and the quick brown fox jumps over the lazy dog again. "
            .iter()
            .cycle()
            .take(4000)
            .copied()
            .collect();
        let z = zlib_encode(&text).unwrap();
        let b = zlib_to_brotli(&z).unwrap();
        assert_eq!(brotli_decode(&b).unwrap(), text);
        let z2 = brotli_to_zlib(&b).unwrap();
        assert_eq!(zlib_decode(&z2).unwrap(), text);
    }

    #[test]
    fn separate_states_on_separate_threads() {
        use rayon::prelude::*;
        let payloads: Vec<Vec<u8>> = (0u8..16)
            .map(|seed| (0..2048u32).map(|i| (i as u8).wrapping_mul(seed)).collect())
            .collect();
        payloads.par_iter().for_each(|data| {
            let z = zlib_encode(data).unwrap();
            assert_eq!(zlib_decode(&z).unwrap(), *data);
            let b = brotli_encode(data).unwrap();
            assert_eq!(brotli_decode(&b).unwrap(), *data);
        });
    }
}
