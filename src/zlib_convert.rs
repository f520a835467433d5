use crate::block_buffer::{commands, BlockBuffer, BlockString, Command};
use crate::deflate_constants::*;
use crate::distance_ring::DistanceRing;
use crate::insert_copy::{InsertCopyPreset, InsertCopyTable, InsertCopyType};
use crate::prefix_list::{PrefixHistogram, PrefixList, NOT_FOUND};
use crate::zlib_util::adler32;
use crate::{ApiError, ApiResult, Progress};
use nightly_quirks::branch_pred::unlikely;

/*
 * The zlib/DEFLATE conversion state machine.  One instance drives one
 * direction: `convert_in` decodes a zlib stream into plain bytes,
 * `convert_out` (with `unshift` as the epilogue) encodes plain bytes into
 * a zlib stream.  Both run bit-at-a-time and may suspend at any substate
 * with `Progress::Partial`.
 */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ZState {
    /* zlib CMF/FLG header */
    Header,
    /* four-byte dictionary Adler-32 */
    DictChecksum,
    /* caller-supplied dictionary must match the stream's checksum */
    DictVerify,
    /* three-bit BFINAL/BTYPE header; encode-side block builder */
    BlockStart,
    /* stored-block LEN/NLEN */
    StoredLen,
    /* stored-block payload */
    StoredBytes,
    /* trailing Adler-32 */
    Trailer,
    Done,
    /* literal/length code */
    Huffman,
    /* extra bits of a copy length */
    CopyExtra,
    /* distance code */
    Distance,
    /* extra bits of a distance */
    DistanceExtra,
    /* emit a pending copy through the sliding window (decode only) */
    CopyRun,
    /* HLIT/HDIST/HCLEN */
    DynHeader,
    /* code lengths of the code-length code */
    DynCodeLens,
    /* literal and distance length sequence */
    DynSequence,
    /* repeat previous length 3..6 times */
    RepeatPrev,
    /* repeat zero 3..10 times */
    RepeatZeroShort,
    /* repeat zero 11..138 times */
    RepeatZeroLong,
    /* materialise the literal/distance code tables */
    GenTrees,
    /* literal payload of an insert command; decode-side byte re-emit */
    LitPayload,
}

pub struct ZlibCvt {
    buffer: BlockBuffer,
    literals: PrefixList,
    distances: PrefixList,
    sequence: PrefixList,
    values: InsertCopyTable,
    ring: DistanceRing,
    try_ring: DistanceRing,
    lit_histogram: PrefixHistogram,
    dist_histogram: PrefixHistogram,
    seq_histogram: PrefixHistogram,
    sequence_list: BlockString,
    bits: u32,
    extra_length: u16,
    h_end: u8,
    bit_length: u16,
    state: ZState,
    bit_index: u8,
    backward: u32,
    count: u32,
    index: u32,
    checksum: u32,
    bit_cap: u32,
    write_scratch: u8,
    values_length_sorted: bool,
}

fn zlib_cinfo(window_size: u32) -> u32 {
    if window_size > 32768 {
        return 8;
    }
    let mut out = 0;
    let mut v = 1u32;
    while v < window_size {
        v <<= 1;
        out += 1;
    }
    out.max(8) - 8
}

/*
 * Feed one bit of a prefix code; `Some(value)` once a code completes.
 * Codes are Kraft-bounded at fifteen bits.
 */
fn code_step(
    list: &PrefixList,
    bits: &mut u32,
    bit_length: &mut u16,
    x: u32,
) -> Result<Option<u32>, ApiError> {
    *bits = (*bits << 1) | x;
    let j = list.codebsearch(*bit_length + 1, *bits as u16);
    if j != NOT_FOUND {
        let value = list[j].value;
        *bits = 0;
        *bit_length = 0;
        return Ok(Some(value));
    }
    *bit_length += 1;
    if unlikely(*bit_length >= 15) {
        return Err(ApiError::Sanitize);
    }
    Ok(None)
}

impl ZlibCvt {
    /*
     * `block_size` bounds the bytes gathered into one DEFLATE block
     * (stored blocks cap it at 65535); `n` is the sliding window extent;
     * `chain_length` bounds the match search.
     */
    pub fn new(block_size: u32, n: u32, chain_length: usize) -> ZlibCvt {
        let mut values = InsertCopyTable::preset(InsertCopyPreset::Deflate);
        values.codesort();
        let mut sequence_list = Vec::new();
        sequence_list.reserve(286 + 30);
        ZlibCvt {
            buffer: BlockBuffer::new(block_size.min(65535), n, chain_length, false),
            literals: PrefixList::new(DEFLATE_NUM_LITLEN_SYMS),
            distances: PrefixList::new(DEFLATE_NUM_OFFSET_SYMS),
            sequence: PrefixList::new(DEFLATE_NUM_PRECODE_SYMS),
            values,
            ring: DistanceRing::new(false, 4, 0).unwrap(),
            try_ring: DistanceRing::new(false, 4, 0).unwrap(),
            lit_histogram: vec![0; DEFLATE_NUM_LITLEN_SYMS],
            dist_histogram: vec![0; DEFLATE_NUM_OFFSET_SYMS],
            seq_histogram: vec![0; DEFLATE_NUM_PRECODE_SYMS],
            sequence_list,
            bits: 0,
            extra_length: 0,
            h_end: 0,
            bit_length: 0,
            state: ZState::Header,
            bit_index: 0,
            backward: 0,
            count: 0,
            index: 0,
            checksum: 1,
            bit_cap: 0,
            write_scratch: 0,
            values_length_sorted: false,
        }
    }

    /*
     * Running Adler-32.  After `ApiError::ZlibDictionary` this holds the
     * checksum of the dictionary the stream expects.
     */
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn buffer(&self) -> &BlockBuffer {
        &self.buffer
    }

    /*
     * Push dictionary bytes into the sliding window without running the
     * state machine.  Legal until the first block begins.
     */
    pub fn bypass(&mut self, buf: &[u8]) -> Result<usize, ApiError> {
        match self.state {
            ZState::Header => {
                let n = self.buffer.bypass(buf);
                self.checksum = adler32(self.checksum, buf);
                Ok(n)
            }
            ZState::DictChecksum | ZState::DictVerify => {
                let n = self.buffer.bypass(buf);
                self.backward = adler32(self.backward, buf);
                Ok(n)
            }
            _ => Err(ApiError::Sanitize),
        }
    }

    /*
     * Decode: zlib stream in, plain bytes out.  `src_pos`/`dst_pos` are
     * advanced past the consumed and produced bytes.
     */
    pub fn convert_in(
        &mut self,
        src: &[u8],
        src_pos: &mut usize,
        dst: &mut [u8],
        dst_pos: &mut usize,
    ) -> ApiResult {
        let mut result = Ok(Progress::Success);
        while *src_pos < src.len() {
            if self.state == ZState::Done {
                result = Ok(Progress::EndOfFile);
                break;
            }
            let byte = src[*src_pos];
            if self.state == ZState::StoredBytes && self.count >= self.backward {
                /* zero-length stored block: this byte is the next state's */
                self.state = if self.h_end != 0 {
                    ZState::Trailer
                } else {
                    ZState::BlockStart
                };
                self.count = 0;
                self.backward = 0;
                continue;
            }
            let step = match self.state {
                ZState::Header => self.in_header(byte),
                ZState::DictChecksum => self.in_dict_checksum(byte),
                ZState::StoredLen => self.in_stored_len(byte),
                ZState::StoredBytes => self.in_stored_byte(byte, dst, dst_pos),
                ZState::Trailer => self.in_trailer(byte),
                ZState::DictVerify => {
                    if self.backward != self.checksum {
                        Err(ApiError::Sanitize)
                    } else {
                        self.state = ZState::BlockStart;
                        self.count = 0;
                        self.bits = 0;
                        self.checksum = 1;
                        self.in_bits(byte, dst, dst_pos)
                    }
                }
                _ => self.in_bits(byte, dst, dst_pos),
            };
            match step {
                Ok(Progress::Success) => *src_pos += 1,
                Ok(Progress::Partial) => {
                    result = Ok(Progress::Partial);
                    break;
                }
                Ok(Progress::EndOfFile) => {
                    *src_pos += 1;
                    result = Ok(Progress::EndOfFile);
                    break;
                }
                Err(e) => {
                    *src_pos += 1;
                    result = Err(e);
                    break;
                }
            }
        }
        result
    }

    fn in_header(&mut self, byte: u8) -> ApiResult {
        if self.count < 2 {
            self.backward = (self.backward << 8) | byte as u32;
            self.count += 1;
        }
        if self.count >= 2 {
            let cm = (self.backward >> 8) & 15;
            let cinfo = (self.backward >> 12) & 15;
            if self.backward % 31 != 0 || cm != 8 || cinfo > 7 {
                log::warn!("rejecting zlib header {:#06x}", self.backward);
                return Err(ApiError::Sanitize);
            }
            if self.backward & 0x20 != 0 {
                self.state = ZState::DictChecksum;
                self.count = 0;
                /* keep the caller's dictionary checksum for the verify */
                self.backward = self.checksum;
                self.checksum = 0;
            } else {
                self.state = ZState::BlockStart;
                self.count = 0;
                self.bits = 0;
                self.backward = 0;
                self.checksum = 1;
            }
        }
        Ok(Progress::Success)
    }

    fn in_dict_checksum(&mut self, byte: u8) -> ApiResult {
        if self.count < 4 {
            self.checksum = (self.checksum << 8) | byte as u32;
            self.count += 1;
        }
        if self.count >= 4 {
            self.state = ZState::DictVerify;
            self.count = 0;
            return Err(ApiError::ZlibDictionary);
        }
        Ok(Progress::Success)
    }

    fn in_stored_len(&mut self, byte: u8) -> ApiResult {
        if self.count < 4 {
            self.backward |= (byte as u32) << (self.count * 8);
            self.count += 1;
        }
        if self.count >= 4 {
            let len = self.backward & 0xFFFF;
            let nlen = (!self.backward >> 16) & 0xFFFF;
            crate::sanitize_check!(len == nlen);
            self.backward = len;
            self.state = ZState::StoredBytes;
            self.count = 0;
        }
        Ok(Progress::Success)
    }

    fn in_stored_byte(&mut self, byte: u8, dst: &mut [u8], dst_pos: &mut usize) -> ApiResult {
        if self.count < self.backward {
            if *dst_pos >= dst.len() {
                return Ok(Progress::Partial);
            }
            self.emit(byte, dst, dst_pos)?;
            self.count += 1;
        }
        if self.count >= self.backward {
            self.state = if self.h_end != 0 {
                ZState::Trailer
            } else {
                ZState::BlockStart
            };
            self.count = 0;
            self.backward = 0;
        }
        Ok(Progress::Success)
    }

    fn in_trailer(&mut self, byte: u8) -> ApiResult {
        if self.count < 4 {
            self.backward = (self.backward << 8) | byte as u32;
            self.count += 1;
        }
        if self.count >= 4 {
            if self.checksum != self.backward {
                log::warn!(
                    "zlib checksum mismatch: computed {:#010x}, stream has {:#010x}",
                    self.checksum,
                    self.backward
                );
                return Err(ApiError::Sanitize);
            }
            self.state = ZState::Done;
            return Ok(Progress::EndOfFile);
        }
        Ok(Progress::Success)
    }

    /* Write one decoded byte: destination, checksum, sliding window. */
    fn emit(&mut self, byte: u8, dst: &mut [u8], dst_pos: &mut usize) -> Result<(), ApiError> {
        dst[*dst_pos] = byte;
        self.checksum = adler32(self.checksum, &[byte]);
        *dst_pos += 1;
        self.buffer.bypass(&[byte]);
        Ok(())
    }

    /* Decode-side bit pump over one input byte. */
    fn in_bits(&mut self, y: u8, dst: &mut [u8], dst_pos: &mut usize) -> ApiResult {
        let mut i = self.bit_index as u32;
        let mut result = Ok(Progress::Success);
        while i < 8 {
            let x = ((y >> i) & 1) as u32;
            match self.in_bit_step(x, dst, dst_pos) {
                Ok(Progress::Success) => i += 1,
                other => {
                    result = other;
                    break;
                }
            }
        }
        self.bit_index = (i & 7) as u8;
        result
    }

    /*
     * Process one input bit.  States that need no bit run in the same
     * step via `loop`, mirroring the fallthrough chains of a hand-rolled
     * switch; a bit is consumed exactly once.
     */
    fn in_bit_step(&mut self, x: u32, dst: &mut [u8], dst_pos: &mut usize) -> ApiResult {
        loop {
            match self.state {
                ZState::BlockStart => {
                    if self.count < 3 {
                        self.bits |= x << self.count;
                        self.count += 1;
                    }
                    if self.count >= 3 {
                        let end = self.bits & 1;
                        let btype = (self.bits >> 1) & 3;
                        if btype == 3 {
                            return Err(ApiError::Sanitize);
                        }
                        self.h_end = end as u8;
                        match btype {
                            DEFLATE_BLOCKTYPE_UNCOMPRESSED => self.state = ZState::StoredLen,
                            DEFLATE_BLOCKTYPE_STATIC_HUFFMAN => {
                                self.load_static_tables()?;
                                self.state = ZState::Huffman;
                            }
                            _ => self.state = ZState::DynHeader,
                        }
                        self.count = 0;
                        self.bits = 0;
                        self.backward = 0;
                        self.bit_length = 0;
                    }
                    return Ok(Progress::Success);
                }
                /* byte-aligned states swallow the padding bits */
                ZState::StoredLen | ZState::Trailer => return Ok(Progress::Success),
                ZState::GenTrees => {
                    self.literals.gen_codes()?;
                    self.literals.codesort();
                    self.distances.gen_codes()?;
                    self.distances.codesort();
                    self.state = ZState::Huffman;
                    continue;
                }
                ZState::Huffman => {
                    let decoded =
                        code_step(&self.literals, &mut self.bits, &mut self.bit_length, x)?;
                    let alpha = match decoded {
                        Some(v) => v,
                        None => return Ok(Progress::Success),
                    };
                    /* the reserved codes 286 and 287 never carry data */
                    if alpha as usize >= self.values.size() {
                        return Err(ApiError::Sanitize);
                    }
                    let row = self.values[alpha as usize];
                    self.backward = 0;
                    match row.ty {
                        InsertCopyType::Stop => {
                            self.state = if self.h_end != 0 {
                                ZState::Trailer
                            } else {
                                ZState::BlockStart
                            };
                            self.count = 0;
                        }
                        InsertCopyType::Literal => {
                            if *dst_pos < dst.len() {
                                self.emit(alpha as u8, dst, dst_pos)?;
                            } else {
                                self.state = ZState::LitPayload;
                                self.bits = alpha;
                                return Ok(Progress::Partial);
                            }
                        }
                        InsertCopyType::Copy | InsertCopyType::CopyMinus1 => {
                            self.count = row.copy_first as u32;
                            if row.copy_bits > 0 {
                                self.extra_length = row.copy_bits as u16;
                                self.state = ZState::CopyExtra;
                            } else {
                                self.state = ZState::Distance;
                            }
                        }
                        _ => return Err(ApiError::Sanitize),
                    }
                    return Ok(Progress::Success);
                }
                ZState::LitPayload => {
                    /* the byte that found no room in the last call */
                    if *dst_pos >= dst.len() {
                        return Ok(Progress::Partial);
                    }
                    let byte = self.bits as u8;
                    self.emit(byte, dst, dst_pos)?;
                    self.state = ZState::Huffman;
                    self.bits = 0;
                    self.bit_length = 0;
                    self.backward = 0;
                    return Ok(Progress::Success);
                }
                ZState::CopyExtra => {
                    if self.bit_length < self.extra_length {
                        self.bits |= x << self.bit_length;
                        self.bit_length += 1;
                    }
                    if self.bit_length >= self.extra_length {
                        self.count += self.bits;
                        self.bits = 0;
                        self.bit_length = 0;
                        self.state = ZState::Distance;
                    }
                    return Ok(Progress::Success);
                }
                ZState::Distance => {
                    let decoded =
                        code_step(&self.distances, &mut self.bits, &mut self.bit_length, x)?;
                    let alpha = match decoded {
                        Some(v) => v,
                        None => return Ok(Progress::Success),
                    };
                    let extra = self.ring.bit_count(alpha);
                    self.index = 0;
                    if extra > 0 {
                        self.extra_length = extra as u16;
                        self.backward = alpha;
                        self.state = ZState::DistanceExtra;
                        return Ok(Progress::Success);
                    }
                    self.backward = self.ring.decode(alpha, 0)? - 1;
                    self.state = ZState::CopyRun;
                    continue;
                }
                ZState::DistanceExtra => {
                    if self.bit_length < self.extra_length {
                        self.bits |= x << self.bit_length;
                        self.bit_length += 1;
                    }
                    if self.bit_length < self.extra_length {
                        return Ok(Progress::Success);
                    }
                    self.backward = self.ring.decode(self.backward, self.bits)? - 1;
                    self.bits = 0;
                    self.bit_length = 0;
                    self.index = 0;
                    self.state = ZState::CopyRun;
                    continue;
                }
                ZState::CopyRun => {
                    while self.index < self.count && *dst_pos < dst.len() {
                        let byte = match self.buffer.peek(self.backward) {
                            Ok(b) => b,
                            Err(_) => return Err(ApiError::Sanitize),
                        };
                        self.emit(byte, dst, dst_pos)?;
                        self.index += 1;
                    }
                    if self.index >= self.count {
                        self.state = ZState::Huffman;
                        self.bits = 0;
                        self.bit_length = 0;
                        self.count = 0;
                        return Ok(Progress::Success);
                    }
                    return Ok(Progress::Partial);
                }
                ZState::DynHeader => {
                    if self.bit_length < 14 {
                        self.bits |= x << self.bit_length;
                        self.bit_length += 1;
                    }
                    if self.bit_length >= 14 {
                        let hclen = ((self.bits >> 10) & 15) + 4;
                        self.backward = self.bits & 1023;
                        self.bits = 0;
                        self.bit_length = 0;
                        self.count = hclen;
                        self.index = 0;
                        self.state = ZState::DynCodeLens;
                        self.sequence.resize(DEFLATE_NUM_PRECODE_SYMS);
                        self.sequence.identity_values();
                        self.sequence.clear_lens();
                    }
                    return Ok(Progress::Success);
                }
                ZState::DynCodeLens => {
                    if self.bit_length < 3 {
                        self.bits |= x << self.bit_length;
                        self.bit_length += 1;
                    }
                    if self.bit_length >= 3 {
                        let slot = DEFLATE_PRECODE_LENS_PERMUTATION[self.index as usize];
                        self.sequence[slot as usize].len = (self.bits & 7) as u16;
                        self.index += 1;
                        self.bits = 0;
                        self.bit_length = 0;
                    }
                    if self.index >= self.count {
                        self.index = 0;
                        self.state = ZState::DynSequence;
                        self.count = (self.backward & 31) + 257;
                        self.backward = ((self.backward >> 5) & 31) + 1 + self.count;
                        self.extra_length = 0;
                        self.literals.identity_values();
                        self.literals.clear_lens();
                        self.distances.identity_values();
                        self.distances.clear_lens();
                        self.sequence.gen_codes()?;
                        self.sequence.codesort();
                    }
                    return Ok(Progress::Success);
                }
                ZState::DynSequence => {
                    let decoded =
                        code_step(&self.sequence, &mut self.bits, &mut self.bit_length, x)?;
                    if let Some(alpha) = decoded {
                        if alpha <= 15 {
                            self.assign_length(alpha as u16);
                            self.extra_length = alpha as u16;
                            self.index += 1;
                        } else {
                            self.state = match alpha {
                                16 => ZState::RepeatPrev,
                                17 => ZState::RepeatZeroShort,
                                _ => ZState::RepeatZeroLong,
                            };
                        }
                    }
                    if self.index >= self.backward {
                        self.state = ZState::GenTrees;
                        self.count = 0;
                        self.index = 0;
                        self.backward = 0;
                        self.extra_length = 0;
                    }
                    return Ok(Progress::Success);
                }
                ZState::RepeatPrev | ZState::RepeatZeroShort | ZState::RepeatZeroLong => {
                    let (width, base, value) = match self.state {
                        ZState::RepeatPrev => (2, 3, self.extra_length),
                        ZState::RepeatZeroShort => (3, 3, 0),
                        _ => (7, 11, 0),
                    };
                    if self.bit_length < width {
                        self.bits |= x << self.bit_length;
                        self.bit_length += 1;
                    }
                    if self.bit_length >= width {
                        let n = self.bits + base;
                        let mut placed = 0;
                        while placed < n && self.index < self.backward {
                            self.assign_length(value);
                            self.index += 1;
                            placed += 1;
                        }
                        if self.state != ZState::RepeatPrev {
                            self.extra_length = 0;
                        }
                        if placed < n {
                            return Err(ApiError::Sanitize);
                        }
                        self.state = if self.index >= self.backward {
                            ZState::GenTrees
                        } else {
                            ZState::DynSequence
                        };
                        self.bits = 0;
                        self.bit_length = 0;
                    }
                    return Ok(Progress::Success);
                }
                /* Header, dictionary, stored payload and the trailer are
                 * byte-aligned and never reach the bit pump. */
                _ => return Err(ApiError::Unknown),
            }
        }
    }

    fn assign_length(&mut self, len: u16) {
        if self.index >= self.count {
            self.distances[(self.index - self.count) as usize].len = len;
        } else {
            self.literals[self.index as usize].len = len;
        }
    }

    fn load_static_tables(&mut self) -> Result<(), ApiError> {
        for i in 0..DEFLATE_NUM_LITLEN_SYMS {
            let line = &mut self.literals[i];
            line.value = i as u32;
            line.len = match i {
                0..=143 => 8,
                144..=255 => 9,
                256..=279 => 7,
                _ => 8,
            };
        }
        self.literals.gen_codes()?;
        self.literals.codesort();
        for i in 0..DEFLATE_NUM_OFFSET_SYMS {
            let line = &mut self.distances[i];
            line.code = i as u16;
            line.len = 5;
            line.value = i as u32;
        }
        Ok(())
    }

    /*
     * Encode: plain bytes in, zlib stream out.  Returns `Success` when
     * the destination fills, `Partial` when more input is needed to
     * finish a block, `EndOfFile` after the trailer.
     */
    pub fn convert_out(
        &mut self,
        src: &[u8],
        src_pos: &mut usize,
        dst: &mut [u8],
        dst_pos: &mut usize,
    ) -> ApiResult {
        let mut result = Ok(Progress::Success);
        while *dst_pos < dst.len() {
            if self.state == ZState::Done {
                result = Ok(Progress::EndOfFile);
                break;
            }
            let step = match self.state {
                ZState::Header => self.out_header(dst, dst_pos),
                ZState::DictChecksum => self.out_dict_checksum(dst, dst_pos),
                ZState::StoredLen => self.out_stored_len(dst, dst_pos),
                ZState::StoredBytes => self.out_stored_byte(dst, dst_pos),
                ZState::Trailer => self.out_trailer(dst, dst_pos),
                ZState::DictVerify => {
                    self.state = ZState::BlockStart;
                    self.out_bits(src, src_pos, dst, dst_pos)
                }
                _ => self.out_bits(src, src_pos, dst, dst_pos),
            };
            match step {
                Ok(Progress::Success) => {}
                other => {
                    result = other;
                    break;
                }
            }
        }
        result
    }

    /* Finish the stream: flush pending input, then the trailer. */
    pub fn unshift(&mut self, dst: &mut [u8], dst_pos: &mut usize) -> ApiResult {
        self.h_end |= 2;
        let src: [u8; 0] = [];
        let mut src_pos = 0;
        self.convert_out(&src, &mut src_pos, dst, dst_pos)
    }

    fn out_header(&mut self, dst: &mut [u8], dst_pos: &mut usize) -> ApiResult {
        if self.count == 0 {
            self.ensure_length_sorted();
            let cinfo = zlib_cinfo(self.buffer.extent());
            if cinfo > 7 {
                return Err(ApiError::Sanitize);
            }
            let mut header = 0x0800u32 | (cinfo << 12);
            if self.buffer.ring_size() > 0 {
                header |= 0x20;
            }
            header += (31 - header % 31) % 31;
            self.backward = header;
        }
        if self.count < 2 {
            dst[*dst_pos] = (self.backward >> (8 - self.count * 8)) as u8;
            *dst_pos += 1;
            self.count += 1;
        }
        if self.count >= 2 {
            if self.backward & 0x20 != 0 {
                self.state = ZState::DictChecksum;
            } else {
                self.state = ZState::BlockStart;
                self.checksum = 1;
            }
            self.backward = 0;
            self.count = 0;
        }
        Ok(Progress::Success)
    }

    fn out_dict_checksum(&mut self, dst: &mut [u8], dst_pos: &mut usize) -> ApiResult {
        if self.count < 4 {
            dst[*dst_pos] = (self.checksum >> (24 - self.count * 8)) as u8;
            *dst_pos += 1;
            self.count += 1;
        }
        if self.count >= 4 {
            self.state = ZState::BlockStart;
            self.checksum = 1;
            self.count = 0;
        }
        Ok(Progress::Success)
    }

    fn out_stored_len(&mut self, dst: &mut [u8], dst_pos: &mut usize) -> ApiResult {
        if self.count == 0 {
            /* total insert payload of the serialized block */
            let mut total: u32 = 0;
            for cmd in commands(self.buffer.str()) {
                match cmd? {
                    Command::Insert(payload) => total += payload.len() as u32,
                    _ => return Err(ApiError::Sanitize),
                }
            }
            if total > 65535 {
                return Err(ApiError::BlockOverflow);
            }
            self.extra_length = total as u16;
            self.index = 0;
        }
        if self.count < 2 {
            dst[*dst_pos] = (self.extra_length >> (8 * self.count)) as u8;
            *dst_pos += 1;
            self.count += 1;
        } else if self.count < 4 {
            dst[*dst_pos] = !(self.extra_length >> (8 * (self.count - 2))) as u8;
            *dst_pos += 1;
            self.count += 1;
        }
        if self.count >= 4 {
            self.count = 0;
            if self.extra_length == 0 {
                self.noconv_next();
            } else {
                self.state = ZState::StoredBytes;
                self.backward = 0;
            }
        }
        Ok(Progress::Success)
    }

    fn out_stored_byte(&mut self, dst: &mut [u8], dst_pos: &mut usize) -> ApiResult {
        /* `backward` counts payload bytes left in the current command */
        if self.backward == 0 {
            let out = self.buffer.str();
            if self.index as usize >= out.len() {
                self.noconv_next();
                return Ok(Progress::Success);
            }
            let header = out[self.index as usize];
            if header & 0x80 != 0 {
                return Err(ApiError::Sanitize);
            }
            let len = if header & 0x40 != 0 {
                if self.index as usize + 1 >= out.len() {
                    return Err(ApiError::Sanitize);
                }
                self.index += 1;
                (((header & 0x3F) as u32) << 8) + out[self.index as usize] as u32 + 64
            } else {
                (header & 0x3F) as u32
            };
            self.index += 1;
            self.backward = len;
            if len == 0 {
                return Ok(Progress::Success);
            }
        }
        let out_len = self.buffer.str().len() as u32;
        if self.index >= out_len {
            return Err(ApiError::Sanitize);
        }
        dst[*dst_pos] = self.buffer.str()[self.index as usize];
        *dst_pos += 1;
        self.index += 1;
        self.backward -= 1;
        self.extra_length -= 1;
        if self.backward == 0 && self.extra_length == 0 {
            self.noconv_next();
        }
        Ok(Progress::Success)
    }

    fn noconv_next(&mut self) {
        if self.h_end & 1 != 0 {
            self.state = ZState::Trailer;
        } else {
            self.state = ZState::BlockStart;
            self.bits = 0;
        }
        self.count = 0;
        self.backward = 0;
    }

    fn out_trailer(&mut self, dst: &mut [u8], dst_pos: &mut usize) -> ApiResult {
        if self.count < 4 {
            dst[*dst_pos] = (self.checksum >> (24 - 8 * self.count)) as u8;
            *dst_pos += 1;
            self.count += 1;
        }
        if self.count >= 4 {
            self.state = ZState::Done;
            self.count = 0;
            return Ok(Progress::EndOfFile);
        }
        Ok(Progress::Success)
    }

    /* Encode-side bit pump; produces one complete output byte. */
    fn out_bits(
        &mut self,
        src: &[u8],
        src_pos: &mut usize,
        dst: &mut [u8],
        dst_pos: &mut usize,
    ) -> ApiResult {
        let mut y = self.write_scratch;
        self.write_scratch = 0;
        let mut i = self.bit_index as u32;
        let mut result = Ok(Progress::Success);
        while i < 8 {
            if self.h_end & 1 == 0 && self.state == ZState::BlockStart && self.count == 0 {
                let space = self.buffer.capacity() - self.buffer.input_size();
                let take = (space as usize).min(src.len() - *src_pos);
                if take > 0 {
                    self.buffer.write(&src[*src_pos..*src_pos + take])?;
                    self.checksum = adler32(self.checksum, &src[*src_pos..*src_pos + take]);
                    *src_pos += take;
                }
            }
            match self.out_bit_step() {
                Ok(x) => {
                    y |= (x as u8) << i;
                    i += 1;
                }
                Err(None) => {
                    /* needs more input: stash the partial byte */
                    self.write_scratch = y;
                    result = Ok(Progress::Partial);
                    break;
                }
                Err(Some(e)) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.bit_index = (i & 7) as u8;
        if i == 8 {
            dst[*dst_pos] = y;
            *dst_pos += 1;
        }
        result
    }

    /*
     * Produce one output bit.  `Err(None)` suspends for more input;
     * `Err(Some(_))` is a real failure.
     */
    fn out_bit_step(&mut self) -> Result<u32, Option<ApiError>> {
        loop {
            match self.state {
                ZState::BlockStart => {
                    if self.h_end & 2 != 0 {
                        self.h_end |= 1;
                    }
                    if self.count == 0 {
                        if self.buffer.input_size() == 0 && self.h_end == 0 {
                            return Err(None);
                        }
                        let dynamic = self.prepare_block().map_err(Some)?;
                        self.bits = (self.h_end & 1) as u32 | if dynamic { 4 } else { 0 };
                    }
                    let x = (self.bits >> self.count) & 1;
                    self.count += 1;
                    if self.count == 3 {
                        if self.bits & 6 != 0 {
                            self.state = ZState::DynHeader;
                            self.count = 0;
                            self.bit_length = 0;
                            self.bits = 0;
                        } else {
                            self.state = ZState::StoredLen;
                            self.index = 0;
                            self.count = 0;
                        }
                    }
                    return Ok(x);
                }
                /* byte-aligned states pad the current byte with zeros */
                ZState::StoredLen | ZState::Trailer => return Ok(0),
                ZState::DynHeader => {
                    if self.bit_length == 0 {
                        self.count = DEFLATE_NUM_PRECODE_SYMS as u32;
                        self.bits = (((self.count - 4) << 10)
                            | (((DEFLATE_NUM_USED_OFFSET_SYMS - 1) as u32) << 5))
                            | (DEFLATE_NUM_USED_LITLEN_SYMS as u32 - 257);
                    }
                    let x = (self.bits >> self.bit_length) & 1;
                    self.bit_length += 1;
                    if self.bit_length >= 14 {
                        self.backward = self.bits & 1023;
                        self.state = ZState::DynCodeLens;
                        self.index = 0;
                        self.bit_length = 0;
                        self.bits = 0;
                    }
                    return Ok(x);
                }
                ZState::DynCodeLens => {
                    if self.bit_length == 0 {
                        let slot = DEFLATE_PRECODE_LENS_PERMUTATION[self.index as usize];
                        self.bits = self.sequence[slot as usize].len as u32;
                    }
                    let x = (self.bits >> self.bit_length) & 1;
                    self.bit_length += 1;
                    if self.bit_length == 3 {
                        self.index += 1;
                        self.bit_length = 0;
                        self.bits = 0;
                    }
                    if self.index >= self.count {
                        self.state = ZState::DynSequence;
                        self.count = (self.backward & 31) + 257;
                        self.backward = ((self.backward >> 5) & 31) + 1 + self.count;
                        self.extra_length = 0;
                        self.index = 0;
                        self.bits = 0;
                        self.bit_length = 0;
                    }
                    return Ok(x);
                }
                ZState::DynSequence => {
                    if self.bit_length == 0 {
                        let alpha = self.sequence_list[self.index as usize] as usize;
                        let line = self.sequence[alpha];
                        self.bits = line.code as u32;
                        self.extra_length = line.len;
                    }
                    let x = (self.bits >> (self.extra_length - 1 - self.bit_length)) & 1;
                    self.bit_length += 1;
                    if self.bit_length >= self.extra_length {
                        let alpha = self.sequence_list[self.index as usize];
                        self.index += 1;
                        self.bit_length = 0;
                        if (16..=18).contains(&alpha) {
                            self.state = match alpha {
                                16 => ZState::RepeatPrev,
                                17 => ZState::RepeatZeroShort,
                                _ => ZState::RepeatZeroLong,
                            };
                        } else if self.index as usize >= self.sequence_list.len() {
                            self.state = ZState::GenTrees;
                        }
                    }
                    return Ok(x);
                }
                ZState::RepeatPrev | ZState::RepeatZeroShort | ZState::RepeatZeroLong => {
                    if self.bit_length == 0 {
                        self.extra_length = match self.state {
                            ZState::RepeatPrev => 2,
                            ZState::RepeatZeroShort => 3,
                            _ => 7,
                        };
                        self.bits = self.sequence_list[self.index as usize] as u32;
                    }
                    let x = (self.bits >> self.bit_length) & 1;
                    self.bit_length += 1;
                    if self.bit_length >= self.extra_length {
                        self.index += 1;
                        self.bit_length = 0;
                        self.state = if self.index as usize >= self.sequence_list.len() {
                            ZState::GenTrees
                        } else {
                            ZState::DynSequence
                        };
                    }
                    return Ok(x);
                }
                ZState::GenTrees => {
                    self.literals.gen_codes().map_err(Some)?;
                    self.distances.gen_codes().map_err(Some)?;
                    self.state = ZState::Huffman;
                    self.backward = self.buffer.str().len() as u32;
                    self.bit_length = 0;
                    self.index = 0;
                    continue;
                }
                ZState::Huffman => {
                    if self.bit_length == 0 {
                        if self.index >= self.backward {
                            let line = self.literals[256];
                            self.bit_cap = line.len as u32;
                            self.bits = line.code as u32;
                        } else if !self.load_command().map_err(Some)? {
                            /* switched to the literal payload */
                            continue;
                        }
                    }
                    let x = (self.bits >> (self.bit_cap - 1 - self.bit_length as u32)) & 1;
                    self.bit_length += 1;
                    if self.bit_length as u32 >= self.bit_cap {
                        if self.index >= self.backward {
                            /* stop code went out */
                            if self.h_end & 1 != 0 {
                                self.state = ZState::Trailer;
                            } else {
                                self.state = ZState::BlockStart;
                                self.bits = 0;
                            }
                            self.count = 0;
                        } else {
                            self.bit_length = 0;
                            self.state = if self.extra_length > 0 {
                                ZState::CopyExtra
                            } else {
                                ZState::Distance
                            };
                            self.index += 1;
                        }
                    }
                    return Ok(x);
                }
                ZState::LitPayload => {
                    if self.bit_length == 0 {
                        if self.index >= self.backward {
                            return Err(Some(ApiError::Sanitize));
                        }
                        let alpha = self.buffer.str()[self.index as usize] as usize;
                        let line = self.literals[alpha];
                        self.bit_cap = line.len as u32;
                        self.bits = line.code as u32;
                    }
                    let x = (self.bits >> (self.bit_cap - 1 - self.bit_length as u32)) & 1;
                    self.bit_length += 1;
                    if self.bit_length as u32 >= self.bit_cap {
                        self.index += 1;
                        self.count -= 1;
                        if self.count == 0 {
                            self.state = ZState::Huffman;
                        }
                        self.bit_length = 0;
                    }
                    return Ok(x);
                }
                ZState::CopyExtra => {
                    let x = (self.count >> self.bit_length) & 1;
                    self.bit_length += 1;
                    if self.bit_length >= self.extra_length {
                        self.state = ZState::Distance;
                        self.bit_length = 0;
                    }
                    return Ok(x);
                }
                ZState::Distance => {
                    if self.bit_length == 0 {
                        self.load_distance().map_err(Some)?;
                    }
                    let x = (self.bits >> (self.bit_cap - 1 - self.bit_length as u32)) & 1;
                    self.bit_length += 1;
                    if self.bit_length as u32 >= self.bit_cap {
                        self.bit_length = 0;
                        self.state = if self.extra_length > 0 {
                            ZState::DistanceExtra
                        } else {
                            ZState::Huffman
                        };
                        self.index += 1;
                    }
                    return Ok(x);
                }
                ZState::DistanceExtra => {
                    let x = (self.count >> self.bit_length) & 1;
                    self.bit_length += 1;
                    if self.bit_length >= self.extra_length {
                        self.state = ZState::Huffman;
                        self.bit_length = 0;
                    }
                    return Ok(x);
                }
                _ => return Err(Some(ApiError::Unknown)),
            }
        }
    }

    /*
     * Read the next command header out of the serialized block.  Returns
     * `false` when the command is an insert and `LitPayload` takes over.
     */
    fn load_command(&mut self) -> Result<bool, ApiError> {
        let out = self.buffer.str();
        let header = out[self.index as usize];
        let len = if header & 0x40 != 0 {
            if self.index + 1 >= self.backward {
                return Err(ApiError::Sanitize);
            }
            self.index += 1;
            (((header & 0x3F) as u32) << 8) + out[self.index as usize] as u32 + 64
        } else {
            (header & 0x3F) as u32
        };
        if header & 0x80 == 0 {
            /* insert */
            if len == 0 || self.index + 1 >= self.backward {
                return Err(ApiError::Sanitize);
            }
            self.state = ZState::LitPayload;
            self.index += 1;
            self.count = len;
            self.bit_length = 0;
            Ok(false)
        } else {
            let idx = self.values.encode(0, len, false);
            if idx == NOT_FOUND {
                return Err(ApiError::Sanitize);
            }
            let row = self.values[idx];
            let line = self.literals[row.code as usize];
            self.bit_cap = line.len as u32;
            self.bits = line.code as u32;
            self.count = len - row.copy_first as u32;
            self.extra_length = row.copy_bits as u16;
            Ok(true)
        }
    }

    /* Decode the distance field of the current copy command and pick its
     * Huffman line and extra bits. */
    fn load_distance(&mut self) -> Result<(), ApiError> {
        let out = self.buffer.str();
        if self.index >= self.backward {
            return Err(ApiError::OutOfRange);
        }
        let tag = out[self.index as usize];
        self.index += 1;
        if tag & 0x80 == 0 {
            /* dictionary references never appear in a zlib stream */
            return Err(ApiError::Sanitize);
        }
        if self.index >= self.backward {
            return Err(ApiError::OutOfRange);
        }
        let distance: u32 = if tag & 0x40 != 0 {
            if self.backward - self.index < 3 {
                return Err(ApiError::OutOfRange);
            }
            let b = &out[self.index as usize..self.index as usize + 3];
            self.index += 2;
            ((((tag & 0x3F) as u32) << 24)
                | ((b[0] as u32) << 16)
                | ((b[1] as u32) << 8)
                | b[2] as u32)
                + 16384
        } else {
            (((tag & 0x3F) as u32) << 8) | out[self.index as usize] as u32
        };
        if distance >= 32768 {
            /* zlib lacks support for large distances */
            return Err(ApiError::Sanitize);
        }
        let mut extra = 0;
        let dcode = self.ring.encode(distance + 1, &mut extra)?;
        let line = self.distances[dcode as usize];
        self.bit_cap = line.len as u32;
        self.bits = line.code as u32;
        self.count = extra;
        self.extra_length = self.ring.bit_count(dcode) as u16;
        Ok(())
    }

    fn ensure_length_sorted(&mut self) {
        if !self.values_length_sorted {
            self.values.lengthsort();
            self.values_length_sorted = true;
        }
    }

    /*
     * Build the trial encoding for the gathered input and pick dynamic
     * Huffman or stored, whichever estimates smaller.  On return the
     * commands for the chosen layout sit in the buffer's output string.
     */
    fn prepare_block(&mut self) -> Result<bool, ApiError> {
        self.ensure_length_sorted();
        self.buffer.clear_output();
        self.buffer.try_block()?;
        self.try_ring = self.ring;
        self.lit_histogram.iter_mut().for_each(|v| *v = 0);
        self.dist_histogram.iter_mut().for_each(|v| *v = 0);
        self.seq_histogram.iter_mut().for_each(|v| *v = 0);

        let mut bit_count: u64 = 0;
        let mut parse_result: Result<(), ApiError> = Ok(());
        {
            let buffer = &self.buffer;
            for cmd in commands(buffer.str()) {
                match cmd {
                    Ok(Command::Insert(payload)) => {
                        for &b in payload {
                            self.lit_histogram[b as usize] += 1;
                        }
                    }
                    Ok(Command::Copy { len, distance }) => {
                        let idx = self.values.encode(0, len, false);
                        if idx == NOT_FOUND {
                            parse_result = Err(ApiError::InsCopyMissing);
                            break;
                        }
                        let row = self.values[idx];
                        self.lit_histogram[row.code as usize] += 1;
                        bit_count += row.copy_bits as u64;
                        let mut extra = 0;
                        match self.try_ring.encode(distance + 1, &mut extra) {
                            Ok(dcode) => {
                                bit_count += self.try_ring.bit_count(dcode) as u64;
                                self.dist_histogram[dcode as usize] += 1;
                            }
                            Err(e) => {
                                parse_result = Err(e);
                                break;
                            }
                        }
                    }
                    Ok(Command::BdictRef { .. }) => {
                        parse_result = Err(ApiError::Sanitize);
                        break;
                    }
                    Err(e) => {
                        parse_result = Err(e);
                        break;
                    }
                }
            }
        }
        parse_result?;
        self.lit_histogram[256] = 1;

        self.literals.identity_values();
        self.distances.identity_values();
        self.sequence.identity_values();
        self.literals.gen_lengths(&self.lit_histogram, 15)?;
        self.distances.gen_lengths(&self.dist_histogram, 15)?;
        self.make_sequence()?;
        let mut j = 0usize;
        while j < self.sequence_list.len() {
            let v = self.sequence_list[j];
            self.seq_histogram[v as usize] += 1;
            if v >= 16 {
                bit_count += DEFLATE_PRECODE_REPEAT_BITS[(v - 16) as usize] as u64;
                j += 1;
            }
            j += 1;
        }
        self.sequence.gen_lengths(&self.seq_histogram, 7)?;
        for j in 0..DEFLATE_NUM_LITLEN_SYMS {
            bit_count += self.lit_histogram[j] as u64 * self.literals[j].len as u64;
        }
        for j in 0..DEFLATE_NUM_OFFSET_SYMS {
            bit_count += self.dist_histogram[j] as u64 * self.distances[j].len as u64;
        }
        for j in 0..DEFLATE_NUM_PRECODE_SYMS {
            bit_count += self.seq_histogram[j] as u64 * self.sequence[j].len as u64;
        }
        /* dynamic header: HLIT/HDIST/HCLEN plus the code-length lengths */
        bit_count += 14 + 3 * DEFLATE_NUM_PRECODE_SYMS as u64;

        let byte_count = (bit_count + 7) >> 3;
        let dynamic = byte_count < self.buffer.input_size() as u64;
        if dynamic {
            self.sequence.gen_codes()?;
        } else {
            log::debug!(
                "stored block wins: {} estimated vs {} literal bytes",
                byte_count,
                self.buffer.input_size()
            );
            self.buffer.clear_output();
            self.buffer.noconv_block()?;
        }
        self.buffer.clear_input();
        Ok(dynamic)
    }

    /* Run-length encode the literal and distance lengths for the
     * dynamic-block header. */
    fn make_sequence(&mut self) -> Result<(), ApiError> {
        self.sequence_list.clear();
        let mut run_len: Option<u16> = None;
        let mut run_count = 0u32;
        for i in 0..(DEFLATE_NUM_USED_LITLEN_SYMS + DEFLATE_NUM_USED_OFFSET_SYMS) {
            let n = if i < DEFLATE_NUM_USED_LITLEN_SYMS {
                self.literals[i].len
            } else {
                self.distances[i - DEFLATE_NUM_USED_LITLEN_SYMS].len
            };
            if run_len == Some(n) {
                run_count += 1;
            } else {
                if let Some(len) = run_len {
                    post_sequence(&mut self.sequence_list, len, run_count);
                }
                run_len = Some(n);
                run_count = 1;
            }
        }
        if let Some(len) = run_len {
            post_sequence(&mut self.sequence_list, len, run_count);
        }
        Ok(())
    }
}

/* Append the code-length encoding of `count` repetitions of `len`. */
fn post_sequence(s: &mut BlockString, len: u16, count: u32) {
    if count == 0 {
        return;
    }
    if count < 4 {
        for _ in 0..count {
            s.push(len as u8);
        }
        return;
    }
    if len == 0 {
        let mut rem = count;
        while rem > 0 {
            if rem < 3 {
                for _ in 0..rem {
                    s.push(0);
                }
                break;
            } else if rem <= 10 {
                s.push(17);
                s.push((rem - 3) as u8);
                break;
            } else if rem <= 138 {
                s.push(18);
                s.push((rem - 11) as u8);
                break;
            } else {
                s.push(18);
                s.push(127);
                rem -= 138;
            }
        }
    } else {
        s.push(len as u8);
        let mut rem = count - 1;
        while rem > 0 {
            if rem < 3 {
                for _ in 0..rem {
                    s.push(len as u8);
                }
                break;
            } else if rem <= 6 {
                s.push(16);
                s.push((rem - 3) as u8);
                break;
            } else {
                s.push(16);
                s.push(3);
                rem -= 6;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all(state: &mut ZlibCvt, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 97];
        let mut sp = 0usize;
        loop {
            let mut dp = 0usize;
            let pr = state.convert_out(data, &mut sp, &mut buf, &mut dp).unwrap();
            out.extend_from_slice(&buf[..dp]);
            match pr {
                Progress::Partial if sp >= data.len() => break,
                Progress::EndOfFile => break,
                _ => {}
            }
        }
        loop {
            let mut dp = 0usize;
            let pr = state.unshift(&mut buf, &mut dp).unwrap();
            out.extend_from_slice(&buf[..dp]);
            if pr == Progress::EndOfFile {
                break;
            }
        }
        out
    }

    fn decode_all(state: &mut ZlibCvt, data: &[u8]) -> Result<Vec<u8>, ApiError> {
        let mut out = Vec::new();
        let mut buf = [0u8; 53];
        let mut sp = 0usize;
        loop {
            let mut dp = 0usize;
            let pr = state.convert_in(data, &mut sp, &mut buf, &mut dp)?;
            out.extend_from_slice(&buf[..dp]);
            match pr {
                Progress::EndOfFile => return Ok(out),
                Progress::Partial => {}
                Progress::Success => {
                    assert!(sp < data.len(), "stream ended without trailer");
                }
            }
        }
    }

    fn xorshift_bytes(len: usize, mut seed: u32) -> Vec<u8> {
        (0..len)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                (seed >> 16) as u8
            })
            .collect()
    }

    #[test]
    fn decode_fixed_huffman_reference() {
        /* canonical zlib encoding of "abc" with the static code */
        let stream = [
            0x78u8, 0x9C, 0x4B, 0x4C, 0x4A, 0x06, 0x00, 0x02, 0x4D, 0x01, 0x27,
        ];
        let mut st = ZlibCvt::new(4096, 32768, 64);
        assert_eq!(decode_all(&mut st, &stream).unwrap(), b"abc");
    }

    #[test]
    fn decode_stored_reference() {
        let stream = [
            0x78u8, 0x01, 0x01, 0x03, 0x00, 0xFC, 0xFF, b'a', b'b', b'c', 0x02, 0x4D, 0x01, 0x27,
        ];
        let mut st = ZlibCvt::new(4096, 32768, 64);
        assert_eq!(decode_all(&mut st, &stream[..]).unwrap(), b"abc");
    }

    #[test]
    fn decode_rejects_bad_header_and_btype() {
        let mut st = ZlibCvt::new(4096, 32768, 64);
        let mut sp = 0;
        let mut dst = [0u8; 8];
        let mut dp = 0;
        /* FCHECK broken */
        assert_eq!(
            st.convert_in(&[0x78, 0x9D], &mut sp, &mut dst, &mut dp),
            Err(ApiError::Sanitize)
        );
        /* BTYPE = 3 */
        let mut st = ZlibCvt::new(4096, 32768, 64);
        let mut sp = 0;
        assert_eq!(
            st.convert_in(&[0x78, 0x9C, 0x07], &mut sp, &mut dst, &mut dp),
            Err(ApiError::Sanitize)
        );
    }

    #[test]
    fn decode_rejects_bad_trailer() {
        let stream = [
            0x78u8, 0x9C, 0x4B, 0x4C, 0x4A, 0x06, 0x00, 0x02, 0x4D, 0x01, 0x28,
        ];
        let mut st = ZlibCvt::new(4096, 32768, 64);
        assert_eq!(decode_all(&mut st, &stream), Err(ApiError::Sanitize));
    }

    #[test]
    fn roundtrip_abc() {
        let mut enc = ZlibCvt::new(4096, 32768, 256);
        let z = encode_all(&mut enc, b"abc");
        let mut dec = ZlibCvt::new(4096, 32768, 256);
        assert_eq!(decode_all(&mut dec, &z).unwrap(), b"abc");
    }

    #[test]
    fn roundtrip_empty() {
        let mut enc = ZlibCvt::new(4096, 32768, 256);
        let z = encode_all(&mut enc, b"");
        let mut dec = ZlibCvt::new(4096, 32768, 256);
        assert_eq!(decode_all(&mut dec, &z).unwrap(), b"");
    }

    #[test]
    fn roundtrip_compressible() {
        let data: Vec<u8> = b"rose is a rose is a rose is a rose. "
            .iter()
            .cycle()
            .take(32 * 1024)
            .copied()
            .collect();
        let mut enc = ZlibCvt::new(4096, 32768, 256);
        let z = encode_all(&mut enc, &data);
        assert!(z.len() < data.len() / 2, "compressed {} bytes", z.len());
        let mut dec = ZlibCvt::new(4096, 32768, 256);
        assert_eq!(decode_all(&mut dec, &z).unwrap(), data);
    }

    #[test]
    fn roundtrip_random() {
        for (len, seed) in [(1usize, 11u32), (255, 5), (4096, 7), (32768, 3)] {
            let data = xorshift_bytes(len, seed);
            let mut enc = ZlibCvt::new(4096, 32768, 128);
            let z = encode_all(&mut enc, &data);
            let mut dec = ZlibCvt::new(4096, 32768, 128);
            assert_eq!(decode_all(&mut dec, &z).unwrap(), data, "len {}", len);
        }
    }

    #[test]
    fn roundtrip_small_blocks() {
        /* tiny block size exercises multi-block streams */
        let data = xorshift_bytes(3000, 23);
        let mut enc = ZlibCvt::new(64, 1024, 32);
        let z = encode_all(&mut enc, &data);
        let mut dec = ZlibCvt::new(64, 32768, 32);
        assert_eq!(decode_all(&mut dec, &z).unwrap(), data);
    }

    #[test]
    fn partial_continuation_is_seamless() {
        let data: Vec<u8> = b"partial partial partial! "
            .iter()
            .cycle()
            .take(6000)
            .copied()
            .collect();
        let mut enc = ZlibCvt::new(4096, 32768, 256);
        let z = encode_all(&mut enc, &data);

        /* one-byte destination slices force a suspension at every byte */
        let mut dec = ZlibCvt::new(4096, 32768, 256);
        let mut out = Vec::new();
        let mut one = [0u8; 1];
        let mut sp = 0usize;
        loop {
            let mut dp = 0usize;
            let pr = dec.convert_in(&z, &mut sp, &mut one, &mut dp).unwrap();
            out.extend_from_slice(&one[..dp]);
            if pr == Progress::EndOfFile {
                break;
            }
        }
        assert_eq!(out, data);
    }

    #[test]
    fn byte_at_a_time_input() {
        let data = xorshift_bytes(2500, 41);
        let mut enc = ZlibCvt::new(512, 32768, 64);
        let z = encode_all(&mut enc, &data);

        let mut dec = ZlibCvt::new(512, 32768, 64);
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        let mut done = false;
        for chunk in z.chunks(1) {
            let mut sp = 0usize;
            loop {
                let mut dp = 0usize;
                let pr = dec.convert_in(chunk, &mut sp, &mut buf, &mut dp).unwrap();
                out.extend_from_slice(&buf[..dp]);
                match pr {
                    Progress::EndOfFile => {
                        done = true;
                        break;
                    }
                    Progress::Partial => continue,
                    Progress::Success => break,
                }
            }
            if done {
                break;
            }
        }
        assert!(done);
        assert_eq!(out, data);
    }

    #[test]
    fn dictionary_stream_resumes_after_bypass() {
        /* header with FDICT, dictionary "abc", stored payload "xyz" */
        let stream = [
            0x78u8, 0x20, 0x02, 0x4D, 0x01, 0x27, 0x01, 0x03, 0x00, 0xFC, 0xFF, b'x', b'y', b'z',
            0x02, 0xD7, 0x01, 0x6C,
        ];
        let mut st = ZlibCvt::new(4096, 32768, 64);
        let mut sp = 0usize;
        let mut buf = [0u8; 16];
        let mut dp = 0usize;
        assert_eq!(
            st.convert_in(&stream, &mut sp, &mut buf, &mut dp),
            Err(ApiError::ZlibDictionary)
        );
        assert_eq!(st.checksum(), 0x024D0127);
        st.bypass(b"abc").unwrap();
        assert_eq!(decode_all(&mut st, &stream[sp..]).unwrap(), b"xyz");
    }

    #[test]
    fn encoder_emits_dictionary_header() {
        let mut enc = ZlibCvt::new(4096, 32768, 256);
        enc.bypass(b"abc").unwrap();
        let z = encode_all(&mut enc, b"abcabcabc");
        assert_eq!(z[1] & 0x20, 0x20, "FDICT must be set");
        assert_eq!(&z[2..6], &[0x02, 0x4D, 0x01, 0x27]);
        let mut dec = ZlibCvt::new(4096, 32768, 256);
        let mut sp = 0usize;
        let mut buf = [0u8; 32];
        let mut dp = 0usize;
        assert_eq!(
            dec.convert_in(&z, &mut sp, &mut buf, &mut dp),
            Err(ApiError::ZlibDictionary)
        );
        dec.bypass(b"abc").unwrap();
        assert_eq!(decode_all(&mut dec, &z[sp..]).unwrap(), b"abcabcabc");
    }

    #[test]
    fn bypass_is_rejected_mid_stream() {
        let mut st = ZlibCvt::new(4096, 32768, 64);
        let stream = [
            0x78u8, 0x9C, 0x4B, 0x4C, 0x4A, 0x06, 0x00, 0x02, 0x4D, 0x01, 0x27,
        ];
        let mut sp = 0usize;
        let mut buf = [0u8; 2];
        let mut dp = 0usize;
        /* decode a little, then the window is no longer seedable */
        st.convert_in(&stream, &mut sp, &mut buf, &mut dp).unwrap();
        assert_eq!(st.bypass(b"late"), Err(ApiError::Sanitize));
    }

    #[test]
    fn rejects_garbage() {
        let mut st = ZlibCvt::new(4096, 32768, 64);
        let garbage: Vec<u8> = (0..64u32).map(|i| (i * 41 + 3) as u8).collect();
        assert!(decode_all(&mut st, &garbage).is_err());
    }

    #[test]
    fn post_sequence_runs() {
        let mut s = Vec::new();
        post_sequence(&mut s, 0, 2);
        assert_eq!(s, vec![0, 0]);
        s.clear();
        post_sequence(&mut s, 0, 10);
        assert_eq!(s, vec![17, 7]);
        s.clear();
        post_sequence(&mut s, 0, 139);
        assert_eq!(s, vec![18, 127, 0]);
        s.clear();
        post_sequence(&mut s, 0, 150);
        assert_eq!(s, vec![18, 127, 18, 1]);
        s.clear();
        post_sequence(&mut s, 8, 9);
        assert_eq!(s, vec![8, 16, 3, 8, 8]);
        s.clear();
        post_sequence(&mut s, 8, 3);
        assert_eq!(s, vec![8, 8, 8]);
    }
}
