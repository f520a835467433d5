pub mod forward_box;
pub mod tree_marshal;

use crate::block_buffer::{commands, BlockBuffer, Command};
use crate::brotli_constants::*;
use crate::context_map::{literal_context, distance_context, ContextMap, ContextMapMode};
use crate::context_span::{ctxtspan_guess, ContextScore};
use crate::distance_ring::DistanceRing;
use crate::insert_copy::{InsertCopyPreset, InsertCopyTable};
use crate::brotli_meta::BrotliMeta;
use crate::prefix_list::{GaspVector, PrefixHistogram, PrefixList, PrefixPreset, NOT_FOUND};
use crate::{ApiError, ApiResult, Progress};
use forward_box::ForwardBox;
use tree_marshal::{build_simple, singular_value, TreeMarshal, TreeStep};

/*
 * The Brotli conversion state machine.  `convert_in` decodes an RFC 7932
 * stream bit by bit into plain bytes; `convert_out` gathers plain bytes
 * into meta-blocks, choosing between an uncompressed meta-block and a
 * single-block-type compressed layout, staging each serialized block
 * through the forward box.  `unshift` terminates the stream and `flush`
 * inserts an empty metadata block as a byte-align point.
 */

const CAT_L: usize = 0;
const CAT_I: usize = 1;
const CAT_D: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BrState {
    /* stream header */
    Wbits,
    /* ISLAST / ISLASTEMPTY / MNIBBLES */
    MetaHeader,
    MLen,
    IsUncompressed,
    StoredAlign,
    /* byte-level raw copy */
    StoredCopy,
    /* metadata framing: reserved bit + MSKIPBYTES */
    MetaSkip,
    MetaSkipLen,
    MetaAlign,
    /* byte-level metadata payload (both directions) */
    MetaPayload,
    /* variable-length counts (NBLTYPES*, NTREES*) */
    NumCode,
    NumExtra,
    /* nested prefix-code reader */
    Tree,
    /* block-switch sub-machine, shared by the header's first counts */
    SwitchTypeCode,
    SwitchCountCode,
    SwitchCountExtra,
    /* NPOSTFIX / NDIRECT */
    DistParams,
    /* literal context modes */
    CtxModes,
    /* context map transcoding */
    CMapRleFlag,
    CMapRleMax,
    CMapValue,
    CMapZeroExtra,
    CMapMtf,
    /* command loop */
    CmdStart,
    CmdIcCode,
    CmdInsExtra,
    CmdCopyExtra,
    CmdLiteralStart,
    CmdLiteral,
    /* a decoded literal waiting for destination room */
    LitStash,
    DistStart,
    DistCode,
    DistExtra,
    CopyLoop,
    Done,
    /* output direction */
    BlockStart,
    EmitStaged,
    MetaStart,
    MetaLength,
    MetaPad,
    LastCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NumTarget {
    Types(usize),
    TreesL,
    TreesD,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TreeTarget {
    BlockType(usize),
    BlockCount(usize),
    Context,
    ForestL(usize),
    ForestI(usize),
    ForestD(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwitchReturn {
    HeaderNext,
    Command,
    Literal,
    Distance,
}

/* Current and previous block type of one category. */
#[derive(Debug, Clone, Copy, Default)]
struct BlockBox {
    current: u16,
    previous: u16,
}

/* One planned Brotli command on the encode side. */
#[derive(Debug, Clone, Copy)]
struct PlanCmd {
    code: u16,
    ins_extra: u32,
    ins_extra_bits: u8,
    copy_extra: u32,
    copy_extra_bits: u8,
    /* (dcode, extra value, extra bits); `None` for implicit or trailing */
    dist: Option<(u32, u32, u32)>,
}

macro_rules! need_bit {
    ($x:expr, $took:ident) => {
        match $x {
            Some(v) if !$took => {
                $took = true;
                v
            }
            _ => return Ok((Progress::Success, $took)),
        }
    };
}

pub struct BrotliCvt {
    buffer: BlockBuffer,
    wbits: PrefixList,
    blocknum: PrefixList,
    blocktype_tree: [PrefixList; 3],
    blockcount_tree: [PrefixList; 3],
    context_tree: PrefixList,
    values: InsertCopyTable,
    blockcounts: InsertCopyTable,
    ring: DistanceRing,
    try_ring: DistanceRing,
    literals_map: ContextMap,
    distance_map: ContextMap,
    literals_forest: GaspVector,
    insert_forest: GaspVector,
    distance_forest: GaspVector,
    metadata: BrotliMeta,
    meta_index: usize,
    max_len_meta: usize,
    treety: TreeMarshal,
    fwd: ForwardBox,
    lit_histogram: PrefixHistogram,
    ins_histogram: PrefixHistogram,
    dist_histogram: PrefixHistogram,
    /* bit-level scalars */
    state: BrState,
    bits: u32,
    bit_length: u16,
    bit_index: u8,
    write_scratch: u8,
    h_end: u8,
    emptymeta: bool,
    wbits_select: u8,
    mlen: u32,
    metablock_pos: u32,
    count: u32,
    index: u32,
    backward: u32,
    extra_length: u16,
    copy_len: u32,
    implicit_distance: bool,
    ic_insert_first: u16,
    ic_insert_bits: u8,
    ic_copy_first: u16,
    ic_copy_bits: u8,
    lit_tree: usize,
    dist_tree: usize,
    btype: [BlockBox; 3],
    btype_max: [u32; 3],
    btype_remaining: [u32; 3],
    ntrees_l: u32,
    ntrees_d: u32,
    num_target: NumTarget,
    tree_target: TreeTarget,
    switch_cat: usize,
    switch_return: SwitchReturn,
    switch_base: u32,
    cmap_rlemax: u32,
    cmap_is_dist: bool,
    values_length_sorted: bool,
}

impl BrotliCvt {
    /*
     * `block_size` bounds the bytes gathered per meta-block, `n` is the
     * sliding-window extent (clamped to the largest WBITS window), and
     * `chain_length` bounds the encoder's match search.
     */
    pub fn new(block_size: u32, n: u32, chain_length: usize) -> BrotliCvt {
        let n = n.min(BROTLI_MAX_WINDOW);
        let mut wbits_select = BROTLI_MAX_WBITS;
        for w in BROTLI_MIN_WBITS..=BROTLI_MAX_WBITS {
            if n <= (1u32 << w) - 16 {
                wbits_select = w;
                break;
            }
        }
        let mut wbits = PrefixList::preset(PrefixPreset::BrotliWBits);
        wbits.codesort();
        let mut blocknum = PrefixList::preset(PrefixPreset::BrotliBlockType);
        blocknum.codesort();
        let mut values = InsertCopyTable::preset(InsertCopyPreset::BrotliInsertCopy);
        values.codesort();
        let mut blockcounts = InsertCopyTable::preset(InsertCopyPreset::BrotliBlockCount);
        blockcounts.codesort();
        BrotliCvt {
            buffer: BlockBuffer::new(block_size.min(1 << 24), n, chain_length, false),
            wbits,
            blocknum,
            blocktype_tree: Default::default(),
            blockcount_tree: Default::default(),
            context_tree: PrefixList::new(0),
            values,
            blockcounts,
            ring: DistanceRing::new(true, 0, 0).unwrap(),
            try_ring: DistanceRing::new(true, 0, 0).unwrap(),
            literals_map: ContextMap::new(0, 0),
            distance_map: ContextMap::new(0, 0),
            literals_forest: GaspVector::new(),
            insert_forest: GaspVector::new(),
            distance_forest: GaspVector::new(),
            metadata: BrotliMeta::new(),
            meta_index: 0,
            max_len_meta: 1024,
            treety: TreeMarshal::new(),
            fwd: ForwardBox::new(),
            lit_histogram: vec![0; BROTLI_NUM_LITERAL_SYMS],
            ins_histogram: vec![0; BROTLI_NUM_INSCOPY_SYMS],
            dist_histogram: vec![0; 64],
            state: BrState::Wbits,
            bits: 0,
            bit_length: 0,
            bit_index: 0,
            write_scratch: 0,
            h_end: 0,
            emptymeta: false,
            wbits_select,
            mlen: 0,
            metablock_pos: 0,
            count: 0,
            index: 0,
            backward: 0,
            extra_length: 0,
            copy_len: 0,
            implicit_distance: false,
            ic_insert_first: 0,
            ic_insert_bits: 0,
            ic_copy_first: 0,
            ic_copy_bits: 0,
            lit_tree: 0,
            dist_tree: 0,
            btype: [BlockBox::default(); 3],
            btype_max: [1; 3],
            btype_remaining: [0; 3],
            ntrees_l: 1,
            ntrees_d: 1,
            num_target: NumTarget::Types(CAT_L),
            tree_target: TreeTarget::Context,
            switch_cat: 0,
            switch_return: SwitchReturn::HeaderNext,
            switch_base: 0,
            cmap_rlemax: 0,
            cmap_is_dist: false,
            values_length_sorted: false,
        }
    }

    pub fn metadata(&self) -> &BrotliMeta {
        &self.metadata
    }

    /* Queue metadata for the encoder, or read what the decoder captured. */
    pub fn metadata_mut(&mut self) -> &mut BrotliMeta {
        &mut self.metadata
    }

    /* Per-entry byte cap for metadata captured by the decoder. */
    pub fn set_max_len_meta(&mut self, cap: usize) {
        self.max_len_meta = cap;
    }

    pub fn buffer(&self) -> &BlockBuffer {
        &self.buffer
    }

    /* Seed the sliding window before the stream begins. */
    pub fn bypass(&mut self, buf: &[u8]) -> Result<usize, ApiError> {
        match self.state {
            BrState::Wbits | BrState::MetaHeader => Ok(self.buffer.bypass(buf)),
            _ => Err(ApiError::Sanitize),
        }
    }

    /*
     * Decode: Brotli stream in, plain bytes out.
     */
    pub fn convert_in(
        &mut self,
        src: &[u8],
        src_pos: &mut usize,
        dst: &mut [u8],
        dst_pos: &mut usize,
    ) -> ApiResult {
        loop {
            if self.state == BrState::Done {
                return Ok(Progress::EndOfFile);
            }
            if *src_pos >= src.len() {
                /* bits are gone; finish whatever needs none */
                return self.pump_pending(dst, dst_pos);
            }
            let byte = src[*src_pos];
            match self.state {
                BrState::StoredCopy => match self.in_stored_byte(byte, dst, dst_pos) {
                    Ok(Progress::Success) => *src_pos += 1,
                    Ok(Progress::Partial) => return Ok(Progress::Partial),
                    Ok(Progress::EndOfFile) => {
                        *src_pos += 1;
                        return Ok(Progress::EndOfFile);
                    }
                    Err(e) => {
                        *src_pos += 1;
                        return Err(e);
                    }
                },
                BrState::MetaPayload => match self.in_meta_byte(byte) {
                    Ok(Progress::Success) => *src_pos += 1,
                    Ok(Progress::EndOfFile) => {
                        *src_pos += 1;
                        return Ok(Progress::EndOfFile);
                    }
                    Ok(Progress::Partial) => return Ok(Progress::Partial),
                    Err(e) => {
                        *src_pos += 1;
                        return Err(e);
                    }
                },
                _ => {
                    let (result, consumed) = self.in_bits(byte, dst, dst_pos);
                    if consumed {
                        *src_pos += 1;
                    }
                    match result {
                        Ok(Progress::Success) => {}
                        other => return other,
                    }
                }
            }
        }
    }

    fn in_bits(&mut self, y: u8, dst: &mut [u8], dst_pos: &mut usize) -> (ApiResult, bool) {
        let mut i = self.bit_index as u32;
        let mut result = Ok(Progress::Success);
        while i < 8 {
            let x = ((y >> i) & 1) as u32;
            match self.in_bit_step(Some(x), i, dst, dst_pos) {
                Ok((Progress::Success, _)) => i += 1,
                Ok((progress, took)) => {
                    if took {
                        i += 1;
                    }
                    result = Ok(progress);
                    break;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.bit_index = (i & 7) as u8;
        (result, i >= 8)
    }

    /* Make progress that needs no input bits (pending copies, stashed
     * literals, zero-bit prefix codes). */
    fn pump_pending(&mut self, dst: &mut [u8], dst_pos: &mut usize) -> ApiResult {
        loop {
            if matches!(self.state, BrState::StoredCopy | BrState::MetaPayload) {
                /* byte-oriented states wait for real input */
                return Ok(Progress::Success);
            }
            let state_before = self.state;
            let dst_before = *dst_pos;
            let pos_before = self.metablock_pos;
            match self.in_bit_step(None, 0, dst, dst_pos)? {
                (Progress::Success, _) => {
                    if self.state == state_before
                        && *dst_pos == dst_before
                        && self.metablock_pos == pos_before
                    {
                        return Ok(Progress::Success);
                    }
                }
                (progress, _) => return Ok(progress),
            }
        }
    }

    fn enter_meta_header(&mut self) {
        self.state = BrState::MetaHeader;
        self.bits = 0;
        self.bit_length = 0;
        self.count = 0;
        self.backward = 0;
    }

    fn begin_num(&mut self, target: NumTarget) {
        self.num_target = target;
        self.state = BrState::NumCode;
        self.bits = 0;
        self.bit_length = 0;
    }

    fn begin_tree(&mut self, alphabet: u32, target: TreeTarget) {
        self.treety.start(alphabet);
        self.tree_target = target;
        self.state = BrState::Tree;
        self.bits = 0;
        self.bit_length = 0;
    }

    fn begin_switch(&mut self, cat: usize, ret: SwitchReturn) {
        self.switch_cat = cat;
        self.switch_return = ret;
        self.state = BrState::SwitchTypeCode;
        self.bits = 0;
        self.bit_length = 0;
    }

    fn begin_compressed_header(&mut self) {
        self.metablock_pos = 0;
        self.begin_num(NumTarget::Types(CAT_L));
    }

    fn after_num(&mut self, n: u32) -> Result<(), ApiError> {
        match self.num_target {
            NumTarget::Types(cat) => {
                if n == 0 || n as usize > BROTLI_MAX_BLOCK_TYPES {
                    return Err(ApiError::Sanitize);
                }
                self.btype_max[cat] = n;
                self.btype[cat] = BlockBox {
                    current: 0,
                    previous: 1,
                };
                self.btype_remaining[cat] = 1 << 24;
                if n >= 2 {
                    self.begin_tree(n + 2, TreeTarget::BlockType(cat));
                } else {
                    self.next_block_group(cat);
                }
            }
            NumTarget::TreesL => {
                self.ntrees_l = n;
                self.literals_forest = vec![PrefixList::new(0); n as usize];
                if n >= 2 {
                    self.cmap_is_dist = false;
                    self.state = BrState::CMapRleFlag;
                    self.bits = 0;
                    self.bit_length = 0;
                } else {
                    self.begin_num(NumTarget::TreesD);
                }
            }
            NumTarget::TreesD => {
                self.ntrees_d = n;
                self.distance_forest = vec![PrefixList::new(0); n as usize];
                if n >= 2 {
                    self.cmap_is_dist = true;
                    self.state = BrState::CMapRleFlag;
                    self.bits = 0;
                    self.bit_length = 0;
                } else {
                    self.begin_forests();
                }
            }
        }
        Ok(())
    }

    fn next_block_group(&mut self, cat: usize) {
        match cat {
            CAT_L => self.begin_num(NumTarget::Types(CAT_I)),
            CAT_I => self.begin_num(NumTarget::Types(CAT_D)),
            _ => {
                self.state = BrState::DistParams;
                self.bits = 0;
                self.bit_length = 0;
            }
        }
    }

    fn begin_forests(&mut self) {
        self.insert_forest = vec![PrefixList::new(0); self.btype_max[CAT_I] as usize];
        self.begin_tree(BROTLI_NUM_LITERAL_SYMS as u32, TreeTarget::ForestL(0));
    }

    fn install_tree(&mut self, list: PrefixList) -> Result<(), ApiError> {
        match self.tree_target {
            TreeTarget::BlockType(cat) => {
                self.blocktype_tree[cat] = list;
                self.begin_tree(
                    BROTLI_NUM_BLOCKCOUNT_SYMS as u32,
                    TreeTarget::BlockCount(cat),
                );
            }
            TreeTarget::BlockCount(cat) => {
                self.blockcount_tree[cat] = list;
                self.switch_cat = cat;
                self.switch_return = SwitchReturn::HeaderNext;
                self.state = BrState::SwitchCountCode;
                self.bits = 0;
                self.bit_length = 0;
            }
            TreeTarget::Context => {
                self.context_tree = list;
                self.state = BrState::CMapValue;
                self.index = 0;
                self.bits = 0;
                self.bit_length = 0;
            }
            TreeTarget::ForestL(slot) => {
                self.literals_forest[slot] = list;
                if slot + 1 < self.ntrees_l as usize {
                    self.begin_tree(BROTLI_NUM_LITERAL_SYMS as u32, TreeTarget::ForestL(slot + 1));
                } else {
                    self.begin_tree(BROTLI_NUM_INSCOPY_SYMS as u32, TreeTarget::ForestI(0));
                }
            }
            TreeTarget::ForestI(slot) => {
                self.insert_forest[slot] = list;
                if slot + 1 < self.btype_max[CAT_I] as usize {
                    self.begin_tree(BROTLI_NUM_INSCOPY_SYMS as u32, TreeTarget::ForestI(slot + 1));
                } else {
                    self.begin_tree(self.ring.alphabet_size(), TreeTarget::ForestD(0));
                }
            }
            TreeTarget::ForestD(slot) => {
                self.distance_forest[slot] = list;
                if slot + 1 < self.ntrees_d as usize {
                    self.begin_tree(self.ring.alphabet_size(), TreeTarget::ForestD(slot + 1));
                } else {
                    self.state = BrState::CmdStart;
                }
            }
        }
        Ok(())
    }

    fn after_count(&mut self, value: u32) {
        self.btype_remaining[self.switch_cat] = value;
        match self.switch_return {
            SwitchReturn::HeaderNext => self.next_block_group(self.switch_cat),
            SwitchReturn::Command => self.state = BrState::CmdStart,
            SwitchReturn::Literal => self.state = BrState::CmdLiteralStart,
            SwitchReturn::Distance => self.state = BrState::DistStart,
        }
    }

    fn cmap_size(&self) -> u32 {
        if self.cmap_is_dist {
            self.btype_max[CAT_D] * BROTLI_DISTANCE_CONTEXTS as u32
        } else {
            self.btype_max[CAT_L] * BROTLI_LITERAL_CONTEXTS as u32
        }
    }

    fn cmap_ntrees(&self) -> u32 {
        if self.cmap_is_dist {
            self.ntrees_d
        } else {
            self.ntrees_l
        }
    }

    /* Emit one decoded byte: destination plus sliding window. */
    fn emit(&mut self, byte: u8, dst: &mut [u8], dst_pos: &mut usize) {
        dst[*dst_pos] = byte;
        *dst_pos += 1;
        self.buffer.bypass(&[byte]);
    }

    /*
     * Process one decode step.  `x` is the pending input bit (`None` when
     * the caller has run out); `i` is the bit position inside the current
     * byte, which the alignment states need.  Returns the progress made
     * and whether the offered bit was consumed.
     */
    fn in_bit_step(
        &mut self,
        x: Option<u32>,
        i: u32,
        dst: &mut [u8],
        dst_pos: &mut usize,
    ) -> Result<(Progress, bool), ApiError> {
        let mut took = false;
        loop {
            match self.state {
                BrState::Wbits => {
                    let x = need_bit!(x, took);
                    self.bits = (self.bits << 1) | x;
                    let j = self.wbits.codebsearch(self.bit_length + 1, self.bits as u16);
                    if j != NOT_FOUND {
                        let v = self.wbits[j].value;
                        self.bits = 0;
                        self.bit_length = 0;
                        if v < BROTLI_MIN_WBITS as u32 {
                            /* the reserved window pattern */
                            return Err(ApiError::Sanitize);
                        }
                        self.wbits_select = v as u8;
                        self.enter_meta_header();
                    } else {
                        self.bit_length += 1;
                        if self.bit_length >= 7 {
                            return Err(ApiError::Sanitize);
                        }
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::MetaHeader => {
                    let x = need_bit!(x, took);
                    match self.count {
                        0 => {
                            self.h_end = x as u8;
                            self.count = if x != 0 { 1 } else { 2 };
                        }
                        1 => {
                            /* ISLASTEMPTY */
                            if x != 0 {
                                self.state = BrState::Done;
                                return Ok((Progress::EndOfFile, took));
                            }
                            self.count = 2;
                        }
                        _ => {
                            self.bits |= x << self.bit_length;
                            self.bit_length += 1;
                            if self.bit_length >= 2 {
                                let mnibbles = self.bits;
                                self.bits = 0;
                                self.bit_length = 0;
                                self.count = 0;
                                if mnibbles == 3 {
                                    self.state = BrState::MetaSkip;
                                } else {
                                    self.extra_length = ((mnibbles + 4) * 4) as u16;
                                    self.backward = 0;
                                    self.state = BrState::MLen;
                                }
                            }
                        }
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::MLen => {
                    let x = need_bit!(x, took);
                    self.backward |= x << self.bit_length;
                    self.bit_length += 1;
                    if self.bit_length >= self.extra_length {
                        /* longer nibble forms must be necessary */
                        if self.extra_length > 16 && (self.backward >> (self.extra_length - 4)) == 0
                        {
                            return Err(ApiError::Sanitize);
                        }
                        self.mlen = self.backward + 1;
                        self.metablock_pos = 0;
                        self.backward = 0;
                        self.bits = 0;
                        self.bit_length = 0;
                        if self.h_end == 0 {
                            self.state = BrState::IsUncompressed;
                        } else {
                            self.begin_compressed_header();
                        }
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::IsUncompressed => {
                    let x = need_bit!(x, took);
                    if x != 0 {
                        self.count = 0;
                        if i == 7 {
                            self.state = BrState::StoredCopy;
                        } else {
                            self.state = BrState::StoredAlign;
                        }
                    } else {
                        self.begin_compressed_header();
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::StoredAlign => {
                    let _ = need_bit!(x, took);
                    if i == 7 {
                        self.state = BrState::StoredCopy;
                        self.count = 0;
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::MetaSkip => {
                    let x = need_bit!(x, took);
                    match self.count {
                        0 => {
                            /* reserved bit */
                            crate::sanitize_check!(x == 0);
                            self.count = 1;
                            self.bits = 0;
                            self.bit_length = 0;
                        }
                        _ => {
                            self.bits |= x << self.bit_length;
                            self.bit_length += 1;
                            if self.bit_length >= 2 {
                                let nbytes = self.bits;
                                self.bits = 0;
                                self.bit_length = 0;
                                self.count = 0;
                                self.backward = 0;
                                if nbytes == 0 {
                                    if i == 7 {
                                        return self.after_meta_align(took);
                                    }
                                    self.state = BrState::MetaAlign;
                                } else {
                                    self.extra_length = (nbytes * 8) as u16;
                                    self.state = BrState::MetaSkipLen;
                                }
                            }
                        }
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::MetaSkipLen => {
                    let x = need_bit!(x, took);
                    self.backward |= x << self.bit_length;
                    self.bit_length += 1;
                    if self.bit_length >= self.extra_length {
                        if self.extra_length > 8 && (self.backward >> (self.extra_length - 8)) == 0 {
                            /* multi-byte skip lengths must need all their bytes */
                            return Err(ApiError::Sanitize);
                        }
                        self.backward += 1;
                        self.bits = 0;
                        self.bit_length = 0;
                        if i == 7 {
                            return self.after_meta_align(took);
                        }
                        self.state = BrState::MetaAlign;
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::MetaAlign => {
                    let _ = need_bit!(x, took);
                    if i == 7 {
                        return self.after_meta_align(took);
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::NumCode => {
                    let x = need_bit!(x, took);
                    if let Some(v) = code_step(&self.blocknum, &mut self.bits, &mut self.bit_length, x)? {
                        if v == 0 {
                            self.after_num(1)?;
                        } else if v == 1 {
                            self.after_num(2)?;
                        } else {
                            self.extra_length = (v - 1) as u16;
                            self.backward = 0;
                            self.state = BrState::NumExtra;
                        }
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::NumExtra => {
                    let x = need_bit!(x, took);
                    self.backward |= x << self.bit_length;
                    self.bit_length += 1;
                    if self.bit_length >= self.extra_length {
                        let k = self.extra_length as u32;
                        let n = (1u32 << k) + 1 + self.backward;
                        self.backward = 0;
                        self.bits = 0;
                        self.bit_length = 0;
                        self.after_num(n)?;
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::Tree => {
                    if took {
                        return Ok((Progress::Success, true));
                    }
                    let x = match x {
                        Some(v) => v,
                        None => return Ok((Progress::Success, false)),
                    };
                    match self.treety.step(x)? {
                        TreeStep::More => return Ok((Progress::Success, true)),
                        TreeStep::Complete => {
                            let list = self.treety.finish()?;
                            self.install_tree(list)?;
                            return Ok((Progress::Success, true));
                        }
                        TreeStep::CompleteUnconsumed => {
                            let list = self.treety.finish()?;
                            self.install_tree(list)?;
                            continue;
                        }
                    }
                }
                BrState::SwitchTypeCode => {
                    let tree = &self.blocktype_tree[self.switch_cat];
                    let decoded = if let Some(v) = singular_value(tree) {
                        Some(v)
                    } else {
                        let x = need_bit!(x, took);
                        code_step(tree, &mut self.bits, &mut self.bit_length, x)?
                    };
                    if let Some(v) = decoded {
                        let ntypes = self.btype_max[self.switch_cat] as u16;
                        let boxx = &mut self.btype[self.switch_cat];
                        let new = match v {
                            0 => boxx.previous,
                            1 => (boxx.current + 1) % ntypes,
                            k => {
                                let k = (k - 2) as u16;
                                if k >= ntypes {
                                    return Err(ApiError::Sanitize);
                                }
                                k
                            }
                        };
                        if new >= ntypes {
                            return Err(ApiError::Sanitize);
                        }
                        boxx.previous = boxx.current;
                        boxx.current = new;
                        self.state = BrState::SwitchCountCode;
                        self.bits = 0;
                        self.bit_length = 0;
                        continue;
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::SwitchCountCode => {
                    let tree = &self.blockcount_tree[self.switch_cat];
                    let decoded = if let Some(v) = singular_value(tree) {
                        Some(v)
                    } else {
                        let x = need_bit!(x, took);
                        code_step(tree, &mut self.bits, &mut self.bit_length, x)?
                    };
                    if let Some(v) = decoded {
                        if v as usize >= BROTLI_NUM_BLOCKCOUNT_SYMS {
                            return Err(ApiError::Sanitize);
                        }
                        let row = self.blockcounts[v as usize];
                        if row.insert_bits > 0 {
                            self.switch_base = row.insert_first as u32;
                            self.extra_length = row.insert_bits as u16;
                            self.backward = 0;
                            self.state = BrState::SwitchCountExtra;
                        } else {
                            self.after_count(row.insert_first as u32);
                        }
                        continue;
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::SwitchCountExtra => {
                    let x = need_bit!(x, took);
                    self.backward |= x << self.bit_length;
                    self.bit_length += 1;
                    if self.bit_length >= self.extra_length {
                        let value = self.switch_base + self.backward;
                        self.backward = 0;
                        self.bits = 0;
                        self.bit_length = 0;
                        self.after_count(value);
                        continue;
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::DistParams => {
                    let x = need_bit!(x, took);
                    self.bits |= x << self.bit_length;
                    self.bit_length += 1;
                    if self.bit_length >= 6 {
                        let npostfix = self.bits & 3;
                        let ndirect = ((self.bits >> 2) & 15) << npostfix;
                        self.bits = 0;
                        self.bit_length = 0;
                        /* the recent-distance cache survives block edges */
                        self.ring.reconfigure(ndirect, npostfix)?;
                        self.literals_map = ContextMap::new(
                            self.btype_max[CAT_L] as usize,
                            BROTLI_LITERAL_CONTEXTS,
                        );
                        self.distance_map = ContextMap::new(
                            self.btype_max[CAT_D] as usize,
                            BROTLI_DISTANCE_CONTEXTS,
                        );
                        self.index = 0;
                        self.state = BrState::CtxModes;
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::CtxModes => {
                    let x = need_bit!(x, took);
                    self.bits |= x << self.bit_length;
                    self.bit_length += 1;
                    if self.bit_length >= 2 {
                        let mode = ContextMapMode::from_bits(self.bits);
                        self.literals_map.set_mode(self.index as usize, mode);
                        self.index += 1;
                        self.bits = 0;
                        self.bit_length = 0;
                        if self.index >= self.btype_max[CAT_L] {
                            self.begin_num(NumTarget::TreesL);
                        }
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::CMapRleFlag => {
                    let x = need_bit!(x, took);
                    if x != 0 {
                        self.state = BrState::CMapRleMax;
                        self.bits = 0;
                        self.bit_length = 0;
                    } else {
                        self.cmap_rlemax = 0;
                        let alphabet = self.cmap_ntrees();
                        self.begin_tree(alphabet, TreeTarget::Context);
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::CMapRleMax => {
                    let x = need_bit!(x, took);
                    self.bits |= x << self.bit_length;
                    self.bit_length += 1;
                    if self.bit_length >= 4 {
                        self.cmap_rlemax = self.bits + 1;
                        let alphabet = self.cmap_ntrees() + self.cmap_rlemax;
                        self.begin_tree(alphabet, TreeTarget::Context);
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::CMapValue => {
                    let decoded = if let Some(v) = singular_value(&self.context_tree) {
                        Some(v)
                    } else {
                        let x = need_bit!(x, took);
                        code_step(&self.context_tree, &mut self.bits, &mut self.bit_length, x)?
                    };
                    if let Some(sym) = decoded {
                        let size = self.cmap_size();
                        if sym == 0 {
                            self.cmap_cell_set(0)?;
                            self.index += 1;
                        } else if sym <= self.cmap_rlemax {
                            self.backward = sym;
                            self.extra_length = sym as u16;
                            self.bits = 0;
                            self.bit_length = 0;
                            self.state = BrState::CMapZeroExtra;
                        } else {
                            let tree = sym - self.cmap_rlemax;
                            if tree >= self.cmap_ntrees() {
                                return Err(ApiError::Sanitize);
                            }
                            self.cmap_cell_set(tree as u8)?;
                            self.index += 1;
                        }
                        if self.index >= size && self.state == BrState::CMapValue {
                            self.state = BrState::CMapMtf;
                        }
                        continue;
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::CMapZeroExtra => {
                    let x = need_bit!(x, took);
                    self.bits |= x << self.bit_length;
                    self.bit_length += 1;
                    if self.bit_length >= self.extra_length {
                        let run = (1u32 << self.backward) + self.bits;
                        self.bits = 0;
                        self.bit_length = 0;
                        self.backward = 0;
                        if self.index + run > self.cmap_size() {
                            return Err(ApiError::Sanitize);
                        }
                        self.index += run;
                        self.state = if self.index >= self.cmap_size() {
                            BrState::CMapMtf
                        } else {
                            BrState::CMapValue
                        };
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::CMapMtf => {
                    let x = need_bit!(x, took);
                    if x != 0 {
                        if self.cmap_is_dist {
                            self.distance_map.revert_movetofront();
                        } else {
                            self.literals_map.revert_movetofront();
                        }
                    }
                    if self.cmap_is_dist {
                        self.begin_forests();
                    } else {
                        self.begin_num(NumTarget::TreesD);
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::CmdStart => {
                    if self.btype_max[CAT_I] >= 2 {
                        if self.btype_remaining[CAT_I] == 0 {
                            self.begin_switch(CAT_I, SwitchReturn::Command);
                            continue;
                        }
                        self.btype_remaining[CAT_I] -= 1;
                    }
                    self.state = BrState::CmdIcCode;
                    self.bits = 0;
                    self.bit_length = 0;
                    continue;
                }
                BrState::CmdIcCode => {
                    let tree = &self.insert_forest[self.btype[CAT_I].current as usize];
                    let decoded = if let Some(v) = singular_value(tree) {
                        Some(v)
                    } else {
                        let x = need_bit!(x, took);
                        code_step(tree, &mut self.bits, &mut self.bit_length, x)?
                    };
                    if let Some(v) = decoded {
                        if v as usize >= BROTLI_NUM_INSCOPY_SYMS {
                            return Err(ApiError::Sanitize);
                        }
                        let row = self.values[v as usize];
                        self.implicit_distance = row.zero_distance;
                        self.ic_insert_first = row.insert_first;
                        self.ic_insert_bits = row.insert_bits;
                        self.ic_copy_first = row.copy_first;
                        self.ic_copy_bits = row.copy_bits;
                        self.bits = 0;
                        self.bit_length = 0;
                        if self.ic_insert_bits > 0 {
                            self.extra_length = self.ic_insert_bits as u16;
                            self.backward = 0;
                            self.state = BrState::CmdInsExtra;
                        } else {
                            self.count = self.ic_insert_first as u32;
                            if self.ic_copy_bits > 0 {
                                self.extra_length = self.ic_copy_bits as u16;
                                self.backward = 0;
                                self.state = BrState::CmdCopyExtra;
                            } else {
                                self.copy_len = self.ic_copy_first as u32;
                                self.state = BrState::CmdLiteralStart;
                            }
                        }
                        continue;
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::CmdInsExtra => {
                    let x = need_bit!(x, took);
                    self.backward |= x << self.bit_length;
                    self.bit_length += 1;
                    if self.bit_length >= self.extra_length {
                        self.count = self.ic_insert_first as u32 + self.backward;
                        self.backward = 0;
                        self.bits = 0;
                        self.bit_length = 0;
                        if self.ic_copy_bits > 0 {
                            self.extra_length = self.ic_copy_bits as u16;
                            self.state = BrState::CmdCopyExtra;
                        } else {
                            self.copy_len = self.ic_copy_first as u32;
                            self.state = BrState::CmdLiteralStart;
                            continue;
                        }
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::CmdCopyExtra => {
                    let x = need_bit!(x, took);
                    self.backward |= x << self.bit_length;
                    self.bit_length += 1;
                    if self.bit_length >= self.extra_length {
                        self.copy_len = self.ic_copy_first as u32 + self.backward;
                        self.backward = 0;
                        self.bits = 0;
                        self.bit_length = 0;
                        self.state = BrState::CmdLiteralStart;
                        continue;
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::CmdLiteralStart => {
                    if self.count == 0 {
                        /* insert part done */
                        if self.metablock_pos >= self.mlen {
                            match self.end_metablock() {
                                Some(p) => return Ok((p, took)),
                                None => continue,
                            }
                        }
                        if self.implicit_distance {
                            let flat = self.ring.decode(0, 0)?;
                            self.backward = flat;
                            self.state = BrState::CopyLoop;
                        } else {
                            self.state = BrState::DistStart;
                        }
                        continue;
                    }
                    if self.btype_max[CAT_L] >= 2 {
                        if self.btype_remaining[CAT_L] == 0 {
                            self.begin_switch(CAT_L, SwitchReturn::Literal);
                            continue;
                        }
                        self.btype_remaining[CAT_L] -= 1;
                    }
                    let p1 = self.buffer.peek(0).unwrap_or(0);
                    let p2 = self.buffer.peek(1).unwrap_or(0);
                    let btl = self.btype[CAT_L].current as usize;
                    let mode = self.literals_map.mode(btl);
                    let ctx = literal_context(mode, p1, p2);
                    let tree = self.literals_map.get(btl, ctx) as usize;
                    if tree >= self.literals_forest.len() {
                        return Err(ApiError::Sanitize);
                    }
                    self.lit_tree = tree;
                    self.state = BrState::CmdLiteral;
                    self.bits = 0;
                    self.bit_length = 0;
                    continue;
                }
                BrState::CmdLiteral => {
                    let decoded = if let Some(v) = singular_value(&self.literals_forest[self.lit_tree])
                    {
                        Some(v)
                    } else {
                        let x = need_bit!(x, took);
                        code_step(
                            &self.literals_forest[self.lit_tree],
                            &mut self.bits,
                            &mut self.bit_length,
                            x,
                        )?
                    };
                    if let Some(v) = decoded {
                        if *dst_pos >= dst.len() {
                            self.state = BrState::LitStash;
                            self.bits = v;
                            return Ok((Progress::Partial, took));
                        }
                        self.emit(v as u8, dst, dst_pos);
                        self.metablock_pos += 1;
                        self.count -= 1;
                        self.state = BrState::CmdLiteralStart;
                        continue;
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::LitStash => {
                    if *dst_pos >= dst.len() {
                        return Ok((Progress::Partial, took));
                    }
                    let byte = self.bits as u8;
                    self.bits = 0;
                    self.emit(byte, dst, dst_pos);
                    self.metablock_pos += 1;
                    self.count -= 1;
                    self.state = BrState::CmdLiteralStart;
                    continue;
                }
                BrState::DistStart => {
                    if self.btype_max[CAT_D] >= 2 {
                        if self.btype_remaining[CAT_D] == 0 {
                            self.begin_switch(CAT_D, SwitchReturn::Distance);
                            continue;
                        }
                        self.btype_remaining[CAT_D] -= 1;
                    }
                    let ctx = distance_context(self.copy_len)?;
                    let btd = self.btype[CAT_D].current as usize;
                    let tree = self.distance_map.get(btd, ctx) as usize;
                    if tree >= self.distance_forest.len() {
                        return Err(ApiError::Sanitize);
                    }
                    self.dist_tree = tree;
                    self.state = BrState::DistCode;
                    self.bits = 0;
                    self.bit_length = 0;
                    continue;
                }
                BrState::DistCode => {
                    let decoded = if let Some(v) = singular_value(&self.distance_forest[self.dist_tree])
                    {
                        Some(v)
                    } else {
                        let x = need_bit!(x, took);
                        code_step(
                            &self.distance_forest[self.dist_tree],
                            &mut self.bits,
                            &mut self.bit_length,
                            x,
                        )?
                    };
                    if let Some(dcode) = decoded {
                        if dcode >= self.ring.alphabet_size() {
                            return Err(ApiError::Sanitize);
                        }
                        let extra = self.ring.bit_count(dcode);
                        if extra > 0 {
                            self.index = dcode;
                            self.extra_length = extra as u16;
                            self.bits = 0;
                            self.bit_length = 0;
                            self.backward = 0;
                            self.state = BrState::DistExtra;
                            continue;
                        }
                        let flat = self.ring.decode(dcode, 0)?;
                        self.backward = flat;
                        self.state = BrState::CopyLoop;
                        continue;
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::DistExtra => {
                    let x = need_bit!(x, took);
                    self.backward |= x << self.bit_length;
                    self.bit_length += 1;
                    if self.bit_length >= self.extra_length {
                        let flat = self.ring.decode(self.index, self.backward)?;
                        self.backward = flat;
                        self.bits = 0;
                        self.bit_length = 0;
                        self.state = BrState::CopyLoop;
                        continue;
                    }
                    return Ok((Progress::Success, took));
                }
                BrState::CopyLoop => {
                    if self.backward == 0 {
                        return Err(ApiError::Sanitize);
                    }
                    if self.metablock_pos + self.copy_len > self.mlen {
                        return Err(ApiError::Sanitize);
                    }
                    while self.copy_len > 0 {
                        if *dst_pos >= dst.len() {
                            return Ok((Progress::Partial, took));
                        }
                        let byte = self
                            .buffer
                            .peek(self.backward - 1)
                            .map_err(|_| ApiError::Sanitize)?;
                        self.emit(byte, dst, dst_pos);
                        self.metablock_pos += 1;
                        self.copy_len -= 1;
                    }
                    if self.metablock_pos >= self.mlen {
                        match self.end_metablock() {
                            Some(p) => return Ok((p, took)),
                            None => continue,
                        }
                    }
                    self.state = BrState::CmdStart;
                    continue;
                }
                /* byte-level and output-direction states never enter the
                 * decode bit pump */
                _ => return Err(ApiError::Unknown),
            }
        }
    }

    fn cmap_cell_set(&mut self, v: u8) -> Result<(), ApiError> {
        let idx = self.index as usize;
        let map = if self.cmap_is_dist {
            &mut self.distance_map
        } else {
            &mut self.literals_map
        };
        if idx >= map.data().len() {
            return Err(ApiError::Sanitize);
        }
        map.data_mut()[idx] = v;
        Ok(())
    }

    /* `Some(progress)` ends the call (stream finished); `None` means a
     * fresh meta-block header follows. */
    fn end_metablock(&mut self) -> Option<Progress> {
        self.bits = 0;
        self.bit_length = 0;
        self.count = 0;
        self.backward = 0;
        if self.h_end != 0 {
            self.state = BrState::Done;
            return Some(Progress::EndOfFile);
        }
        self.enter_meta_header();
        None
    }

    fn after_meta_align(&mut self, took: bool) -> Result<(Progress, bool), ApiError> {
        if self.backward > 0 {
            self.state = BrState::MetaPayload;
            self.count = 0;
            return Ok((Progress::Success, took));
        }
        if self.h_end != 0 {
            self.state = BrState::Done;
            return Ok((Progress::EndOfFile, took));
        }
        self.enter_meta_header();
        Ok((Progress::Success, took))
    }

    fn in_stored_byte(&mut self, byte: u8, dst: &mut [u8], dst_pos: &mut usize) -> ApiResult {
        if self.count < self.mlen {
            if *dst_pos >= dst.len() {
                return Ok(Progress::Partial);
            }
            self.emit(byte, dst, dst_pos);
            self.count += 1;
        }
        if self.count >= self.mlen {
            /* uncompressed blocks cannot be last */
            self.enter_meta_header();
        }
        Ok(Progress::Success)
    }

    fn in_meta_byte(&mut self, byte: u8) -> ApiResult {
        if self.count == 0 {
            let keep = (self.backward as usize).min(self.max_len_meta);
            if keep > 0 {
                self.meta_index = self.metadata.size();
                self.metadata.emplace(keep)?;
            }
        }
        if self.count < self.backward {
            let keep = (self.backward as usize).min(self.max_len_meta);
            if (self.count as usize) < keep {
                self.metadata.get_mut(self.meta_index).unwrap()[self.count as usize] = byte;
            }
            self.count += 1;
        }
        if self.count >= self.backward {
            if self.h_end != 0 {
                self.state = BrState::Done;
                return Ok(Progress::EndOfFile);
            }
            self.enter_meta_header();
        }
        Ok(Progress::Success)
    }

    /*
     * Encode: plain bytes in, Brotli stream out.
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
            match self.state {
                BrState::Done => {
                    result = Ok(Progress::EndOfFile);
                    break;
                }
                BrState::MetaPayload => {
                    dst[*dst_pos] = self.metadata[self.meta_index][self.count as usize];
                    *dst_pos += 1;
                    self.count += 1;
                    if self.count >= self.backward {
                        self.meta_index += 1;
                        self.count = 0;
                        self.next_out_block();
                    }
                }
                _ => match self.out_bits(src, src_pos, dst, dst_pos) {
                    Ok(Progress::Success) => {}
                    other => {
                        result = other;
                        break;
                    }
                },
            }
        }
        result
    }

    /* Finish the stream with the last-empty meta-block marker. */
    pub fn unshift(&mut self, dst: &mut [u8], dst_pos: &mut usize) -> ApiResult {
        self.h_end |= 2;
        let src: [u8; 0] = [];
        let mut src_pos = 0;
        self.convert_out(&src, &mut src_pos, dst, dst_pos)
    }

    /* Emit pending data, then an empty metadata block as an align point. */
    pub fn flush(&mut self, dst: &mut [u8], dst_pos: &mut usize) -> ApiResult {
        self.emptymeta = true;
        let src: [u8; 0] = [];
        let mut src_pos = 0;
        self.convert_out(&src, &mut src_pos, dst, dst_pos)
    }

    fn next_out_block(&mut self) {
        if self.meta_index < self.metadata.size() || self.emptymeta {
            self.state = BrState::MetaStart;
            self.bit_length = 0;
        } else if self.h_end & 2 != 0 {
            self.state = BrState::LastCheck;
            self.count = 0;
        } else {
            self.state = BrState::BlockStart;
            self.count = 0;
        }
    }

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
            if self.state == BrState::BlockStart {
                let space = self.buffer.capacity() - self.buffer.input_size();
                let take = (space as usize).min(src.len() - *src_pos);
                if take > 0 {
                    self.buffer.write(&src[*src_pos..*src_pos + take])?;
                    *src_pos += take;
                }
            }
            match self.out_bit_step(i) {
                Ok(x) => {
                    y |= (x as u8) << i;
                    i += 1;
                }
                Err(None) => {
                    if *src_pos < src.len() {
                        /* more caller input can feed the next block */
                        continue;
                    }
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

    fn out_bit_step(&mut self, i: u32) -> Result<u32, Option<ApiError>> {
        loop {
            match self.state {
                BrState::Wbits => {
                    if self.extra_length == 0 {
                        let mut line = None;
                        for j in 0..self.wbits.size() {
                            if self.wbits[j].value == self.wbits_select as u32 {
                                line = Some(self.wbits[j]);
                                break;
                            }
                        }
                        let line = line.ok_or(Some(ApiError::Init))?;
                        self.bits = line.code as u32;
                        self.extra_length = line.len;
                        self.bit_length = 0;
                    }
                    let x = (self.bits >> (self.extra_length - 1 - self.bit_length)) & 1;
                    self.bit_length += 1;
                    if self.bit_length >= self.extra_length {
                        self.state = BrState::BlockStart;
                        self.bits = 0;
                        self.bit_length = 0;
                        self.extra_length = 0;
                        self.count = 0;
                    }
                    return Ok(x);
                }
                BrState::BlockStart => {
                    if self.buffer.input_size() == 0 {
                        if self.meta_index < self.metadata.size() || self.emptymeta {
                            self.state = BrState::MetaStart;
                            self.bit_length = 0;
                            continue;
                        }
                        if self.h_end & 2 != 0 {
                            self.state = BrState::LastCheck;
                            self.count = 0;
                            continue;
                        }
                        return Err(None);
                    }
                    self.stage_block(i).map_err(Some)?;
                    self.state = BrState::EmitStaged;
                    continue;
                }
                BrState::EmitStaged => match self.fwd.pop_bit() {
                    Some(b) => return Ok(b),
                    None => {
                        self.state = BrState::BlockStart;
                        self.count = 0;
                        continue;
                    }
                },
                BrState::MetaStart => {
                    if self.bit_length == 0 {
                        let actual = self.meta_index < self.metadata.size();
                        let sz = if actual {
                            self.metadata[self.meta_index].len()
                        } else {
                            0
                        };
                        self.emptymeta = false;
                        self.backward = sz as u32;
                        self.bits = 6;
                        if sz > 65536 {
                            self.bits |= 48;
                        } else if sz > 256 {
                            self.bits |= 32;
                        } else if sz > 0 {
                            self.bits |= 16;
                        }
                        self.count = 0;
                        self.bit_length = 1;
                    }
                    let x = (self.bits >> self.count) & 1;
                    self.count += 1;
                    if self.count >= 6 {
                        self.bit_length = 0;
                        if self.backward > 0 {
                            self.extra_length = (((self.bits >> 4) & 3) * 8) as u16;
                            self.state = BrState::MetaLength;
                            self.count = 0;
                        } else if i == 7 {
                            self.next_out_block();
                        } else {
                            self.state = BrState::MetaPad;
                        }
                        self.bits = 0;
                    }
                    return Ok(x);
                }
                BrState::MetaLength => {
                    let x = ((self.backward - 1) >> self.count) & 1;
                    self.count += 1;
                    if self.count >= self.extra_length as u32 {
                        self.count = 0;
                        if i == 7 {
                            self.state = BrState::MetaPayload;
                        } else {
                            self.state = BrState::MetaPad;
                        }
                    }
                    return Ok(x);
                }
                BrState::MetaPad => {
                    if i == 7 {
                        if self.backward > 0 {
                            self.state = BrState::MetaPayload;
                            self.count = 0;
                        } else {
                            self.next_out_block();
                        }
                    }
                    return Ok(0);
                }
                BrState::LastCheck => {
                    self.count += 1;
                    if self.count >= 2 {
                        self.state = BrState::Done;
                        self.count = 0;
                    }
                    return Ok(1);
                }
                BrState::Done => return Ok(0),
                _ => return Err(Some(ApiError::Unknown)),
            }
        }
    }

    fn ensure_length_sorted(&mut self) {
        if !self.values_length_sorted {
            self.values.lengthsort();
            self.values_length_sorted = true;
        }
    }

    /*
     * Gather the pending input into one meta-block: plan the command
     * layout against trial state, stage the compressed form, and fall
     * back to an uncompressed meta-block when it estimates smaller.
     */
    fn stage_block(&mut self, phase: u32) -> Result<(), ApiError> {
        self.ensure_length_sorted();
        self.buffer.clear_output();
        self.buffer.try_block()?;
        let mlen = self.buffer.input_size();
        self.try_ring = self.ring;
        self.lit_histogram.iter_mut().for_each(|v| *v = 0);
        self.ins_histogram.iter_mut().for_each(|v| *v = 0);
        self.dist_histogram.iter_mut().for_each(|v| *v = 0);

        let mut plan: Vec<PlanCmd> = Vec::new();
        let mut pending_insert: u32 = 0;
        let mut parse: Result<(), ApiError> = Ok(());
        {
            for cmd in commands(self.buffer.str()) {
                match cmd {
                    Ok(Command::Insert(payload)) => {
                        for &b in payload {
                            self.lit_histogram[b as usize] += 1;
                        }
                        pending_insert += payload.len() as u32;
                    }
                    Ok(Command::Copy { len, distance }) => {
                        let r = plan_command(
                            &mut plan,
                            &self.values,
                            &mut self.try_ring,
                            &mut self.ins_histogram,
                            &mut self.dist_histogram,
                            pending_insert,
                            len,
                            Some(distance + 1),
                        );
                        if let Err(e) = r {
                            parse = Err(e);
                            break;
                        }
                        pending_insert = 0;
                    }
                    Ok(Command::BdictRef { .. }) => {
                        parse = Err(ApiError::Sanitize);
                        break;
                    }
                    Err(e) => {
                        parse = Err(e);
                        break;
                    }
                }
            }
        }
        parse?;
        if pending_insert > 0 {
            plan_command(
                &mut plan,
                &self.values,
                &mut self.try_ring,
                &mut self.ins_histogram,
                &mut self.dist_histogram,
                pending_insert,
                2,
                None,
            )?;
        }

        self.fwd.reset(phase);
        self.stage_compressed(mlen, &plan)?;
        let stored_bits = 8 * mlen as usize + 40;
        if self.fwd.len_bits() > stored_bits {
            log::debug!(
                "uncompressed meta-block wins: {} vs {} bits",
                stored_bits,
                self.fwd.len_bits()
            );
            self.fwd.reset(phase);
            self.stage_uncompressed(mlen);
        } else {
            /* the trial ring becomes real with the compressed layout */
            self.ring = self.try_ring;
        }
        self.buffer.clear_input();
        Ok(())
    }

    fn stage_compressed(&mut self, mlen: u32, plan: &[PlanCmd]) -> Result<(), ApiError> {
        self.fwd.push_bits(0, 1); /* ISLAST */
        push_mlen(&mut self.fwd, mlen);
        self.fwd.push_bits(0, 1); /* ISUNCOMPRESSED */
        /* one block type per category */
        self.fwd.push_bits(0, 1);
        self.fwd.push_bits(0, 1);
        self.fwd.push_bits(0, 1);
        /* NPOSTFIX = 0, NDIRECT = 0 */
        self.fwd.push_bits(0, 2);
        self.fwd.push_bits(0, 4);
        /* literal context mode, guessed over the raw input */
        let mut score = ContextScore::default();
        ctxtspan_guess(&mut score, self.buffer.input());
        let mode = score.best();
        self.fwd.push_bits(mode.bits(), 2);
        /* NTREESL = 1, NTREESD = 1 */
        self.fwd.push_bits(0, 1);
        self.fwd.push_bits(0, 1);

        let lit_table = emit_tree(
            &mut self.fwd,
            &self.lit_histogram,
            BROTLI_NUM_LITERAL_SYMS,
        )?;
        let ins_table = emit_tree(
            &mut self.fwd,
            &self.ins_histogram,
            BROTLI_NUM_INSCOPY_SYMS,
        )?;
        let dist_table = emit_tree(&mut self.fwd, &self.dist_histogram, 64)?;

        /* second pass: interleave commands and literals */
        let mut pc = 0usize;
        let mut pending: Vec<u8> = Vec::new();
        let mut flush_command =
            |fwd: &mut ForwardBox, pending: &mut Vec<u8>, cmd: &PlanCmd| {
                let line = ins_table[cmd.code as usize];
                fwd.push_code(line.code, line.len);
                fwd.push_bits(cmd.ins_extra, cmd.ins_extra_bits as u32);
                fwd.push_bits(cmd.copy_extra, cmd.copy_extra_bits as u32);
                for &b in pending.iter() {
                    let lit = lit_table[b as usize];
                    fwd.push_code(lit.code, lit.len);
                }
                pending.clear();
                if let Some((dcode, extra, ebits)) = cmd.dist {
                    let dline = dist_table[dcode as usize];
                    fwd.push_code(dline.code, dline.len);
                    fwd.push_bits(extra, ebits);
                }
            };
        for cmd in commands(self.buffer.str()) {
            match cmd? {
                Command::Insert(payload) => pending.extend_from_slice(payload),
                Command::Copy { .. } => {
                    flush_command(&mut self.fwd, &mut pending, &plan[pc]);
                    pc += 1;
                }
                Command::BdictRef { .. } => return Err(ApiError::Sanitize),
            }
        }
        if !pending.is_empty() {
            flush_command(&mut self.fwd, &mut pending, &plan[pc]);
            pc += 1;
        }
        debug_assert_eq!(pc, plan.len());
        Ok(())
    }

    fn stage_uncompressed(&mut self, mlen: u32) {
        self.fwd.push_bits(0, 1); /* ISLAST */
        push_mlen(&mut self.fwd, mlen);
        self.fwd.push_bits(1, 1); /* ISUNCOMPRESSED */
        self.fwd.align_byte();
        self.fwd.push_bytes(self.buffer.input());
    }
}

/*
 * Feed one bit of a prefix code; `Some(value)` once a code completes.
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
    if *bit_length >= BROTLI_MAX_CODEWORD_LEN {
        return Err(ApiError::Sanitize);
    }
    Ok(None)
}

fn push_mlen(fwd: &mut ForwardBox, mlen: u32) {
    let (code, nibbles) = if mlen <= 1 << 16 {
        (0, 4)
    } else if mlen <= 1 << 20 {
        (1, 5)
    } else {
        (2, 6)
    };
    fwd.push_bits(code, 2);
    fwd.push_bits(mlen - 1, nibbles * 4);
}

#[allow(clippy::too_many_arguments)]
fn plan_command(
    plan: &mut Vec<PlanCmd>,
    values: &InsertCopyTable,
    try_ring: &mut DistanceRing,
    ins_histogram: &mut PrefixHistogram,
    dist_histogram: &mut PrefixHistogram,
    insert_len: u32,
    copy_len: u32,
    flat: Option<u32>,
) -> Result<(), ApiError> {
    let mut dist = None;
    let mut implicit = false;
    if let Some(flat) = flat {
        let last = {
            let mut probe = *try_ring;
            probe.decode(0, 0)?
        };
        if flat == last && values.encode(insert_len, copy_len, true) != NOT_FOUND {
            implicit = true;
        } else {
            let mut extra = 0;
            let dcode = try_ring.encode(flat, &mut extra)?;
            let ebits = try_ring.bit_count(dcode);
            dist_histogram[dcode as usize] += 1;
            dist = Some((dcode, extra, ebits));
        }
    }
    let idx = values.encode(insert_len, copy_len, implicit);
    if idx == NOT_FOUND {
        return Err(ApiError::InsCopyMissing);
    }
    let row = values[idx];
    ins_histogram[row.code as usize] += 1;
    plan.push(PlanCmd {
        code: row.code,
        ins_extra: insert_len - row.insert_first as u32,
        ins_extra_bits: row.insert_bits,
        copy_extra: copy_len - row.copy_first as u32,
        copy_extra_bits: row.copy_bits,
        dist,
    });
    Ok(())
}

/*
 * Serialize one prefix code (RFC 7932 section 3.4/3.5) and return a
 * value-indexed table for emitting its symbols.  Up to four coded
 * symbols travel as a simple code; larger sets as a complex code whose
 * zero runs use code 17 with a literal zero wedged between consecutive
 * repeats, so the run accumulation rule never fires.
 */
fn emit_tree(
    fwd: &mut ForwardBox,
    hist: &[u32],
    alphabet: usize,
) -> Result<PrefixList, ApiError> {
    let used: Vec<usize> = hist[..alphabet]
        .iter()
        .enumerate()
        .filter(|(_, &f)| f > 0)
        .map(|(i, _)| i)
        .collect();
    let alphabits = 32 - (alphabet as u32 - 1).leading_zeros();
    let mut table = PrefixList::new(alphabet);
    table.identity_values();
    match used.len() {
        0 | 1 => {
            let sym = used.first().copied().unwrap_or(0);
            fwd.push_bits(1, 2);
            fwd.push_bits(0, 2);
            fwd.push_bits(sym as u32, alphabits);
            /* zero-bit code: emitting the symbol costs nothing */
            table[sym].len = 0;
            table[sym].code = 0;
        }
        n @ 2..=4 => {
            let mut syms: Vec<u32> = used.iter().map(|&s| s as u32).collect();
            if n == 3 {
                let best = (0..3)
                    .max_by_key(|&j| hist[syms[j] as usize])
                    .unwrap();
                syms.swap(0, best);
                syms[1..].sort_unstable();
            } else {
                syms.sort_unstable();
            }
            fwd.push_bits(1, 2);
            fwd.push_bits((n - 1) as u32, 2);
            for &s in &syms {
                fwd.push_bits(s, alphabits);
            }
            if n == 4 {
                fwd.push_bits(0, 1);
            }
            let decoded = build_simple(&mut syms, 0);
            for line in decoded.iter() {
                table[line.value as usize].code = line.code;
                table[line.value as usize].len = line.len;
            }
        }
        _ => {
            table.gen_lengths(hist, 15)?;
            table.gen_codes()?;
            let lens: Vec<u16> = table.iter().map(|l| l.len).collect();
            let seq = length_sequence(&lens);
            let mut clen_hist = vec![0u32; BROTLI_NUM_CLEN_SYMS];
            for &(sym, _, _) in &seq {
                clen_hist[sym as usize] += 1;
            }
            let mut clen = PrefixList::new(BROTLI_NUM_CLEN_SYMS);
            clen.identity_values();
            clen.gen_lengths(&clen_hist, 5)?;
            clen.gen_codes()?;
            let clen_nonzero = clen_hist.iter().filter(|&&f| f > 0).count();
            let fixed = PrefixList::preset(PrefixPreset::BrotliComplex);
            fwd.push_bits(0, 2); /* HSKIP */
            let mut space = 0u32;
            for &sym in BROTLI_CLEN_PERMUTATION.iter() {
                let len = clen[sym as usize].len;
                let f = fixed[len as usize];
                fwd.push_code(f.code, f.len);
                if len > 0 {
                    space += BROTLI_CLEN_CODE_SPACE >> len;
                    if space == BROTLI_CLEN_CODE_SPACE {
                        break;
                    }
                }
            }
            if clen_nonzero >= 2 {
                for (sym, extra, ebits) in seq {
                    let line = clen[sym as usize];
                    fwd.push_code(line.code, line.len);
                    if ebits > 0 {
                        fwd.push_bits(extra, ebits as u32);
                    }
                }
            }
            /* a single used code-length symbol decodes from zero bits and
             * terminates on the code space alone */
        }
    }
    Ok(table)
}

/* RLE a symbol-length vector, stopping when the code space saturates. */
fn length_sequence(lens: &[u16]) -> Vec<(u8, u32, u8)> {
    let mut out = Vec::new();
    let mut space = 0u32;
    let mut i = 0usize;
    while i < lens.len() && space < BROTLI_CODE_SPACE {
        if lens[i] == 0 {
            let mut j = i;
            while j < lens.len() && lens[j] == 0 {
                j += 1;
            }
            let mut run = (j - i) as u32;
            while run > 0 {
                if run < 3 {
                    for _ in 0..run {
                        out.push((0, 0, 0));
                    }
                    run = 0;
                } else {
                    let c = run.min(10);
                    out.push((17, c - 3, 3));
                    run -= c;
                    if run > 0 {
                        out.push((0, 0, 0));
                        run -= 1;
                    }
                }
            }
            i = j;
        } else {
            let len = lens[i];
            out.push((len as u8, 0, 0));
            space += BROTLI_CODE_SPACE >> len;
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all(state: &mut BrotliCvt, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 129];
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

    fn decode_all(state: &mut BrotliCvt, data: &[u8]) -> Result<Vec<u8>, ApiError> {
        let mut out = Vec::new();
        let mut buf = [0u8; 61];
        let mut sp = 0usize;
        loop {
            let mut dp = 0usize;
            let pr = state.convert_in(data, &mut sp, &mut buf, &mut dp)?;
            out.extend_from_slice(&buf[..dp]);
            match pr {
                Progress::EndOfFile => return Ok(out),
                Progress::Partial => {}
                Progress::Success => {
                    if sp >= data.len() && dp == 0 {
                        return Err(ApiError::Sanitize);
                    }
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
    fn minimal_empty_stream() {
        /* window pattern 0, ISLAST, ISLASTEMPTY */
        let mut st = BrotliCvt::new(4096, 65536, 64);
        let mut sp = 0usize;
        let mut buf = [0u8; 8];
        let mut dp = 0usize;
        let pr = st.convert_in(&[0x06], &mut sp, &mut buf, &mut dp).unwrap();
        assert_eq!(pr, Progress::EndOfFile);
        assert_eq!(dp, 0);
    }

    #[test]
    fn empty_encode_roundtrip() {
        let mut enc = BrotliCvt::new(4096, 65536, 64);
        let stream = encode_all(&mut enc, b"");
        let mut dec = BrotliCvt::new(4096, 65536, 64);
        assert_eq!(decode_all(&mut dec, &stream).unwrap(), b"");
    }

    #[test]
    fn flush_then_unshift_is_one_empty_metadata_block() {
        let mut enc = BrotliCvt::new(4096, 65536, 64);
        let mut out = Vec::new();
        let mut buf = [0u8; 32];
        loop {
            let mut dp = 0usize;
            let pr = enc.flush(&mut buf, &mut dp).unwrap();
            out.extend_from_slice(&buf[..dp]);
            if pr == Progress::Partial {
                break;
            }
        }
        /* flush must land on a byte boundary: the seven window bits, six
         * metadata header bits, and the padding make two whole bytes */
        assert_eq!(out.len(), 2);
        loop {
            let mut dp = 0usize;
            let pr = enc.unshift(&mut buf, &mut dp).unwrap();
            out.extend_from_slice(&buf[..dp]);
            if pr == Progress::EndOfFile {
                break;
            }
        }
        let mut dec = BrotliCvt::new(4096, 65536, 64);
        assert_eq!(decode_all(&mut dec, &out).unwrap(), b"");
    }

    #[test]
    fn roundtrip_text() {
        let data: Vec<u8> = b"it was the best of times, it was the worst of times, \
            it was the age of wisdom, it was the age of foolishness, "
            .iter()
            .cycle()
            .take(20000)
            .copied()
            .collect();
        let mut enc = BrotliCvt::new(4096, 65536, 256);
        let stream = encode_all(&mut enc, &data);
        assert!(stream.len() < data.len() / 2, "stream {} bytes", stream.len());
        let mut dec = BrotliCvt::new(4096, 65536, 256);
        assert_eq!(decode_all(&mut dec, &stream).unwrap(), data);
    }

    #[test]
    fn roundtrip_random() {
        for (len, seed) in [(1usize, 99u32), (64, 4), (4096, 8), (32768, 2)] {
            let data = xorshift_bytes(len, seed);
            let mut enc = BrotliCvt::new(4096, 65536, 128);
            let stream = encode_all(&mut enc, &data);
            let mut dec = BrotliCvt::new(4096, 65536, 128);
            assert_eq!(decode_all(&mut dec, &stream).unwrap(), data, "len {}", len);
        }
    }

    #[test]
    fn roundtrip_uniform() {
        /* a single-symbol block exercises the zero-bit literal tree */
        let data = vec![0x61u8; 10000];
        let mut enc = BrotliCvt::new(4096, 65536, 64);
        let stream = encode_all(&mut enc, &data);
        let mut dec = BrotliCvt::new(4096, 65536, 64);
        assert_eq!(decode_all(&mut dec, &stream).unwrap(), data);
    }

    #[test]
    fn roundtrip_small_blocks() {
        let data = xorshift_bytes(3000, 77);
        let mut enc = BrotliCvt::new(96, 4096, 32);
        let stream = encode_all(&mut enc, &data);
        let mut dec = BrotliCvt::new(4096, 65536, 32);
        assert_eq!(decode_all(&mut dec, &stream).unwrap(), data);
    }

    #[test]
    fn partial_continuation_one_byte_out() {
        let data: Vec<u8> = b"suspend and resume at every byte boundary. "
            .iter()
            .cycle()
            .take(5000)
            .copied()
            .collect();
        let mut enc = BrotliCvt::new(4096, 65536, 128);
        let stream = encode_all(&mut enc, &data);

        let mut dec = BrotliCvt::new(4096, 65536, 128);
        let mut out = Vec::new();
        let mut one = [0u8; 1];
        let mut sp = 0usize;
        loop {
            let mut dp = 0usize;
            let pr = dec.convert_in(&stream, &mut sp, &mut one, &mut dp).unwrap();
            out.extend_from_slice(&one[..dp]);
            if pr == Progress::EndOfFile {
                break;
            }
        }
        assert_eq!(out, data);
    }

    #[test]
    fn byte_at_a_time_input() {
        let data: Vec<u8> = b"one byte of stream at a time, please. "
            .iter()
            .cycle()
            .take(3000)
            .copied()
            .collect();
        let mut enc = BrotliCvt::new(512, 65536, 64);
        let stream = encode_all(&mut enc, &data);

        let mut dec = BrotliCvt::new(512, 65536, 64);
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        let mut done = false;
        for chunk in stream.chunks(1) {
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
    fn metadata_roundtrip() {
        let mut enc = BrotliCvt::new(4096, 65536, 64);
        enc.metadata_mut().push(b"side channel").unwrap();
        enc.metadata_mut().push(&vec![7u8; 400]).unwrap();
        let stream = encode_all(&mut enc, b"payload payload payload");
        let mut dec = BrotliCvt::new(4096, 65536, 64);
        dec.set_max_len_meta(1 << 20);
        assert_eq!(decode_all(&mut dec, &stream).unwrap(), b"payload payload payload");
        assert_eq!(dec.metadata().size(), 2);
        assert_eq!(dec.metadata()[0].as_slice(), b"side channel");
        assert_eq!(dec.metadata()[1].as_slice(), &vec![7u8; 400][..]);
    }

    #[test]
    fn metadata_capped_by_max_len() {
        let mut enc = BrotliCvt::new(4096, 65536, 64);
        enc.metadata_mut().push(&vec![9u8; 2000]).unwrap();
        let stream = encode_all(&mut enc, b"x");
        let mut dec = BrotliCvt::new(4096, 65536, 64);
        dec.set_max_len_meta(16);
        decode_all(&mut dec, &stream).unwrap();
        assert_eq!(dec.metadata().size(), 1);
        assert_eq!(dec.metadata()[0].len(), 16);
        assert_eq!(dec.metadata()[0].as_slice(), &[9u8; 16][..]);
    }

    #[test]
    fn rejects_reserved_window_pattern() {
        /* read order 1,0,0,0,1,0,0 selects the reserved value */
        let byte = 0b0001_0001u8;
        let mut st = BrotliCvt::new(4096, 65536, 64);
        let mut sp = 0usize;
        let mut buf = [0u8; 4];
        let mut dp = 0usize;
        assert_eq!(
            st.convert_in(&[byte], &mut sp, &mut buf, &mut dp),
            Err(ApiError::Sanitize)
        );
    }

    #[test]
    fn bypass_seeds_encoder_window() {
        let dict = b"some shared context ";
        let mut enc = BrotliCvt::new(4096, 65536, 128);
        enc.bypass(dict).unwrap();
        let stream = encode_all(&mut enc, b"some shared context again");
        let mut dec = BrotliCvt::new(4096, 65536, 128);
        dec.bypass(dict).unwrap();
        assert_eq!(
            decode_all(&mut dec, &stream).unwrap(),
            b"some shared context again"
        );
    }
}
