use crate::brotli_constants::{BROTLI_NUM_BLOCKCOUNT_SYMS, BROTLI_NUM_INSCOPY_SYMS};
use crate::prefix_list::NOT_FOUND;

/*
 * The literal/length/block-count alphabets of DEFLATE and Brotli as typed
 * rows.  One table per alphabet; sorted by code for decoding and by the
 * length windows for encoding.
 */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertCopyPreset {
    /* DEFLATE 286-code literal/length alphabet. */
    Deflate,
    /* Brotli 704-code insert-and-copy-length alphabet. */
    BrotliInsertCopy,
    /* Brotli 26-code block count alphabet. */
    BrotliBlockCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InsertCopyType {
    /* Plain literal value. */
    Literal,
    /* DEFLATE block stop code. */
    Stop,
    /* Standalone insert length. */
    Insert,
    /* Copy length. */
    Copy,
    /*
     * Copy length whose extra-bit window admits one value less than its
     * width suggests.  DEFLATE code 284 covers 227..=257 only, leaving
     * 258 to code 285.  Sorts as `Copy`.
     */
    CopyMinus1,
    /* Combined Brotli insert-and-copy code. */
    InsertCopy,
    /* Brotli block count code. */
    BlockCount,
}

impl InsertCopyType {
    fn sort_rank(self) -> u8 {
        match self {
            InsertCopyType::Literal => 0,
            InsertCopyType::Stop => 1,
            InsertCopyType::Insert => 2,
            InsertCopyType::Copy | InsertCopyType::CopyMinus1 => 3,
            InsertCopyType::InsertCopy => 4,
            InsertCopyType::BlockCount => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertCopyRow {
    pub ty: InsertCopyType,
    /* Whether this row implies a reused (omitted) back distance. */
    pub zero_distance: bool,
    /* Extra bits for the insert length (or the block count). */
    pub insert_bits: u8,
    /* Extra bits for the copy length. */
    pub copy_bits: u8,
    /* First insert length (or block count) in the window. */
    pub insert_first: u16,
    /* First copy length in the window. */
    pub copy_first: u16,
    /* Alphabet value. */
    pub code: u16,
}

impl InsertCopyRow {
    fn length_key(&self) -> (u8, bool, u16, u16) {
        (
            self.ty.sort_rank(),
            self.zero_distance,
            self.insert_first,
            self.copy_first,
        )
    }

    /* Width of the copy window, one short for `CopyMinus1`. */
    fn copy_span(&self) -> u32 {
        let full = 1u32 << self.copy_bits;
        if self.ty == InsertCopyType::CopyMinus1 {
            full - 1
        } else {
            full
        }
    }

    fn insert_span(&self) -> u32 {
        1u32 << self.insert_bits
    }

    fn contains(&self, insert_len: u32, copy_len: u32, zero_distance: bool) -> bool {
        self.zero_distance == zero_distance
            && insert_len >= self.insert_first as u32
            && insert_len - self.insert_first as u32 <= self.insert_span() - 1
            && copy_len >= self.copy_first as u32
            && self.copy_span() > 0
            && copy_len - self.copy_first as u32 <= self.copy_span() - 1
    }
}

#[derive(Debug, Clone, Default)]
pub struct InsertCopyTable {
    rows: Vec<InsertCopyRow>,
}

/* (bits, first) pairs of the Brotli insert length codes, RFC 7932 sec. 5. */
const BROTLI_INSERT_TABS: [(u8, u16); 24] = [
    (0, 0),
    (0, 1),
    (0, 2),
    (0, 3),
    (0, 4),
    (0, 5),
    (1, 6),
    (1, 8),
    (2, 10),
    (2, 14),
    (3, 18),
    (3, 26),
    (4, 34),
    (4, 50),
    (5, 66),
    (5, 98),
    (6, 130),
    (7, 194),
    (8, 322),
    (9, 578),
    (10, 1090),
    (12, 2114),
    (14, 6210),
    (24, 22594),
];

/* (bits, first) pairs of the Brotli copy length codes. */
const BROTLI_COPY_TABS: [(u8, u16); 24] = [
    (0, 2),
    (0, 3),
    (0, 4),
    (0, 5),
    (0, 6),
    (0, 7),
    (0, 8),
    (0, 9),
    (1, 10),
    (1, 12),
    (2, 14),
    (2, 18),
    (3, 22),
    (3, 30),
    (4, 38),
    (4, 54),
    (5, 70),
    (5, 102),
    (6, 134),
    (7, 198),
    (8, 326),
    (9, 582),
    (10, 1094),
    (24, 2118),
];

/*
 * The eleven (zero-distance, insert-start, copy-start) cells of the
 * insert-and-copy cross product, in code order of the 64-code blocks.
 */
const BROTLI_IC_MATRIX: [(bool, u16, u16); 11] = [
    (true, 0, 0),
    (true, 0, 8),
    (false, 0, 0),
    (false, 0, 8),
    (false, 8, 0),
    (false, 8, 8),
    (false, 0, 16),
    (false, 16, 0),
    (false, 8, 16),
    (false, 16, 8),
    (false, 16, 16),
];

const BROTLI_BLOCKCOUNT_BITS: [u8; BROTLI_NUM_BLOCKCOUNT_SYMS] = [
    2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 6, 6, 7, 8, 9, 10, 11, 12, 13, 24,
];

const_assert!(BROTLI_NUM_INSCOPY_SYMS == BROTLI_IC_MATRIX.len() * 64);

fn deflate_fill() -> Vec<InsertCopyRow> {
    let mut rows = Vec::with_capacity(286);
    let blank = |ty, code: u16| InsertCopyRow {
        ty,
        zero_distance: false,
        insert_bits: 0,
        copy_bits: 0,
        insert_first: 0,
        copy_first: 0,
        code,
    };
    for code in 0..256 {
        rows.push(blank(InsertCopyType::Literal, code));
    }
    rows.push(blank(InsertCopyType::Stop, 256));
    /* length codes 257..=284: bases 3..227 with the standard bit widths */
    let mut first: u16 = 3;
    let mut bits: u8 = 0;
    for code in 257u16..=284 {
        let ty = if code == 284 {
            InsertCopyType::CopyMinus1
        } else {
            InsertCopyType::Copy
        };
        rows.push(InsertCopyRow {
            ty,
            zero_distance: false,
            insert_bits: 0,
            copy_bits: bits,
            insert_first: 0,
            copy_first: first,
            code,
        });
        first += 1 << bits;
        if code >= 264 && (code % 4) == 0 {
            bits += 1;
        }
    }
    /* code 285 is length 258 exactly */
    rows.push(InsertCopyRow {
        ty: InsertCopyType::Copy,
        zero_distance: false,
        insert_bits: 0,
        copy_bits: 0,
        insert_first: 0,
        copy_first: 258,
        code: 285,
    });
    rows
}

fn brotli_ic_fill() -> Vec<InsertCopyRow> {
    let mut rows = Vec::with_capacity(BROTLI_NUM_INSCOPY_SYMS);
    for code in 0..BROTLI_NUM_INSCOPY_SYMS {
        let (zero_distance, insert_start, copy_start) = BROTLI_IC_MATRIX[code / 64];
        let insert_code = insert_start as usize + ((code >> 3) & 7);
        let copy_code = copy_start as usize + (code & 7);
        let (insert_bits, insert_first) = BROTLI_INSERT_TABS[insert_code];
        let (copy_bits, copy_first) = BROTLI_COPY_TABS[copy_code];
        rows.push(InsertCopyRow {
            ty: InsertCopyType::InsertCopy,
            zero_distance,
            insert_bits,
            copy_bits,
            insert_first,
            copy_first,
            code: code as u16,
        });
    }
    rows
}

fn brotli_blockcount_fill() -> Vec<InsertCopyRow> {
    let mut rows = Vec::with_capacity(BROTLI_NUM_BLOCKCOUNT_SYMS);
    let mut first: u32 = 1;
    for (code, &bits) in BROTLI_BLOCKCOUNT_BITS.iter().enumerate() {
        rows.push(InsertCopyRow {
            ty: InsertCopyType::BlockCount,
            zero_distance: false,
            insert_bits: bits,
            copy_bits: 0,
            insert_first: first as u16,
            copy_first: 0,
            code: code as u16,
        });
        first += 1 << bits;
    }
    rows
}

impl InsertCopyTable {
    pub fn preset(id: InsertCopyPreset) -> InsertCopyTable {
        let rows = match id {
            InsertCopyPreset::Deflate => deflate_fill(),
            InsertCopyPreset::BrotliInsertCopy => brotli_ic_fill(),
            InsertCopyPreset::BrotliBlockCount => brotli_blockcount_fill(),
        };
        InsertCopyTable { rows }
    }

    pub fn size(&self) -> usize {
        self.rows.len()
    }

    /* Sort by alphabet code, for decoding. */
    pub fn codesort(&mut self) {
        self.rows.sort_by_key(|row| row.code);
    }

    /* Sort by the starting lengths, for encoding. */
    pub fn lengthsort(&mut self) {
        self.rows.sort_by_key(|row| row.length_key());
    }

    /*
     * Find the row whose windows contain the pair of lengths, preferring
     * the zero-distance variation iff `zero_distance`.  The table must be
     * length-sorted.  `NOT_FOUND` when no window matches.
     */
    pub fn encode(&self, insert_len: u32, copy_len: u32, zero_distance: bool) -> usize {
        /*
         * The windows of one (type, zero-distance) family tile the length
         * plane without overlap, so the candidate found by binary search
         * is the only row that can match.
         */
        let probe = (
            zero_distance,
            insert_len.min(u16::MAX as u32) as u16,
            copy_len.min(u16::MAX as u32) as u16,
        );
        let idx = self.rows.partition_point(|row| {
            let key = row.length_key();
            (key.1, key.2, key.3) <= probe
        });
        /*
         * The match, if any, sits in the candidate's (zero, insert) group;
         * no group holds more than the 24 copy codes.
         */
        for cand in (0..idx).rev().take(32) {
            if self.rows[cand].contains(insert_len, copy_len, zero_distance) {
                return cand;
            }
        }
        NOT_FOUND
    }
}

impl std::ops::Index<usize> for InsertCopyTable {
    type Output = InsertCopyRow;
    fn index(&self, i: usize) -> &InsertCopyRow {
        &self.rows[i]
    }
}

impl std::ops::IndexMut<usize> for InsertCopyTable {
    fn index_mut(&mut self, i: usize) -> &mut InsertCopyRow {
        &mut self.rows[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deflate_table_matches_rfc1951() {
        let table = InsertCopyTable::preset(InsertCopyPreset::Deflate);
        assert_eq!(table.size(), 286);
        assert_eq!(table[65].ty, InsertCopyType::Literal);
        assert_eq!(table[256].ty, InsertCopyType::Stop);
        /* spot checks from the RFC table: code -> (extra bits, first len) */
        for (code, bits, first) in [
            (257u16, 0u8, 3u16),
            (260, 0, 6),
            (264, 0, 10),
            (265, 1, 11),
            (268, 1, 17),
            (269, 2, 19),
            (273, 3, 35),
            (277, 4, 67),
            (281, 5, 131),
            (284, 5, 227),
            (285, 0, 258),
        ] {
            let row = &table[code as usize];
            assert_eq!(row.code, code);
            assert_eq!(row.copy_bits, bits, "code {}", code);
            assert_eq!(row.copy_first, first, "code {}", code);
        }
        assert_eq!(table[284].ty, InsertCopyType::CopyMinus1);
    }

    #[test]
    fn deflate_encode_covers_all_lengths() {
        let mut table = InsertCopyTable::preset(InsertCopyPreset::Deflate);
        table.lengthsort();
        for len in 3u32..=258 {
            let idx = table.encode(0, len, false);
            assert_ne!(idx, NOT_FOUND, "length {}", len);
            let row = &table[idx];
            assert!(row.copy_first as u32 <= len);
            /* length 258 must use code 285, not 284's fifth extra bit */
            if len == 258 {
                assert_eq!(row.code, 285);
            } else if len >= 227 {
                assert_eq!(row.code, 284);
            }
        }
        assert_eq!(table.encode(0, 2, false), NOT_FOUND);
        assert_eq!(table.encode(0, 259, false), NOT_FOUND);
    }

    #[test]
    fn brotli_ic_table_shape() {
        let table = InsertCopyTable::preset(InsertCopyPreset::BrotliInsertCopy);
        assert_eq!(table.size(), 704);
        /* code 0: insert 0+0 bits, copy 2+0 bits, implicit distance */
        assert!(table[0].zero_distance);
        assert_eq!(table[0].insert_first, 0);
        assert_eq!(table[0].copy_first, 2);
        /* code 703: insert code 23, copy code 23 */
        assert!(!table[703].zero_distance);
        assert_eq!(table[703].insert_first, 22594);
        assert_eq!(table[703].insert_bits, 24);
        assert_eq!(table[703].copy_first, 2118);
        assert_eq!(table[703].copy_bits, 24);
        /* code 575 sits in the (insert 8.., copy 16..) cell: codes 15 and 23 */
        let row = &table[575];
        assert_eq!(row.insert_first, BROTLI_INSERT_TABS[15].1);
        assert_eq!(row.copy_first, BROTLI_COPY_TABS[23].1);
    }

    #[test]
    fn brotli_ic_encode_roundtrip() {
        let mut sorted = InsertCopyTable::preset(InsertCopyPreset::BrotliInsertCopy);
        sorted.lengthsort();
        let by_code = InsertCopyTable::preset(InsertCopyPreset::BrotliInsertCopy);
        for insert_len in [0u32, 1, 5, 6, 9, 17, 130, 22593, 22594, 30000] {
            for copy_len in [2u32, 9, 10, 69, 2117, 2118, 50000] {
                let idx = sorted.encode(insert_len, copy_len, false);
                assert_ne!(idx, NOT_FOUND, "({}, {})", insert_len, copy_len);
                let row = &sorted[idx];
                let orig = &by_code[row.code as usize];
                assert!(orig.contains(insert_len, copy_len, false));
            }
        }
        /* implicit-distance rows only reach insert 9 and copy 69 */
        assert_ne!(sorted.encode(9, 17, true), NOT_FOUND);
        assert_ne!(sorted.encode(0, 69, true), NOT_FOUND);
        assert_eq!(sorted.encode(10, 2, true), NOT_FOUND);
        assert_eq!(sorted.encode(0, 70, true), NOT_FOUND);
    }

    #[test]
    fn blockcount_table() {
        let table = InsertCopyTable::preset(InsertCopyPreset::BrotliBlockCount);
        assert_eq!(table.size(), 26);
        assert_eq!(table[0].insert_first, 1);
        assert_eq!(table[0].insert_bits, 2);
        assert_eq!(table[25].insert_first, 16625);
        assert_eq!(table[25].insert_bits, 24);
        let mut sorted = table.clone();
        sorted.lengthsort();
        for count in [1u32, 4, 5, 16624, 16625, 100000] {
            let idx = sorted.encode(count, 0, false);
            assert_ne!(idx, NOT_FOUND, "count {}", count);
        }
        assert_eq!(sorted.encode(0, 0, false), NOT_FOUND);
    }
}
