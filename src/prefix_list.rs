use crate::ApiError;

/*
 * A prefix code as a flat list of (code, length, value) lines.  Two
 * orderings matter: code order (len, then code) for bit-directed decoding
 * and value order for alphabet-directed encoding.  The list does not track
 * which ordering is current; callers re-sort before searching.
 */

/* Sentinel for a failed binary search. */
pub const NOT_FOUND: usize = usize::MAX;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefixLine {
    /* Prefix bits, packed with the first-read bit most significant. */
    pub code: u16,
    /* Length of the prefix in bits. */
    pub len: u16,
    /* Alphabet value for the prefix. */
    pub value: u32,
}

/* Frequencies, one per companion prefix line. */
pub type PrefixHistogram = Vec<u32>;

/* Huffman forest addressed through a context map. */
pub type GaspVector = Vec<PrefixList>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixPreset {
    /* The fixed code-length code of Brotli complex prefix codes. */
    BrotliComplex,
    /* Length shapes for Brotli simple prefix codes, NSYM = 1..4. */
    BrotliSimple1,
    BrotliSimple2,
    BrotliSimple3,
    BrotliSimple4A,
    BrotliSimple4B,
    /* The Brotli window-bits code, including the reserved pattern. */
    BrotliWBits,
    /* The Brotli block-type/tree count code. */
    BrotliBlockType,
}

#[derive(Debug, Clone, Default)]
pub struct PrefixList {
    lines: Vec<PrefixLine>,
}

const PS_BROTLI_COMPLEX: &[(u16, u16)] = &[
    (0x0 /*   00 */, 2),
    (0xe /* 1110 */, 4),
    (0x6 /*  110 */, 3),
    (0x1 /*   01 */, 2),
    (0x2 /*   10 */, 2),
    (0xf /* 1111 */, 4),
];

const PS_BROTLI_S1: &[(u16, u16)] = &[(0, 0)];
const PS_BROTLI_S2: &[(u16, u16)] = &[(0x0, 1), (0x1, 1)];
const PS_BROTLI_S3: &[(u16, u16)] = &[(0x0, 1), (0x2, 2), (0x3, 2)];
const PS_BROTLI_S4A: &[(u16, u16)] = &[(0x0, 2), (0x1, 2), (0x2, 2), (0x3, 2)];
const PS_BROTLI_S4B: &[(u16, u16)] = &[(0x0, 1), (0x2, 2), (0x6, 3), (0x7, 3)];

/*
 * RFC 7932 section 9.1.  Codes are the read-order bit patterns; value 9 is
 * the reserved pattern that a conforming decoder rejects.
 */
const PS_BROTLI_WBITS: &[(u16, u16, u32)] = &[
    (0x44, 7, 9),
    (0x42, 7, 10),
    (0x46, 7, 11),
    (0x41, 7, 12),
    (0x45, 7, 13),
    (0x43, 7, 14),
    (0x47, 7, 15),
    (0x00, 1, 16),
    (0x40, 7, 17),
    (0x0c, 4, 18),
    (0x0a, 4, 19),
    (0x0e, 4, 20),
    (0x09, 4, 21),
    (0x0d, 4, 22),
    (0x0b, 4, 23),
    (0x0f, 4, 24),
];

/*
 * RFC 7932 section 9.2, NBLTYPES* / NTREES*.  Value 0 decodes a count of
 * one; value v >= 1 carries v-1 extra bits over base (1 << (v-1)) + 1.
 */
const PS_BROTLI_BLOCK_TYPE: &[(u16, u16, u32)] = &[
    (0x0, 1, 0),
    (0x8, 4, 1),
    (0xc, 4, 2),
    (0xa, 4, 3),
    (0xe, 4, 4),
    (0x9, 4, 5),
    (0xd, 4, 6),
    (0xb, 4, 7),
    (0xf, 4, 8),
];

impl PrefixList {
    /* Allocate `n` zeroed prefix lines. */
    pub fn new(n: usize) -> PrefixList {
        PrefixList {
            lines: vec![PrefixLine::default(); n],
        }
    }

    /* Install a preset code table. */
    pub fn preset(id: PrefixPreset) -> PrefixList {
        let lines: Vec<PrefixLine> = match id {
            PrefixPreset::BrotliComplex => number(PS_BROTLI_COMPLEX),
            PrefixPreset::BrotliSimple1 => number(PS_BROTLI_S1),
            PrefixPreset::BrotliSimple2 => number(PS_BROTLI_S2),
            PrefixPreset::BrotliSimple3 => number(PS_BROTLI_S3),
            PrefixPreset::BrotliSimple4A => number(PS_BROTLI_S4A),
            PrefixPreset::BrotliSimple4B => number(PS_BROTLI_S4B),
            PrefixPreset::BrotliWBits => valued(PS_BROTLI_WBITS),
            PrefixPreset::BrotliBlockType => valued(PS_BROTLI_BLOCK_TYPE),
        };
        PrefixList { lines }
    }

    pub fn size(&self) -> usize {
        self.lines.len()
    }

    pub fn resize(&mut self, n: usize) {
        self.lines.resize(n, PrefixLine::default());
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PrefixLine> {
        self.lines.iter()
    }

    /*
     * Assign canonical codes from the current `len` values, in list order
     * within each length (RFC 1951 section 3.2.2 when the list is in value
     * order).
     */
    pub fn gen_codes(&mut self) -> Result<(), ApiError> {
        let mut counts = [0u32; 16];
        for line in &self.lines {
            if line.len >= 16 {
                return Err(ApiError::FixLenRange);
            }
            counts[line.len as usize] += 1;
        }
        let mut code_mins = [0u32; 16];
        let mut next_code = 0u32;
        let mut cap_tracker = 1u32;
        for len in 1..16 {
            next_code <<= 1;
            cap_tracker <<= 1;
            code_mins[len] = next_code;
            if counts[len] > cap_tracker - next_code {
                return Err(ApiError::FixCodeAlloc);
            }
            next_code += counts[len];
        }
        for line in &mut self.lines {
            let len = line.len as usize;
            if len > 0 {
                line.code = code_mins[len] as u16;
                code_mins[len] += 1;
            } else {
                line.code = 0;
            }
        }
        Ok(())
    }

    /*
     * Length-limited Huffman construction (boundary package-merge).
     * Symbols with zero frequency get length zero; one or two coded
     * symbols each get length one.
     */
    pub fn gen_lengths(&mut self, table: &[u32], max_bits: u32) -> Result<(), ApiError> {
        if self.lines.len() > 32768 || max_bits > 15 {
            return Err(ApiError::FixLenRange);
        }
        let mut active: Vec<(u32, usize)> = Vec::with_capacity(self.lines.len());
        for (i, line) in self.lines.iter_mut().enumerate() {
            let freq = table.get(i).copied().unwrap_or(0);
            if freq > 0 {
                active.push((freq, i));
            } else {
                line.len = 0;
            }
        }
        if active.len() <= 2 {
            if max_bits == 0 && !active.is_empty() {
                return Err(ApiError::FixLenRange);
            }
            for &(_, idx) in &active {
                self.lines[idx].len = 1;
            }
            return Ok(());
        }
        if max_bits >= 32 || active.len() as u64 > 1u64 << max_bits {
            return Err(ApiError::FixLenRange);
        }
        active.sort_by_key(|&(freq, idx)| (freq, idx));

        /*
         * Each level holds (weight, kind): kind 0 = leaf carrying its
         * active-symbol index, otherwise a package of the two items at
         * consecutive positions `pair` and `pair + 1` of the level below.
         */
        #[derive(Clone, Copy)]
        enum Item {
            Leaf(usize),
            Package(usize),
        }
        let mut levels: Vec<Vec<(u64, Item)>> = Vec::with_capacity(max_bits as usize);
        let leaves: Vec<(u64, Item)> = active
            .iter()
            .enumerate()
            .map(|(sym, &(freq, _))| (freq as u64, Item::Leaf(sym)))
            .collect();
        levels.push(leaves.clone());
        for _ in 1..max_bits {
            let prev = levels.last().unwrap();
            let mut merged = Vec::with_capacity(leaves.len() + prev.len() / 2);
            let mut li = 0usize;
            let mut pi = 0usize;
            while li < leaves.len() || pi + 1 < prev.len() {
                let pkg_weight = if pi + 1 < prev.len() {
                    Some(prev[pi].0 + prev[pi + 1].0)
                } else {
                    None
                };
                match (leaves.get(li), pkg_weight) {
                    (Some(&(lw, item)), Some(pw)) if lw <= pw => {
                        merged.push((lw, item));
                        li += 1;
                    }
                    (Some(&(lw, item)), None) => {
                        merged.push((lw, item));
                        li += 1;
                    }
                    (_, Some(pw)) => {
                        merged.push((pw, Item::Package(pi)));
                        pi += 2;
                    }
                    (None, None) => break,
                }
            }
            levels.push(merged);
        }

        /* Count how often each leaf is taken across the boundary set. */
        let mut lens = vec![0u16; active.len()];
        let top = levels.len() - 1;
        let take = 2 * (active.len() - 1);
        if levels[top].len() < take {
            return Err(ApiError::FixLenRange);
        }
        let mut stack: Vec<(usize, usize)> = (0..take).map(|i| (top, i)).collect();
        while let Some((level, idx)) = stack.pop() {
            match levels[level][idx].1 {
                Item::Leaf(sym) => lens[sym] += 1,
                Item::Package(pair) => {
                    stack.push((level - 1, pair));
                    stack.push((level - 1, pair + 1));
                }
            }
        }
        for (sym, &(_, idx)) in active.iter().enumerate() {
            debug_assert!(lens[sym] >= 1 && lens[sym] <= max_bits as u16);
            self.lines[idx].len = lens[sym];
        }
        Ok(())
    }

    /* Sort for bit-directed decoding. */
    pub fn codesort(&mut self) {
        self.lines.sort_by_key(|line| (line.len, line.code));
    }

    /* Sort for alphabet-directed encoding. */
    pub fn valuesort(&mut self) {
        self.lines.sort_by_key(|line| line.value);
    }

    /*
     * Find the line holding the `n`-bit string `bits`.  The list must be
     * code-sorted.
     */
    pub fn codebsearch(&self, n: u16, bits: u16) -> usize {
        match self
            .lines
            .binary_search_by(|line| (line.len, line.code).cmp(&(n, bits)))
        {
            Ok(i) => i,
            Err(_) => NOT_FOUND,
        }
    }

    /*
     * Find a line by alphabet value.  The list must be value-sorted.
     */
    pub fn valuebsearch(&self, value: u32) -> usize {
        match self.lines.binary_search_by(|line| line.value.cmp(&value)) {
            Ok(i) => i,
            Err(_) => NOT_FOUND,
        }
    }

    /* Set every line's value to its list position. */
    pub fn identity_values(&mut self) {
        for (i, line) in self.lines.iter_mut().enumerate() {
            line.value = i as u32;
        }
    }

    /* Zero every line's length. */
    pub fn clear_lens(&mut self) {
        for line in &mut self.lines {
            line.len = 0;
        }
    }
}

impl std::ops::Index<usize> for PrefixList {
    type Output = PrefixLine;
    fn index(&self, i: usize) -> &PrefixLine {
        &self.lines[i]
    }
}

impl std::ops::IndexMut<usize> for PrefixList {
    fn index_mut(&mut self, i: usize) -> &mut PrefixLine {
        &mut self.lines[i]
    }
}

fn number(table: &[(u16, u16)]) -> Vec<PrefixLine> {
    table
        .iter()
        .enumerate()
        .map(|(i, &(code, len))| PrefixLine {
            code,
            len,
            value: i as u32,
        })
        .collect()
}

fn valued(table: &[(u16, u16, u32)]) -> Vec<PrefixLine> {
    table
        .iter()
        .map(|&(code, len, value)| PrefixLine { code, len, value })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kraft_space(list: &PrefixList) -> u32 {
        list.iter()
            .filter(|l| l.len > 0)
            .map(|l| 1u32 << (15 - l.len))
            .sum()
    }

    #[test]
    fn gen_codes_rfc1951_example() {
        /* RFC 1951 section 3.2.2 worked example, symbols A..H. */
        let mut list = PrefixList::new(8);
        for (i, len) in [3u16, 3, 3, 3, 3, 2, 4, 4].iter().enumerate() {
            list[i].len = *len;
            list[i].value = i as u32;
        }
        list.gen_codes().unwrap();
        let codes: Vec<u16> = (0..8).map(|i| list[i].code).collect();
        assert_eq!(codes, vec![0b010, 0b011, 0b100, 0b101, 0b110, 0b00, 0b1110, 0b1111]);
    }

    #[test]
    fn gen_codes_rejects_oversubscription() {
        let mut list = PrefixList::new(3);
        for i in 0..3 {
            list[i].len = 1;
        }
        assert_eq!(list.gen_codes(), Err(ApiError::FixCodeAlloc));

        let mut long = PrefixList::new(1);
        long[0].len = 16;
        assert_eq!(long.gen_codes(), Err(ApiError::FixLenRange));
    }

    #[test]
    fn gen_lengths_saturates_kraft() {
        let hist: Vec<u32> = vec![5, 1, 1, 7, 30, 1, 0, 2, 9, 4, 0, 0, 1, 1];
        let mut list = PrefixList::new(hist.len());
        list.identity_values();
        list.gen_lengths(&hist, 15).unwrap();
        for (i, &f) in hist.iter().enumerate() {
            if f > 0 {
                assert!(list[i].len >= 1 && list[i].len <= 15);
            } else {
                assert_eq!(list[i].len, 0);
            }
        }
        assert_eq!(kraft_space(&list), 1 << 15);
        /* codes must also be assignable */
        list.gen_codes().unwrap();
    }

    #[test]
    fn gen_lengths_respects_limit() {
        /* skewed frequencies that an unlimited tree would take past 7 bits */
        let hist: Vec<u32> = (0..40u32).map(|i| 1 << (i / 3)).collect();
        let mut list = PrefixList::new(hist.len());
        list.gen_lengths(&hist, 7).unwrap();
        assert!(list.iter().all(|l| l.len >= 1 && l.len <= 7));
        assert_eq!(kraft_space(&list), 1 << 15);
    }

    #[test]
    fn gen_lengths_degenerate() {
        let mut list = PrefixList::new(8);
        list.gen_lengths(&[0, 9, 0, 0, 0, 0, 0, 0], 15).unwrap();
        assert_eq!(list[1].len, 1);
        assert!(list.iter().enumerate().all(|(i, l)| i == 1 || l.len == 0));

        let mut two = PrefixList::new(4);
        two.gen_lengths(&[3, 0, 0, 5], 15).unwrap();
        assert_eq!(two[0].len, 1);
        assert_eq!(two[3].len, 1);
    }

    #[test]
    fn gen_lengths_rejects_impossible() {
        let mut list = PrefixList::new(8);
        let ones = [1u32; 8];
        assert_eq!(list.gen_lengths(&ones, 2), Err(ApiError::FixLenRange));
        assert_eq!(list.gen_lengths(&ones, 16), Err(ApiError::FixLenRange));
    }

    #[test]
    fn code_search_roundtrip() {
        let mut list = PrefixList::new(8);
        for (i, len) in [3u16, 3, 3, 3, 3, 2, 4, 4].iter().enumerate() {
            list[i].len = *len;
            list[i].value = i as u32;
        }
        list.gen_codes().unwrap();
        let saved: Vec<PrefixLine> = list.iter().copied().collect();
        list.codesort();
        for line in &saved {
            let j = list.codebsearch(line.len, line.code);
            assert_ne!(j, NOT_FOUND);
            assert_eq!(list[j].value, line.value);
        }
        assert_eq!(list.codebsearch(5, 0), NOT_FOUND);
        /* every (len, code) pair appears exactly once */
        for w in 0..saved.len() {
            for v in (w + 1)..saved.len() {
                assert_ne!((saved[w].len, saved[w].code), (saved[v].len, saved[v].code));
            }
        }
    }

    #[test]
    fn value_search() {
        let mut list = PrefixList::new(5);
        for (i, v) in [40u32, 10, 30, 20, 0].iter().enumerate() {
            list[i].value = *v;
        }
        list.valuesort();
        assert_eq!(list[list.valuebsearch(30)].value, 30);
        assert_eq!(list.valuebsearch(31), NOT_FOUND);
    }

    #[test]
    fn presets_are_searchable() {
        let mut complex = PrefixList::preset(PrefixPreset::BrotliComplex);
        assert_eq!(complex.size(), 6);
        complex.codesort();
        /* the two-bit pattern 01 decodes symbol 3 */
        let j = complex.codebsearch(2, 0b01);
        assert_eq!(complex[j].value, 3);

        let mut wbits = PrefixList::preset(PrefixPreset::BrotliWBits);
        assert_eq!(wbits.size(), 16);
        wbits.codesort();
        assert_eq!(wbits[wbits.codebsearch(1, 0)].value, 16);
        assert_eq!(wbits[wbits.codebsearch(4, 0b1111)].value, 24);
        assert_eq!(wbits[wbits.codebsearch(7, 0b1000100)].value, 9);
        wbits.valuesort();
        assert_eq!(wbits[wbits.valuebsearch(10) ].len, 7);

        let blocknum = PrefixList::preset(PrefixPreset::BrotliBlockType);
        assert_eq!(blocknum.size(), 9);
    }
}
