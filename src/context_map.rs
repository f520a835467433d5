use crate::ApiError;

/*
 * Context map: one prefix-tree selector per (block type, context) cell in
 * block-type-major order, plus one literal context mode per block type.
 */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMapMode {
    Lsb6 = 0,
    Msb6 = 1,
    Utf8 = 2,
    Signed = 3,
}

pub const CONTEXT_MODE_COUNT: usize = 4;

impl ContextMapMode {
    pub fn from_bits(v: u32) -> ContextMapMode {
        match v & 3 {
            0 => ContextMapMode::Lsb6,
            1 => ContextMapMode::Msb6,
            2 => ContextMapMode::Utf8,
            _ => ContextMapMode::Signed,
        }
    }

    pub fn bits(self) -> u32 {
        self as u32
    }
}

/* RFC 7932 section 7.1, high nibble table for the previous byte. */
#[rustfmt::skip]
const LUT0: [u8; 256] = [
     0,  0,  0,  0,  0,  0,  0,  0,  0,  4,  4,  0,  0,  4,  0,  0,
     0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
     8, 12, 16, 12, 12, 20, 12, 16, 24, 28, 12, 12, 32, 12, 36, 12,
    44, 44, 44, 44, 44, 44, 44, 44, 44, 44, 32, 32, 24, 40, 28, 12,
    12, 48, 52, 52, 52, 48, 52, 52, 52, 48, 52, 52, 52, 52, 52, 48,
    52, 52, 52, 52, 52, 48, 52, 52, 52, 52, 52, 24, 12, 28, 12, 12,
    12, 56, 60, 60, 60, 56, 60, 60, 60, 56, 60, 60, 60, 60, 60, 56,
    60, 60, 60, 60, 60, 56, 60, 60, 60, 60, 60, 24, 12, 28, 12,  0,
     0,  1,  0,  1,  0,  1,  0,  1,  0,  1,  0,  1,  0,  1,  0,  1,
     0,  1,  0,  1,  0,  1,  0,  1,  0,  1,  0,  1,  0,  1,  0,  1,
     0,  1,  0,  1,  0,  1,  0,  1,  0,  1,  0,  1,  0,  1,  0,  1,
     0,  1,  0,  1,  0,  1,  0,  1,  0,  1,  0,  1,  0,  1,  0,  1,
     2,  3,  2,  3,  2,  3,  2,  3,  2,  3,  2,  3,  2,  3,  2,  3,
     2,  3,  2,  3,  2,  3,  2,  3,  2,  3,  2,  3,  2,  3,  2,  3,
     2,  3,  2,  3,  2,  3,  2,  3,  2,  3,  2,  3,  2,  3,  2,  3,
     2,  3,  2,  3,  2,  3,  2,  3,  2,  3,  2,  3,  2,  3,  2,  3,
];

/* RFC 7932 section 7.1, low table for the byte before that. */
#[rustfmt::skip]
const LUT1: [u8; 256] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 1, 1, 1, 1, 1, 1,
    1, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
    2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 1, 1, 1, 1, 1,
    1, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3,
    3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 1, 1, 1, 1, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
    2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
];

/* RFC 7932 section 7.1, signed-magnitude bucket table. */
#[rustfmt::skip]
const LUT2: [u8; 256] = [
    0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
    2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
    2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
    3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3,
    3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3,
    3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3,
    3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3,
    4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4,
    4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4,
    4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4,
    4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4,
    5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5,
    5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5,
    5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5,
    6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 7,
];

const_assert!(LUT0.len() + LUT1.len() == 512);

/* Distance context from a copy length; lengths below two are invalid. */
pub fn distance_context(copylen: u32) -> Result<usize, ApiError> {
    match copylen {
        0 | 1 => Err(ApiError::Param),
        2 => Ok(0),
        3 => Ok(1),
        4 => Ok(2),
        _ => Ok(3),
    }
}

/*
 * Literal context from the last two emitted bytes (`p1` most recent),
 * RFC 7932 section 7.1.
 */
pub fn literal_context(mode: ContextMapMode, p1: u8, p2: u8) -> usize {
    match mode {
        ContextMapMode::Lsb6 => (p1 & 0x3F) as usize,
        ContextMapMode::Msb6 => (p1 >> 2) as usize,
        ContextMapMode::Utf8 => (LUT0[p1 as usize] | LUT1[p2 as usize]) as usize,
        ContextMapMode::Signed => ((LUT2[p1 as usize] << 3) | LUT2[p2 as usize]) as usize,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextMap {
    cells: Vec<u8>,
    modes: Vec<ContextMapMode>,
    btypes: usize,
    ctxts: usize,
}

impl ContextMap {
    pub fn new(btypes: usize, ctxts: usize) -> ContextMap {
        ContextMap {
            cells: vec![0; btypes * ctxts],
            modes: vec![ContextMapMode::Lsb6; btypes],
            btypes,
            ctxts,
        }
    }

    pub fn block_types(&self) -> usize {
        self.btypes
    }

    pub fn contexts(&self) -> usize {
        self.ctxts
    }

    pub fn get(&self, btype: usize, ctxt: usize) -> u8 {
        self.cells[btype * self.ctxts + ctxt]
    }

    pub fn set(&mut self, btype: usize, ctxt: usize, tree: u8) {
        self.cells[btype * self.ctxts + ctxt] = tree;
    }

    pub fn data(&self) -> &[u8] {
        &self.cells
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.cells
    }

    pub fn mode(&self, btype: usize) -> ContextMapMode {
        self.modes[btype]
    }

    pub fn set_mode(&mut self, btype: usize, mode: ContextMapMode) {
        self.modes[btype] = mode;
    }

    /*
     * Forward move-to-front over the whole matrix: each cell is replaced
     * by the rank of its value in the recently-used list.  Inverse of
     * `revert_movetofront`.
     */
    pub fn apply_movetofront(&mut self) {
        let mut mtf: [u8; 256] = std::array::from_fn(|i| i as u8);
        for cell in &mut self.cells {
            let value = *cell;
            let index = mtf.iter().position(|&v| v == value).unwrap();
            *cell = index as u8;
            mtf.copy_within(0..index, 1);
            mtf[0] = value;
        }
    }

    /* The inverse move-to-front transform of RFC 7932 section 7.3. */
    pub fn revert_movetofront(&mut self) {
        let mut mtf: [u8; 256] = std::array::from_fn(|i| i as u8);
        for cell in &mut self.cells {
            let index = *cell as usize;
            let value = mtf[index];
            *cell = value;
            mtf.copy_within(0..index, 1);
            mtf[0] = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_contexts() {
        assert_eq!(distance_context(2).unwrap(), 0);
        assert_eq!(distance_context(3).unwrap(), 1);
        assert_eq!(distance_context(4).unwrap(), 2);
        assert_eq!(distance_context(100).unwrap(), 3);
        assert_eq!(distance_context(1), Err(ApiError::Param));
        assert_eq!(distance_context(0), Err(ApiError::Param));
    }

    #[test]
    fn literal_contexts() {
        assert_eq!(literal_context(ContextMapMode::Lsb6, 0xC7, 0), 0x07);
        assert_eq!(literal_context(ContextMapMode::Msb6, 0xC7, 0), 0x31);
        /* space then lowercase letter is the classic text context */
        assert_eq!(
            literal_context(ContextMapMode::Utf8, b' ', b'e'),
            (LUT0[b' ' as usize] | LUT1[b'e' as usize]) as usize
        );
        assert!(literal_context(ContextMapMode::Utf8, 0xFF, 0xFF) < 64);
        assert!(literal_context(ContextMapMode::Signed, 0xFF, 0x00) < 64);
        assert_eq!(literal_context(ContextMapMode::Signed, 0xFF, 0xFF), (7 << 3) | 7);
    }

    #[test]
    fn mtf_involution() {
        let mut map = ContextMap::new(7, 64);
        for (i, cell) in map.data_mut().iter_mut().enumerate() {
            *cell = ((i * 131) % 11) as u8;
        }
        let reference = map.data().to_vec();
        map.apply_movetofront();
        map.revert_movetofront();
        assert_eq!(map.data(), reference.as_slice());

        map.revert_movetofront();
        map.apply_movetofront();
        assert_eq!(map.data(), reference.as_slice());
    }

    #[test]
    fn revert_matches_rfc_reference() {
        /* reference transform transliterated from RFC 7932 section 7.3 */
        fn inverse_reference(v: &mut [u8]) {
            let mut mtf: [u8; 256] = std::array::from_fn(|i| i as u8);
            for x in v.iter_mut() {
                let mut index = *x as usize;
                let value = mtf[index];
                *x = value;
                while index > 0 {
                    mtf[index] = mtf[index - 1];
                    index -= 1;
                }
                mtf[0] = value;
            }
        }
        let mut map = ContextMap::new(3, 4);
        let seed = [3u8, 0, 1, 3, 2, 2, 0, 5, 4, 1, 0, 7];
        map.data_mut().copy_from_slice(&seed);
        let mut expect = seed;
        inverse_reference(&mut expect);
        map.revert_movetofront();
        assert_eq!(map.data(), &expect);
    }
}
