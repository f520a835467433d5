/* Brotli stream geometry (RFC 7932). */

pub const BROTLI_NUM_LITERAL_SYMS: usize = 256;
pub const BROTLI_NUM_INSCOPY_SYMS: usize = 704;
pub const BROTLI_NUM_BLOCKCOUNT_SYMS: usize = 26;
pub const BROTLI_NUM_CLEN_SYMS: usize = 18;

pub const BROTLI_MAX_CODEWORD_LEN: u16 = 15;
pub const BROTLI_MAX_CLEN_CODEWORD_LEN: u16 = 5;

/* Literal contexts per block type; distance contexts per block type. */
pub const BROTLI_LITERAL_CONTEXTS: usize = 64;
pub const BROTLI_DISTANCE_CONTEXTS: usize = 4;

pub const BROTLI_MIN_WBITS: u8 = 10;
pub const BROTLI_MAX_WBITS: u8 = 24;
/* Largest sliding window any WBITS value describes. */
pub const BROTLI_MAX_WINDOW: u32 = (1 << 24) - 16;

/* Upper bound on a single metadata entry (MSKIPLEN is 24 bits). */
pub const BROTLI_MAX_METADATA_LEN: usize = 1 << 24;

pub const BROTLI_MAX_BLOCK_TYPES: usize = 256;

/*
 * The order in which the code-length-code lengths of a complex prefix code
 * are transmitted.
 */
pub const BROTLI_CLEN_PERMUTATION: [u8; BROTLI_NUM_CLEN_SYMS] = [
    1, 2, 3, 4, 0, 5, 17, 6, 16, 7, 8, 9, 10, 11, 12, 13, 14, 15,
];

/* Extra-bit widths of the code-length repeat symbols 16 and 17. */
pub const BROTLI_CLEN_REPEAT_BITS: [u8; 2] = [2, 3];

/* Total code space of a 15-bit-limited prefix code. */
pub const BROTLI_CODE_SPACE: u32 = 1 << 15;
/* Total code space of the 5-bit code-length code. */
pub const BROTLI_CLEN_CODE_SPACE: u32 = 1 << 5;

const_assert!(BROTLI_NUM_INSCOPY_SYMS == 11 * 64);
const_assert!(BROTLI_MAX_WINDOW == 16777200);
