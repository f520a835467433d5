/*
 * Adler-32, as framed by RFC 1950.  `s1` and `s2` run modulo 65521; the
 * reduction is deferred across runs of 5550 input bytes, the longest run
 * for which `s2` cannot overflow 32 bits starting from reduced state.
 */

const ADLER_MOD: u32 = 65521;
const ADLER_RUN: usize = 5550;

/*
 * Fold `buf` into a running checksum.  The initial checksum of an empty
 * stream is 1.
 */
pub fn adler32(chk: u32, buf: &[u8]) -> u32 {
    let mut s1 = chk & 0xFFFF;
    let mut s2 = chk >> 16;
    for run in buf.chunks(ADLER_RUN) {
        for &b in run {
            s1 += b as u32;
            s2 += s1;
        }
        s1 %= ADLER_MOD;
        s2 %= ADLER_MOD;
    }
    s1 | (s2 << 16)
}

#[cfg(test)]
mod tests {
    use super::adler32;

    #[test]
    fn known_vectors() {
        assert_eq!(adler32(1, b""), 1);
        /* RFC 1950 reference value for "Wikipedia" */
        assert_eq!(adler32(1, b"Wikipedia"), 0x11E60398);
        assert_eq!(adler32(1, b"abc"), 0x024D0127);
    }

    #[test]
    fn chunked_equivalence() {
        let data: Vec<u8> = (0..40000u32).map(|i| (i * 31 + 7) as u8).collect();
        let whole = adler32(1, &data);
        for split in [1usize, 13, 5549, 5550, 5551, 16384, 39999] {
            let (a, b) = data.split_at(split);
            assert_eq!(adler32(adler32(1, a), b), whole, "split {}", split);
        }
    }

    #[test]
    fn long_run_reduction() {
        /* all-0xFF input maximizes s2 growth between reductions */
        let data = vec![0xFFu8; 3 * super::ADLER_RUN + 17];
        let mut byte_at_a_time = 1u32;
        for b in &data {
            byte_at_a_time = adler32(byte_at_a_time, std::slice::from_ref(b));
        }
        assert_eq!(adler32(1, &data), byte_at_a_time);
    }
}
