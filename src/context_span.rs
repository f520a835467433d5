use crate::context_map::{ContextMapMode, CONTEXT_MODE_COUNT};

/*
 * Heuristic selection of a Brotli literal context mode over byte spans.
 * The scores are coarse predictiveness tallies: how much of each byte
 * would the mode's context actually see, and how well do neighbouring
 * bytes follow the mode's shape.
 */

pub const MAX_SPANS: usize = 16;

/* Window used when subdividing a buffer into mode regions. */
const SUBDIVIDE_WINDOW: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextScore {
    pub vec: [u32; CONTEXT_MODE_COUNT],
}

impl std::ops::Index<ContextMapMode> for ContextScore {
    type Output = u32;
    fn index(&self, m: ContextMapMode) -> &u32 {
        &self.vec[m as usize]
    }
}

impl ContextScore {
    /* The mode with the highest tally; ties keep the cheaper mode. */
    pub fn best(&self) -> ContextMapMode {
        let mut mode = ContextMapMode::Lsb6;
        for cand in [ContextMapMode::Msb6, ContextMapMode::Utf8, ContextMapMode::Signed] {
            if self[cand] > self[mode] {
                mode = cand;
            }
        }
        mode
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContextSpan {
    pub total_bytes: usize,
    pub offsets: [usize; MAX_SPANS],
    pub modes: [ContextMapMode; MAX_SPANS],
    pub count: usize,
}

impl Default for ContextSpan {
    fn default() -> ContextSpan {
        ContextSpan {
            total_bytes: 0,
            offsets: [0; MAX_SPANS],
            modes: [ContextMapMode::Lsb6; MAX_SPANS],
            count: 0,
        }
    }
}

/*
 * Accumulate mode-fitness scores over `buf`.  Callers zero the score
 * before the first call and may keep folding additional buffers in.
 */
pub fn ctxtspan_guess(results: &mut ContextScore, buf: &[u8]) {
    for (i, &b) in buf.iter().enumerate() {
        /* LSB6 keeps the whole previous byte only below 64 */
        if b & 0xC0 == 0 {
            results.vec[ContextMapMode::Lsb6 as usize] += 1;
        }
        /* MSB6 drops the two low bits */
        if b & 0x03 == 0 {
            results.vec[ContextMapMode::Msb6 as usize] += 1;
        }
        /* the signed buckets only separate the extremes */
        if b < 32 || b >= 224 {
            results.vec[ContextMapMode::Signed as usize] += 2;
        }
        if i > 0 {
            let prev = buf[i - 1];
            let score = match (utf8_class(prev), utf8_class(b)) {
                (Utf8Class::Lead, Utf8Class::Continuation) => 2,
                (Utf8Class::Lead, _) => 0,
                (Utf8Class::Ascii, Utf8Class::Continuation) => 0,
                _ => 1,
            };
            results.vec[ContextMapMode::Utf8 as usize] += score;
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Utf8Class {
    Ascii,
    Continuation,
    Lead,
}

fn utf8_class(b: u8) -> Utf8Class {
    match b {
        0x00..=0x7F => Utf8Class::Ascii,
        0x80..=0xBF => Utf8Class::Continuation,
        _ => Utf8Class::Lead,
    }
}

/*
 * Partition `buf` into at most sixteen mode spans.  Adjacent windows
 * coalesce while the running span's mode stays within `margin` of the
 * window's own best mode.
 */
pub fn ctxtspan_subdivide(buf: &[u8], margin: u32) -> ContextSpan {
    let mut out = ContextSpan {
        total_bytes: buf.len(),
        ..ContextSpan::default()
    };
    if buf.is_empty() {
        return out;
    }
    let window = (buf.len() + MAX_SPANS - 1) / MAX_SPANS;
    let window = window.max(SUBDIVIDE_WINDOW);
    for (slot, chunk) in buf.chunks(window).enumerate() {
        let mut score = ContextScore::default();
        ctxtspan_guess(&mut score, chunk);
        let best = score.best();
        let offset = slot * window;
        if out.count > 0 {
            let running = out.modes[out.count - 1];
            if running == best || score[running] + margin >= score[best] {
                continue;
            }
        }
        out.offsets[out.count] = offset;
        out.modes[out.count] = best;
        out.count += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixed_bytes(len: usize, mask: u8, or: u8) -> Vec<u8> {
        let mut state = 0x9E3779B9u32;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(747796405).wrapping_add(2891336453);
                ((state >> 24) as u8 & mask) | or
            })
            .collect()
    }

    #[test]
    fn low_bytes_prefer_lsb6() {
        let buf = mixed_bytes(64, 0x3F, 0x01);
        let mut score = ContextScore::default();
        ctxtspan_guess(&mut score, &buf);
        assert!(score[ContextMapMode::Lsb6] > score[ContextMapMode::Msb6]);
    }

    #[test]
    fn coarse_bytes_prefer_msb6() {
        let buf = mixed_bytes(64, 0xFC, 0x40);
        let mut score = ContextScore::default();
        ctxtspan_guess(&mut score, &buf);
        assert!(score[ContextMapMode::Msb6] > score[ContextMapMode::Lsb6]);
    }

    #[test]
    fn utf8_text_prefers_utf8() {
        let buf = "na\u{00ef}vet\u{00e9} caf\u{00e9} r\u{00e9}sum\u{00e9} ".repeat(4);
        let mut score = ContextScore::default();
        ctxtspan_guess(&mut score, buf.as_bytes());
        assert!(score[ContextMapMode::Utf8] > score[ContextMapMode::Lsb6]);
    }

    #[test]
    fn saturated_bytes_prefer_signed() {
        let high = mixed_bytes(64, 0x1F, 0xE0);
        let mut score = ContextScore::default();
        ctxtspan_guess(&mut score, &high);
        assert!(score[ContextMapMode::Signed] > score[ContextMapMode::Msb6]);
        assert!(score[ContextMapMode::Signed] > score[ContextMapMode::Utf8]);

        let low = mixed_bytes(64, 0x1F, 0x00);
        let mut score = ContextScore::default();
        ctxtspan_guess(&mut score, &low);
        assert!(score[ContextMapMode::Signed] > score[ContextMapMode::Msb6]);
    }

    #[test]
    fn guess_accumulates_across_calls() {
        let buf = mixed_bytes(96, 0xFF, 0);
        let mut whole = ContextScore::default();
        ctxtspan_guess(&mut whole, &buf);
        assert!(whole.vec.iter().any(|&v| v > 0));
        /* folding halves differs from the whole only at the seam pair */
        let mut halves = ContextScore::default();
        ctxtspan_guess(&mut halves, &buf[..48]);
        ctxtspan_guess(&mut halves, &buf[48..]);
        for m in 0..CONTEXT_MODE_COUNT {
            assert!(halves.vec[m] <= whole.vec[m]);
            assert!(whole.vec[m] - halves.vec[m] <= 2);
        }
    }

    #[test]
    fn subdivide_splits_heterogeneous_input() {
        let mut buf = mixed_bytes(256, 0x1F, 0x20);
        buf.extend(mixed_bytes(256, 0x1F, 0xE0));
        let span = ctxtspan_subdivide(&buf, 0);
        assert!(span.count >= 2);
        assert!(span.count <= MAX_SPANS);
        assert_eq!(span.total_bytes, buf.len());
        assert_eq!(span.offsets[0], 0);
        assert_eq!(span.modes[0], ContextMapMode::Lsb6);
        assert_eq!(span.modes[span.count - 1], ContextMapMode::Signed);
        /* offsets ascend */
        for i in 1..span.count {
            assert!(span.offsets[i] > span.offsets[i - 1]);
        }
    }

    #[test]
    fn subdivide_generous_margin_coalesces() {
        let mut buf = mixed_bytes(512, 0x3F, 0x00);
        buf.extend(mixed_bytes(512, 0xFC, 0x40));
        let span = ctxtspan_subdivide(&buf, 1 << 20);
        assert_eq!(span.count, 1);
    }
}
