use crate::brotli_constants::{
    BROTLI_CLEN_CODE_SPACE, BROTLI_CLEN_PERMUTATION, BROTLI_CODE_SPACE, BROTLI_NUM_CLEN_SYMS,
};
use crate::prefix_list::{PrefixLine, PrefixList, PrefixPreset, NOT_FOUND};
use crate::ApiError;

/*
 * Nested bit-machine that reads one Brotli prefix code (RFC 7932 sec. 3),
 * simple or complex, and yields a code-sorted prefix list.  The machine
 * consumes one bit per `step` call; symbol work that needs no bits (a
 * one-symbol inner code) runs inside the call, so a tree may complete
 * without consuming the offered bit.
 */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeStep {
    /* bit consumed, more to come */
    More,
    /* bit consumed and the tree is complete */
    Complete,
    /* tree completed without touching the offered bit */
    CompleteUnconsumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TState {
    Ident,
    SimpleNsym,
    SimpleSymbol,
    SimpleSelect,
    ClenLens,
    SymbolCode,
    RepeatExtra,
}

#[derive(Debug)]
pub struct TreeMarshal {
    state: TState,
    alphabet: u32,
    alphabits: u16,
    bits: u32,
    bit_length: u16,
    index: u32,
    /* NSYM for simple codes */
    count: u32,
    symbols: [u32; 4],
    select: u8,
    simple: bool,
    /* complex-code scratch */
    clen_lens: [u16; BROTLI_NUM_CLEN_SYMS],
    clen_space: u32,
    /* the code-length code; `nineteen` after the original's field */
    nineteen: PrefixList,
    nineteen_singular: Option<u32>,
    fixed: PrefixList,
    lens: Vec<u16>,
    space: u32,
    nonzero: u32,
    last_nonzero: u16,
    repeat_sym: u8,
    repeat_total: u32,
    repeat_extra_bits: u16,
    complete: bool,
}

impl TreeMarshal {
    pub fn new() -> TreeMarshal {
        let mut fixed = PrefixList::preset(PrefixPreset::BrotliComplex);
        fixed.codesort();
        TreeMarshal {
            state: TState::Ident,
            alphabet: 0,
            alphabits: 0,
            bits: 0,
            bit_length: 0,
            index: 0,
            count: 0,
            symbols: [0; 4],
            select: 0,
            simple: false,
            clen_lens: [0; BROTLI_NUM_CLEN_SYMS],
            clen_space: 0,
            nineteen: PrefixList::new(0),
            nineteen_singular: None,
            fixed,
            lens: Vec::new(),
            space: 0,
            nonzero: 0,
            last_nonzero: 8,
            repeat_sym: 0xFF,
            repeat_total: 0,
            repeat_extra_bits: 0,
            complete: false,
        }
    }

    /* Begin reading a prefix code over `alphabet` symbols. */
    pub fn start(&mut self, alphabet: u32) {
        self.state = TState::Ident;
        self.alphabet = alphabet;
        self.alphabits = (32 - (alphabet.max(2) - 1).leading_zeros()) as u16;
        self.bits = 0;
        self.bit_length = 0;
        self.index = 0;
        self.count = 0;
        self.symbols = [0; 4];
        self.select = 0;
        self.simple = false;
        self.clen_lens = [0; BROTLI_NUM_CLEN_SYMS];
        self.clen_space = 0;
        self.nineteen_singular = None;
        self.lens.clear();
        self.lens.resize(alphabet as usize, 0);
        self.space = 0;
        self.nonzero = 0;
        self.last_nonzero = 8;
        self.repeat_sym = 0xFF;
        self.repeat_total = 0;
        self.repeat_extra_bits = 0;
        self.complete = false;
    }

    /* Feed one bit. */
    pub fn step(&mut self, x: u32) -> Result<TreeStep, ApiError> {
        debug_assert!(!self.complete);
        loop {
            match self.state {
                TState::Ident => {
                    self.bits |= x << self.bit_length;
                    self.bit_length += 1;
                    if self.bit_length >= 2 {
                        let ident = self.bits;
                        self.bits = 0;
                        self.bit_length = 0;
                        if ident == 1 {
                            self.simple = true;
                            self.state = TState::SimpleNsym;
                        } else {
                            /* HSKIP leading zero lengths */
                            self.index = ident;
                            self.state = TState::ClenLens;
                        }
                    }
                    return Ok(TreeStep::More);
                }
                TState::SimpleNsym => {
                    self.bits |= x << self.bit_length;
                    self.bit_length += 1;
                    if self.bit_length >= 2 {
                        self.count = self.bits + 1;
                        self.bits = 0;
                        self.bit_length = 0;
                        self.index = 0;
                        self.state = TState::SimpleSymbol;
                    }
                    return Ok(TreeStep::More);
                }
                TState::SimpleSymbol => {
                    self.bits |= x << self.bit_length;
                    self.bit_length += 1;
                    if self.bit_length >= self.alphabits {
                        let sym = self.bits;
                        if sym >= self.alphabet {
                            return Err(ApiError::Sanitize);
                        }
                        for j in 0..self.index {
                            if self.symbols[j as usize] == sym {
                                return Err(ApiError::Sanitize);
                            }
                        }
                        self.symbols[self.index as usize] = sym;
                        self.index += 1;
                        self.bits = 0;
                        self.bit_length = 0;
                        if self.index >= self.count {
                            if self.count == 4 {
                                self.state = TState::SimpleSelect;
                            } else {
                                self.complete = true;
                                return Ok(TreeStep::Complete);
                            }
                        }
                    }
                    return Ok(TreeStep::More);
                }
                TState::SimpleSelect => {
                    self.select = x as u8;
                    self.complete = true;
                    return Ok(TreeStep::Complete);
                }
                TState::ClenLens => {
                    let decoded = {
                        self.bits = (self.bits << 1) | x;
                        let j = self.fixed.codebsearch(self.bit_length + 1, self.bits as u16);
                        if j != NOT_FOUND {
                            let v = self.fixed[j].value;
                            self.bits = 0;
                            self.bit_length = 0;
                            Some(v)
                        } else {
                            self.bit_length += 1;
                            if self.bit_length >= 4 {
                                return Err(ApiError::Sanitize);
                            }
                            None
                        }
                    };
                    if let Some(v) = decoded {
                        let sym = BROTLI_CLEN_PERMUTATION[self.index as usize];
                        self.clen_lens[sym as usize] = v as u16;
                        self.index += 1;
                        if v > 0 {
                            self.clen_space += BROTLI_CLEN_CODE_SPACE >> v;
                            if self.clen_space > BROTLI_CLEN_CODE_SPACE {
                                return Err(ApiError::Sanitize);
                            }
                        }
                        if self.clen_space == BROTLI_CLEN_CODE_SPACE
                            || self.index as usize >= BROTLI_NUM_CLEN_SYMS
                        {
                            self.finish_clen_phase()?;
                            self.state = TState::SymbolCode;
                        }
                    }
                    return Ok(TreeStep::More);
                }
                TState::SymbolCode => {
                    if let Some(sym) = self.nineteen_singular {
                        /* the inner code spends no bits per symbol; repeat
                         * symbols still collect their extra bits */
                        if self.apply_symbol(sym)? {
                            return Ok(TreeStep::CompleteUnconsumed);
                        }
                        continue;
                    }
                    self.bits = (self.bits << 1) | x;
                    let j = self
                        .nineteen
                        .codebsearch(self.bit_length + 1, self.bits as u16);
                    if j != NOT_FOUND {
                        let sym = self.nineteen[j].value;
                        self.bits = 0;
                        self.bit_length = 0;
                        if self.apply_symbol(sym)? {
                            return Ok(TreeStep::Complete);
                        }
                    } else {
                        self.bit_length += 1;
                        if self.bit_length >= 6 {
                            return Err(ApiError::Sanitize);
                        }
                    }
                    return Ok(TreeStep::More);
                }
                TState::RepeatExtra => {
                    self.bits |= x << self.bit_length;
                    self.bit_length += 1;
                    if self.bit_length >= self.repeat_extra_bits {
                        let extra = self.bits;
                        self.bits = 0;
                        self.bit_length = 0;
                        self.state = TState::SymbolCode;
                        if self.apply_repeat(extra)? {
                            self.complete = true;
                            return Ok(TreeStep::Complete);
                        }
                    }
                    return Ok(TreeStep::More);
                }
            }
        }
    }

    fn finish_clen_phase(&mut self) -> Result<(), ApiError> {
        let nonzero = self.clen_lens.iter().filter(|&&l| l > 0).count();
        if nonzero == 0 {
            return Err(ApiError::Sanitize);
        }
        if nonzero == 1 {
            let sym = self.clen_lens.iter().position(|&l| l > 0).unwrap();
            self.nineteen_singular = Some(sym as u32);
            return Ok(());
        }
        if self.clen_space != BROTLI_CLEN_CODE_SPACE {
            log::warn!(
                "code-length code space {} instead of {}",
                self.clen_space,
                BROTLI_CLEN_CODE_SPACE
            );
            return Err(ApiError::Sanitize);
        }
        self.nineteen = PrefixList::new(BROTLI_NUM_CLEN_SYMS);
        for (sym, &len) in self.clen_lens.iter().enumerate() {
            self.nineteen[sym].value = sym as u32;
            self.nineteen[sym].len = len;
        }
        self.nineteen.gen_codes()?;
        self.nineteen.codesort();
        Ok(())
    }

    /*
     * Record one symbol-length symbol; `true` when the code space fills
     * and the tree is complete.  Repeat symbols defer to their extra
     * bits.
     */
    fn apply_symbol(&mut self, sym: u32) -> Result<bool, ApiError> {
        match sym {
            0..=15 => {
                if self.index as usize >= self.lens.len() {
                    return Err(ApiError::Sanitize);
                }
                self.lens[self.index as usize] = sym as u16;
                self.index += 1;
                self.repeat_sym = 0xFF;
                self.repeat_total = 0;
                if sym > 0 {
                    self.space += BROTLI_CODE_SPACE >> sym;
                    self.nonzero += 1;
                    self.last_nonzero = sym as u16;
                    if self.space > BROTLI_CODE_SPACE {
                        return Err(ApiError::Sanitize);
                    }
                    if self.space == BROTLI_CODE_SPACE {
                        self.complete = true;
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            16 | 17 => {
                self.repeat_extra_bits = if sym == 16 { 2 } else { 3 };
                if self.repeat_sym != sym as u8 {
                    self.repeat_total = 0;
                }
                self.repeat_sym = sym as u8;
                self.state = TState::RepeatExtra;
                Ok(false)
            }
            _ => Err(ApiError::Sanitize),
        }
    }

    fn apply_repeat(&mut self, extra: u32) -> Result<bool, ApiError> {
        let (factor, base) = if self.repeat_sym == 16 { (4, 3) } else { (8, 3) };
        let new_total = if self.repeat_total > 0 {
            factor * (self.repeat_total - 2) + base + extra
        } else {
            base + extra
        };
        let delta = new_total - self.repeat_total;
        self.repeat_total = new_total;
        let fill = if self.repeat_sym == 16 {
            self.last_nonzero
        } else {
            0
        };
        if self.index as u64 + delta as u64 > self.lens.len() as u64 {
            return Err(ApiError::Sanitize);
        }
        for _ in 0..delta {
            self.lens[self.index as usize] = fill;
            self.index += 1;
        }
        if fill > 0 {
            self.space += delta * (BROTLI_CODE_SPACE >> fill);
            self.nonzero += delta;
            if self.space > BROTLI_CODE_SPACE {
                return Err(ApiError::Sanitize);
            }
        }
        Ok(self.space == BROTLI_CODE_SPACE)
    }

    /* Build the final code-sorted list after `Complete`. */
    pub fn finish(&mut self) -> Result<PrefixList, ApiError> {
        if !self.complete {
            return Err(ApiError::Sanitize);
        }
        if self.simple {
            return Ok(build_simple(
                &mut self.symbols[..self.count as usize],
                self.select,
            ));
        }
        if self.nonzero < 2 {
            return Err(ApiError::Sanitize);
        }
        let mut list = PrefixList::new(self.alphabet as usize);
        for (i, &len) in self.lens.iter().enumerate() {
            list[i].value = i as u32;
            list[i].len = len;
        }
        list.gen_codes()?;
        list.codesort();
        Ok(list)
    }
}

/*
 * Assemble a simple prefix code.  RFC 7932 section 3.4: two symbols sort
 * fully; three sort all but the first; the four-symbol shapes sort fully
 * (flat) or all but the first two (skewed).
 */
pub fn build_simple(symbols: &mut [u32], select: u8) -> PrefixList {
    let preset = match (symbols.len(), select) {
        (1, _) => PrefixPreset::BrotliSimple1,
        (2, _) => {
            symbols.sort_unstable();
            PrefixPreset::BrotliSimple2
        }
        (3, _) => {
            symbols[1..].sort_unstable();
            PrefixPreset::BrotliSimple3
        }
        (_, 0) => {
            symbols.sort_unstable();
            PrefixPreset::BrotliSimple4A
        }
        _ => {
            symbols[2..].sort_unstable();
            PrefixPreset::BrotliSimple4B
        }
    };
    let shape = PrefixList::preset(preset);
    let mut list = PrefixList::new(symbols.len());
    for (i, &sym) in symbols.iter().enumerate() {
        list[i] = PrefixLine {
            code: shape[i].code,
            len: shape[i].len,
            value: sym,
        };
    }
    list
}

/* A one-line, zero-length list decodes its symbol from no bits at all. */
pub fn singular_value(list: &PrefixList) -> Option<u32> {
    if list.size() == 1 && list[0].len == 0 {
        Some(list[0].value)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /* Feed a bit string (LSB of each byte first) until completion. */
    fn run(marshal: &mut TreeMarshal, bits: &[u32]) -> Result<PrefixList, ApiError> {
        for (n, &b) in bits.iter().enumerate() {
            match marshal.step(b)? {
                TreeStep::More => {}
                TreeStep::Complete => {
                    assert_eq!(n + 1, bits.len(), "tree completed early");
                    return marshal.finish();
                }
                TreeStep::CompleteUnconsumed => {
                    assert_eq!(n + 1, bits.len());
                    return marshal.finish();
                }
            }
        }
        panic!("tree never completed");
    }

    fn bits_of(value: u32, n: u16) -> Vec<u32> {
        (0..n).map(|i| (value >> i) & 1).collect()
    }

    #[test]
    fn simple_one_symbol() {
        let mut m = TreeMarshal::new();
        m.start(256);
        /* ident 01, nsym-1 = 0, symbol 42 over 8 bits */
        let mut stream = bits_of(1, 2);
        stream.extend(bits_of(0, 2));
        stream.extend(bits_of(42, 8));
        let list = run(&mut m, &stream).unwrap();
        assert_eq!(singular_value(&list), Some(42));
    }

    #[test]
    fn simple_two_symbols_sorted() {
        let mut m = TreeMarshal::new();
        m.start(704);
        let mut stream = bits_of(1, 2);
        stream.extend(bits_of(1, 2));
        stream.extend(bits_of(700, 10));
        stream.extend(bits_of(3, 10));
        let list = run(&mut m, &stream).unwrap();
        /* sorted: symbol 3 takes code 0, symbol 700 code 1 */
        assert_eq!(list[list.codebsearch(1, 0)].value, 3);
        assert_eq!(list[list.codebsearch(1, 1)].value, 700);
    }

    #[test]
    fn simple_rejects_duplicates() {
        let mut m = TreeMarshal::new();
        m.start(256);
        let mut stream = bits_of(1, 2);
        stream.extend(bits_of(1, 2));
        stream.extend(bits_of(9, 8));
        stream.extend(bits_of(9, 8));
        let mut failed = false;
        for b in stream {
            if m.step(b).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
    }

    #[test]
    fn repeat_zero_accumulation() {
        /* drive apply_symbol/apply_repeat directly */
        let mut m = TreeMarshal::new();
        m.start(600);
        /* len 1 then a chain of 17s: 3+e zeros, then 8*(t-2)+3+e */
        assert!(!m.apply_symbol(1).unwrap());
        assert!(!m.apply_symbol(17).unwrap());
        assert!(!m.apply_repeat(7).unwrap()); /* 10 zeros */
        assert_eq!(m.index, 11);
        assert!(!m.apply_symbol(17).unwrap());
        assert!(!m.apply_repeat(0).unwrap()); /* total 8*(10-2)+3 = 67 */
        assert_eq!(m.index, 1 + 67);
        /* a literal length resets the accumulation */
        assert!(m.apply_symbol(1).unwrap(), "space must fill at second len-1");
    }

    #[test]
    fn repeat_sixteen_uses_last_nonzero() {
        let mut m = TreeMarshal::new();
        m.start(64);
        assert!(!m.apply_symbol(4).unwrap());
        assert!(!m.apply_symbol(16).unwrap());
        /* repeat len 4, three more times */
        assert!(!m.apply_repeat(0).unwrap());
        assert_eq!(m.lens[..4], [4, 4, 4, 4]);
        assert_eq!(m.nonzero, 4);
    }
}
