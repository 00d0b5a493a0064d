/// Inclusive bit-range extraction, `value.sel(hi, lo)`.
pub trait BitSlice: Sized {
    fn sel(&self, hi: u32, lo: u32) -> Self;
    fn bit(&self, idx: u32) -> bool;
}

macro_rules! impl_bit_slice {
    ($($t:ty),*) => {
        $(
            impl BitSlice for $t {
                fn sel(&self, hi: u32, lo: u32) -> $t {
                    assert!(hi >= lo, "bad bit range [{}:{}]", hi, lo);
                    assert!(hi < <$t>::BITS, "bit {} out of range", hi);
                    let width = hi - lo + 1;
                    if width == <$t>::BITS {
                        *self
                    } else {
                        (*self >> lo) & ((1 << width) - 1)
                    }
                }

                fn bit(&self, idx: u32) -> bool {
                    (*self >> idx) & 1 == 1
                }
            }
        )*
    };
}

impl_bit_slice!(u8, u16, u32, u64);

/// Number of 32-bit words needed to hold `length_bits`.
pub fn words_for(length_bits: u32) -> usize {
    length_bits.div_ceil(32) as usize
}

/// Bit `idx` of a little-endian word vector.
pub fn word_bit(words: &[u32], idx: u32) -> bool {
    words
        .get((idx / 32) as usize)
        .map(|w| w.bit(idx % 32))
        .unwrap_or(false)
}

pub fn set_word_bit(words: &mut [u32], idx: u32, value: bool) {
    let word = &mut words[(idx / 32) as usize];
    if value {
        *word |= 1 << (idx % 32);
    } else {
        *word &= !(1 << (idx % 32));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sel_extracts_inclusive_ranges() {
        assert_eq!(0xABCDu16.sel(15, 8), 0xAB);
        assert_eq!(0xABCDu16.sel(3, 0), 0xD);
        assert_eq!(0xdead_beefu32.sel(31, 0), 0xdead_beef);
        assert!(0b100u32.bit(2));
    }

    #[test]
    fn word_bits() {
        let mut words = vec![0u32; 2];
        set_word_bit(&mut words, 33, true);
        assert_eq!(words, vec![0, 2]);
        assert!(word_bit(&words, 33));
        assert!(!word_bit(&words, 64));
        assert_eq!(words_for(33), 2);
        assert_eq!(words_for(32), 1);
    }
}
