use bytes::{Buf, BufMut};
use halcyon_codec::{util::read_len, varint, EncodeSize, Error as CodecError, RangeCfg, Read, ReadExt, Write};
use std::fmt::{Debug, Display};

/// Fixed-length set of bits (used to track which voters participated).
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct BitArray {
    bits: usize,
    elems: Vec<u64>,
}

impl BitArray {
    pub fn new(bits: usize) -> Self {
        Self {
            bits,
            elems: vec![0; bits.div_ceil(64)],
        }
    }

    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Returns the bit at `index` (false if out of range).
    pub fn get(&self, index: usize) -> bool {
        if index >= self.bits {
            return false;
        }
        self.elems[index / 64] & (1 << (index % 64)) != 0
    }

    /// Sets the bit at `index`, returning false if out of range.
    pub fn set(&mut self, index: usize, value: bool) -> bool {
        if index >= self.bits {
            return false;
        }
        if value {
            self.elems[index / 64] |= 1 << (index % 64);
        } else {
            self.elems[index / 64] &= !(1 << (index % 64));
        }
        true
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.elems.iter().map(|elem| elem.count_ones() as usize).sum()
    }

    /// Bits set in `self` but not in `other`.
    pub fn sub(&self, other: &BitArray) -> BitArray {
        let mut result = self.clone();
        for (elem, other) in result.elems.iter_mut().zip(other.elems.iter()) {
            *elem &= !other;
        }
        result
    }

    /// Iterate over the indices of set bits.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.bits).filter(|index| self.get(*index))
    }
}

impl Write for BitArray {
    fn write(&self, buf: &mut impl BufMut) {
        varint::write(self.bits as u64, buf);
        for elem in &self.elems {
            elem.write(buf);
        }
    }
}

impl EncodeSize for BitArray {
    fn encode_size(&self) -> usize {
        varint::size(self.bits as u64) + self.elems.len() * 8
    }
}

impl Read for BitArray {
    type Cfg = RangeCfg;

    fn read_cfg(buf: &mut impl Buf, range: &RangeCfg) -> Result<Self, CodecError> {
        let bits = read_len(buf, range)?;
        let mut result = Self::new(bits);
        for elem in result.elems.iter_mut() {
            *elem = u64::read(buf)?;
        }
        if bits % 64 != 0 {
            let last = result.elems.len() - 1;
            if result.elems[last] >> (bits % 64) != 0 {
                return Err(CodecError::Invalid("BitArray", "trailing bits set"));
            }
        }
        Ok(result)
    }
}

impl Display for BitArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for index in 0..self.bits {
            f.write_str(if self.get(index) { "x" } else { "_" })?;
        }
        Ok(())
    }
}

impl Debug for BitArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BA{{{}:{}}}", self.bits, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halcyon_codec::{Decode, Encode};

    #[test]
    fn test_set_get_count() {
        let mut bits = BitArray::new(70);
        assert_eq!(bits.count(), 0);
        assert!(bits.set(0, true));
        assert!(bits.set(65, true));
        assert!(!bits.set(70, true));
        assert!(bits.get(65));
        assert!(!bits.get(64));
        assert_eq!(bits.count(), 2);
        assert_eq!(bits.ones().collect::<Vec<_>>(), vec![0, 65]);

        bits.set(0, false);
        assert_eq!(bits.count(), 1);
    }

    #[test]
    fn test_sub_and_display() {
        let mut a = BitArray::new(4);
        let mut b = BitArray::new(4);
        a.set(0, true);
        a.set(2, true);
        b.set(2, true);
        assert_eq!(a.sub(&b).to_string(), "x___");
        assert_eq!(a.to_string(), "x_x_");
    }

    #[test]
    fn test_codec_rejects_trailing_bits() {
        let mut bits = BitArray::new(3);
        bits.set(1, true);
        let encoded = bits.encode();
        let decoded = BitArray::decode_cfg(encoded.clone(), &(..).into()).unwrap();
        assert_eq!(decoded, bits);

        let mut tampered = encoded.to_vec();
        let last = tampered.len() - 1;
        tampered[last] = 0xff;
        assert!(BitArray::decode_cfg(&tampered[..], &(..).into()).is_err());
    }
}
