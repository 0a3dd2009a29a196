//! Leaf deltas: the key filter over a logged full image, and the merge that
//! turns a delta back into a full leaf.
//!
//! A delta keeps only the slots dirtied since the last full image. Its
//! [`KeyFilter`] answers "might the full image contain this key?" without
//! reading the image; a negative answer is exact.

use crate::slot::Slot;

/// Bits per key. With three probes this keeps false positives near 1%.
const BITS_PER_KEY: usize = 10;

const PROBES: u64 = 3;

/// Bloom filter over the keys of a full leaf image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFilter {
    bits: Box<[u64]>,
}

impl KeyFilter {
    /// Build from `keys`.
    #[must_use]
    pub fn build<'a>(keys: impl ExactSizeIterator<Item = &'a [u8]>) -> Self {
        let words = (keys.len() * BITS_PER_KEY).div_ceil(64).max(1);
        let mut filter = Self {
            bits: vec![0_u64; words].into_boxed_slice(),
        };
        for key in keys {
            filter.insert(key);
        }
        filter
    }

    fn bit_count(&self) -> u64 {
        self.bits.len() as u64 * 64
    }

    fn probes(&self, key: &[u8]) -> impl Iterator<Item = u64> + use<> {
        let h1 = fnv1a(key);
        let h2 = h1.rotate_left(31).wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
        let m = self.bit_count();
        (0..PROBES).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % m)
    }

    fn insert(&mut self, key: &[u8]) {
        for bit in self.probes(key) {
            #[expect(clippy::cast_possible_truncation, reason = "bit < bits.len() * 64")]
            let word = (bit / 64) as usize;
            self.bits[word] |= 1 << (bit % 64);
        }
    }

    /// `false` means the key is certainly absent.
    #[must_use]
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.probes(key).all(|bit| {
            #[expect(clippy::cast_possible_truncation, reason = "bit < bits.len() * 64")]
            let word = (bit / 64) as usize;
            self.bits[word] & (1 << (bit % 64)) != 0
        })
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325_u64, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Merge `delta` over `full`.
///
/// Both inputs are sorted by key. A delta slot replaces the full slot with
/// the same key; tombstones become ordinary deleted slots. Returns the merged
/// slots and, for each delta index, its index in the merged vector.
#[must_use]
pub fn merge_delta(full: Vec<Slot>, delta: Vec<Slot>) -> (Vec<Slot>, Vec<usize>) {
    let mut merged: Vec<Slot> = Vec::with_capacity(full.len() + delta.len());
    let mut delta_index: Vec<usize> = Vec::with_capacity(delta.len());

    let mut full = full.into_iter().peekable();
    for mut slot in delta {
        while let Some(base) = full.next_if(|base| base.key() < slot.key()) {
            merged.push(base);
        }
        if full.peek().is_some_and(|base| base.key() == slot.key()) {
            let _ = full.next();
        }
        slot.clear_tombstone();
        delta_index.push(merged.len());
        merged.push(slot);
    }
    merged.extend(full);

    (merged, delta_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsn::Lsn;

    fn live(key: &[u8], lsn: u64) -> Slot {
        let mut slot = Slot::new(key);
        slot.set_lsn(Lsn::from_raw(lsn));
        slot
    }

    #[test]
    fn test_filter_has_no_false_negatives() {
        let keys: Vec<Vec<u8>> = (0..500_u32).map(|i| i.to_be_bytes().to_vec()).collect();
        let filter = KeyFilter::build(keys.iter().map(Vec::as_slice));
        assert!(keys.iter().all(|k| filter.may_contain(k)));
    }

    #[test]
    fn test_filter_rejects_most_absent_keys() {
        let keys: Vec<Vec<u8>> = (0..200_u32).map(|i| i.to_be_bytes().to_vec()).collect();
        let filter = KeyFilter::build(keys.iter().map(Vec::as_slice));
        let false_positives = (1000..3000_u32)
            .filter(|i| filter.may_contain(&i.to_be_bytes()))
            .count();
        assert!(false_positives < 200, "{false_positives} false positives");
    }

    #[test]
    fn test_empty_filter() {
        let filter = KeyFilter::build(std::iter::empty());
        assert!(!filter.may_contain(b"anything"));
    }

    #[test]
    fn test_merge_replaces_and_interleaves() {
        let full = vec![live(b"a", 1), live(b"c", 2), live(b"e", 3)];
        let mut gone = Slot::tombstone(b"c");
        gone.set_lsn(Lsn::from_raw(10));
        gone.mark_known_deleted();
        let delta = vec![live(b"b", 9), gone, live(b"f", 11)];

        let (merged, map) = merge_delta(full, delta);

        let keys: Vec<&[u8]> = merged.iter().map(Slot::key).collect();
        assert_eq!(keys, vec![&b"a"[..], b"b", b"c", b"e", b"f"]);
        assert_eq!(map, vec![1, 2, 4]);
        assert!(merged[2].is_known_deleted());
        assert!(!merged[2].is_tombstone());
        assert_eq!(merged[2].lsn(), Lsn::from_raw(10));
    }
}
