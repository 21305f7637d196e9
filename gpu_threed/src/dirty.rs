//! Grouped dirty tracking over the register bank.
//!
//! Registers are partitioned into update groups. Each group declares the
//! word ranges it depends on; marking a word dirty sets the bit of every
//! group whose ranges contain it. Draining visits set bits in ascending
//! group order, which is how inter-group ordering is enforced.

use crate::regs::REG_WORDS;

/// Upper bound on update groups; the dirty set is a single 64-bit word.
pub const MAX_GROUPS: usize = 64;

/// A contiguous run of register words a group depends on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegSpan {
    pub word: u16,
    pub words: u16,
}

impl RegSpan {
    pub const fn new(word: usize, words: usize) -> Self {
        Self {
            word: word as u16,
            words: words as u16,
        }
    }
}

/// Builds a [`RegSpan`] covering a named register field.
#[macro_export]
macro_rules! reg_span {
    ($field:ident: $ty:ty) => {
        $crate::dirty::RegSpan::new(
            core::mem::offset_of!($crate::regs::ThreedRegisters, $field) / 4,
            core::mem::size_of::<$ty>() / 4,
        )
    };
}

/// Change detection over the register bank.
///
/// Group membership is fixed at construction. The per-word group masks are
/// precomputed into a flat table so `set_dirty` is a single load and or.
#[derive(Debug)]
pub struct UpdateTracker {
    word_groups: Box<[u64; REG_WORDS]>,
    all_mask: u64,
    dirty: u64,
}

impl UpdateTracker {
    /// Creates a tracker from per-group dependency spans; the slice index is
    /// the group index.
    pub fn new(groups: &[&[RegSpan]]) -> Self {
        assert!(groups.len() <= MAX_GROUPS);

        let mut word_groups = vec![0u64; REG_WORDS].into_boxed_slice();
        for (index, spans) in groups.iter().enumerate() {
            let bit = 1u64 << index;
            for span in *spans {
                let start = usize::from(span.word);
                let end = start + usize::from(span.words);
                assert!(end <= REG_WORDS, "group {index} spans past the bank");
                for mask in &mut word_groups[start..end] {
                    *mask |= bit;
                }
            }
        }

        let all_mask = if groups.len() == MAX_GROUPS {
            u64::MAX
        } else {
            (1u64 << groups.len()) - 1
        };

        Self {
            word_groups: word_groups.try_into().unwrap(),
            all_mask,
            dirty: all_mask,
        }
    }

    /// Marks every group depending on `word_offset` dirty.
    pub fn set_dirty(&mut self, word_offset: usize) {
        if let Some(mask) = self.word_groups.get(word_offset) {
            self.dirty |= mask;
        }
    }

    /// Marks a single group dirty.
    pub fn force_dirty(&mut self, group: usize) {
        debug_assert!(1u64 << group & self.all_mask != 0);
        self.dirty |= 1 << group;
    }

    /// Marks every group dirty.
    pub fn set_all_dirty(&mut self) {
        self.dirty = self.all_mask;
    }

    pub fn is_dirty(&self, group: usize) -> bool {
        self.dirty & (1 << group) != 0
    }

    pub fn any_dirty(&self, mask: u64) -> bool {
        self.dirty & mask != 0
    }

    /// Takes the lowest dirty group selected by `mask` and clears its bit.
    ///
    /// Draining through repeated calls yields groups in ascending index
    /// order; callers rely on that for inter-group ordering.
    pub fn take_next(&mut self, mask: u64) -> Option<usize> {
        let avail = self.dirty & mask;
        if avail == 0 {
            return None;
        }

        let group = avail.trailing_zeros() as usize;
        self.dirty &= !(1 << group);
        Some(group)
    }
}
