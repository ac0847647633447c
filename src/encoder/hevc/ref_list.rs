// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per frame-store slot bookkeeping of the pictures seen by the encoder.

use std::ops::Index;

use crate::backend::ResourceHandle;
use crate::codec::h265::params::CodecPicture;
use crate::codec::h265::params::FrameIdx;
use crate::codec::h265::params::MAX_NUM_REF_FRAME;
use crate::codec::h265::params::NUM_UNCOMPRESSED_SURFACE;

/// What the encoder remembers about the last picture that occupied a frame-store slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefListEntry {
    pub ref_pic: CodecPicture,
    pub recon: Option<ResourceHandle>,
    pub raw: Option<ResourceHandle>,
    /// Surface later pictures read when referencing this one: `raw` or `recon` depending on
    /// whether raw pictures are used as references.
    pub ref_buffer: Option<ResourceHandle>,
    pub used_as_ref: bool,
    pub poc: i32,
    /// Distinct frame-store indices of the reference frame list this picture was encoded with,
    /// in list order.
    pub ref_list: Vec<FrameIdx>,
    pub slice_qp: i32,
    in_use: bool,
}

impl RefListEntry {
    pub fn in_use(&self) -> bool {
        self.in_use
    }

    pub fn num_ref(&self) -> usize {
        self.ref_list.len()
    }
}

/// Fixed capacity table of [`RefListEntry`], one per frame-store index.
#[derive(Debug)]
pub struct RefListTable {
    entries: [RefListEntry; NUM_UNCOMPRESSED_SURFACE],
}

impl Default for RefListTable {
    fn default() -> Self {
        Self {
            entries: std::array::from_fn(|_| Default::default()),
        }
    }
}

impl RefListTable {
    /// Returns the entry for `idx`, marking it as in use. The previous content of the entry is
    /// kept, callers overwrite the fields they own.
    pub fn claim(&mut self, idx: FrameIdx) -> &mut RefListEntry {
        let entry = &mut self.entries[idx.as_usize()];
        entry.in_use = true;
        entry
    }

    /// Mutable access to an entry without changing its usage tag.
    pub fn get_mut(&mut self, idx: FrameIdx) -> &mut RefListEntry {
        &mut self.entries[idx.as_usize()]
    }

    #[cfg(test)]
    pub(crate) fn in_use_count(&self) -> usize {
        self.entries.iter().filter(|e| e.in_use).count()
    }

    /// Records the references of the picture stored at `idx`.
    pub fn set_ref_list(&mut self, idx: FrameIdx, refs: &[FrameIdx]) {
        debug_assert!(refs.len() <= MAX_NUM_REF_FRAME);
        let entry = self.get_mut(idx);
        entry.ref_list.clear();
        entry.ref_list.extend_from_slice(refs);
    }
}

impl Index<FrameIdx> for RefListTable {
    type Output = RefListEntry;

    fn index(&self, idx: FrameIdx) -> &Self::Output {
        &self.entries[idx.as_usize()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx(i: u8) -> FrameIdx {
        FrameIdx::new(i).unwrap()
    }

    #[test]
    fn claim_tags_entries() {
        let mut table = RefListTable::default();
        assert_eq!(table.in_use_count(), 0);

        table.claim(idx(3)).poc = 12;
        table.claim(idx(126)).used_as_ref = true;
        table.claim(idx(3)).recon = Some(ResourceHandle(7));

        assert_eq!(table.in_use_count(), 2);
        assert!(table[idx(3)].in_use());
        assert_eq!(table[idx(3)].poc, 12);
        assert_eq!(table[idx(3)].recon, Some(ResourceHandle(7)));
        assert!(!table[idx(4)].in_use());

        // Plain mutable access does not tag.
        table.get_mut(idx(5)).poc = 1;
        assert!(!table[idx(5)].in_use());
        assert_eq!(table[idx(4)], RefListEntry::default());
    }

    #[test]
    fn ref_list_is_replaced() {
        let mut table = RefListTable::default();
        table.set_ref_list(idx(1), &[idx(4), idx(2)]);
        assert_eq!(table[idx(1)].num_ref(), 2);

        table.set_ref_list(idx(1), &[idx(9)]);
        assert_eq!(table[idx(1)].ref_list, vec![idx(9)]);
    }
}
