// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Compaction of the 16 entry reference frame list into the hardware reference index space.
//!
//! The client reference frame list may contain the same frame-store index several times. The
//! hardware only has [`MAX_CUR_NUM_REF_FRAME`] reference slots, so every physical frame gets one
//! compact index, given out in list order, and the duplicates alias it.

use crate::codec::h265::params::CodecPicture;
use crate::codec::h265::params::CodingType;
use crate::codec::h265::params::FrameIdx;
use crate::codec::h265::params::PictureParameters;
use crate::codec::h265::params::SliceParameters;
use crate::codec::h265::params::MAX_CUR_NUM_REF_FRAME;
use crate::codec::h265::params::MAX_NUM_REF_FRAME;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;

/// Reference bookkeeping of one picture.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferenceMap {
    mapping: [Option<u8>; MAX_NUM_REF_FRAME],
    used: [bool; MAX_NUM_REF_FRAME],
    /// Frame-store index of each compact index.
    ref_list: Vec<FrameIdx>,
    /// Valid reference frame list entries with a distinct frame-store index, with their list
    /// position.
    unique_refs: Vec<(usize, CodecPicture)>,
    coding_type: CodingType,
}

impl ReferenceMap {
    /// Compact index of reference frame list position `pos`, `None` if the position is not
    /// referenced by any slice.
    pub fn mapping(&self, pos: usize) -> Option<u8> {
        self.mapping.get(pos).copied().flatten()
    }

    /// Mapping in the form the hardware expects it, -1 marking unused positions.
    pub fn hw_mapping(&self) -> [i8; MAX_NUM_REF_FRAME] {
        self.mapping.map(|m| m.map_or(-1, |idx| idx as i8))
    }

    pub fn is_used(&self, pos: usize) -> bool {
        self.used.get(pos).copied().unwrap_or(false)
    }

    /// Number of distinct frames referenced by the slices of the picture.
    pub fn num_ref(&self) -> usize {
        self.ref_list.len()
    }

    pub fn ref_list(&self) -> &[FrameIdx] {
        &self.ref_list
    }

    pub fn unique_refs(&self) -> &[(usize, CodecPicture)] {
        &self.unique_refs
    }

    /// Coding type the hardware is programmed with. P and B pictures without any valid reference
    /// are encoded as I pictures, while their headers keep the original type.
    pub fn coding_type(&self) -> CodingType {
        self.coding_type
    }
}

pub fn map_reference_indices(
    pic: &PictureParameters,
    slices: &[SliceParameters],
) -> EncodeResult<ReferenceMap> {
    let mut map = ReferenceMap {
        coding_type: pic.coding_type,
        ..Default::default()
    };

    for slice in slices {
        for list in 0..2 {
            for pos in slice.active_refs(list).iter().flatten() {
                let pos = usize::from(*pos);
                if pos < MAX_NUM_REF_FRAME && pic.ref_frame_list[pos].is_some() {
                    map.used[pos] = true;
                }
            }
        }
    }

    for pos in 0..MAX_NUM_REF_FRAME {
        let Some(frame) = pic.ref_frame_list[pos].filter(|_| map.used[pos]) else {
            continue;
        };

        let alias = (0..pos)
            .filter(|prev| map.used[*prev])
            .find(|prev| pic.ref_frame_list[*prev].map(|p| p.frame_idx) == Some(frame.frame_idx));

        if let Some(prev) = alias {
            map.mapping[pos] = map.mapping[prev];
            continue;
        }

        if map.ref_list.len() >= MAX_CUR_NUM_REF_FRAME {
            return Err(EncodeError::invalid(format!(
                "more than {} distinct reference frames",
                MAX_CUR_NUM_REF_FRAME
            )));
        }

        map.mapping[pos] = Some(map.ref_list.len() as u8);
        map.ref_list.push(frame.frame_idx);
    }

    if pic.coding_type != CodingType::I {
        if let Some(col) = pic.collocated_ref_pic_index.map(usize::from) {
            if col >= MAX_NUM_REF_FRAME || !map.used[col] || map.mapping[col].is_none() {
                return Err(EncodeError::invalid(format!(
                    "invalid collocated reference index {}",
                    col
                )));
            }
        }
    }

    for (pos, ref_pic) in pic.valid_refs() {
        if !map
            .unique_refs
            .iter()
            .any(|(_, seen)| seen.frame_idx == ref_pic.frame_idx)
        {
            map.unique_refs.push((pos, ref_pic));
        }
    }

    if map.unique_refs.is_empty() && pic.coding_type != CodingType::I {
        log::trace!(
            "{:?} picture without valid references, encoding as I",
            pic.coding_type
        );
        map.coding_type = CodingType::I;
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h265::params::SliceType;

    fn make_pic(refs: &[(usize, u8)], coding_type: CodingType) -> PictureParameters {
        let mut pic = PictureParameters {
            coding_type,
            ..Default::default()
        };
        for (pos, frame) in refs {
            pic.ref_frame_list[*pos] = Some(CodecPicture::new(FrameIdx::new(*frame).unwrap()));
        }
        pic
    }

    fn slice(l0: &[u8], l1: &[u8]) -> SliceParameters {
        let mut slice = SliceParameters {
            slice_type: if l1.is_empty() {
                SliceType::P
            } else {
                SliceType::B
            },
            num_ref_idx_l0_active_minus1: l0.len().saturating_sub(1) as u8,
            num_ref_idx_l1_active_minus1: l1.len().saturating_sub(1) as u8,
            ..Default::default()
        };
        for (i, pos) in l0.iter().enumerate() {
            slice.ref_pic_list[0][i] = Some(*pos);
        }
        for (i, pos) in l1.iter().enumerate() {
            slice.ref_pic_list[1][i] = Some(*pos);
        }
        slice
    }

    #[test]
    fn duplicates_share_compact_index() {
        // Frame 5 appears at positions 0 and 2.
        let pic = make_pic(&[(0, 5), (1, 9), (2, 5)], CodingType::B);
        let map = map_reference_indices(&pic, &[slice(&[0, 1], &[2])]).unwrap();

        assert_eq!(map.mapping(0), Some(0));
        assert_eq!(map.mapping(1), Some(1));
        assert_eq!(map.mapping(2), Some(0));
        assert_eq!(map.num_ref(), 2);
        assert_eq!(
            map.ref_list(),
            &[FrameIdx::new(5).unwrap(), FrameIdx::new(9).unwrap()]
        );

        let hw = map.hw_mapping();
        assert_eq!(&hw[..4], &[0, 1, 0, -1]);
        assert!(hw[3..].iter().all(|m| *m == -1));
    }

    #[test]
    fn compact_indices_are_dense_in_list_order() {
        let pic = make_pic(&[(1, 3), (4, 1), (6, 2), (9, 3)], CodingType::P);
        // Only positions 4, 6 and 9 are referenced.
        let map = map_reference_indices(&pic, &[slice(&[9, 6], &[]), slice(&[4], &[])]).unwrap();

        assert!(!map.is_used(1));
        assert_eq!(map.mapping(1), None);
        assert_eq!(map.mapping(4), Some(0));
        assert_eq!(map.mapping(6), Some(1));
        // Position 1 holds frame 3 as well, but it is unused so frame 3 gets a fresh index.
        assert_eq!(map.mapping(9), Some(2));
        assert_eq!(map.num_ref(), 3);
    }

    #[test]
    fn references_to_empty_entries_are_ignored() {
        let pic = make_pic(&[(0, 2)], CodingType::P);
        let map = map_reference_indices(&pic, &[slice(&[0, 3, 15], &[])]).unwrap();

        assert!(map.is_used(0));
        assert!(!map.is_used(3));
        assert_eq!(map.num_ref(), 1);
    }

    #[test]
    fn too_many_distinct_references() {
        let refs: Vec<(usize, u8)> = (0..9).map(|i| (i, i as u8 + 10)).collect();
        let pic = make_pic(&refs, CodingType::P);
        let l0: Vec<u8> = (0..9).collect();

        assert!(matches!(
            map_reference_indices(&pic, &[slice(&l0, &[])]),
            Err(EncodeError::InvalidParameter(_))
        ));

        // 16 positions over 8 frames fit.
        let refs: Vec<(usize, u8)> = (0..16).map(|i| (i, (i % 8) as u8)).collect();
        let pic = make_pic(&refs, CodingType::B);
        let l0: Vec<u8> = (0..8).collect();
        let l1: Vec<u8> = (8..16).collect();
        let map = map_reference_indices(&pic, &[slice(&l0, &l1)]).unwrap();
        assert_eq!(map.num_ref(), 8);
        assert_eq!(map.mapping(15), Some(7));
    }

    #[test]
    fn collocated_reference_must_be_used() {
        let mut pic = make_pic(&[(0, 1), (1, 2)], CodingType::P);
        pic.collocated_ref_pic_index = Some(0);
        assert!(map_reference_indices(&pic, &[slice(&[0], &[])]).is_ok());

        pic.collocated_ref_pic_index = Some(1);
        assert!(map_reference_indices(&pic, &[slice(&[0], &[])]).is_err());

        pic.collocated_ref_pic_index = Some(16);
        assert!(map_reference_indices(&pic, &[slice(&[0], &[])]).is_err());

        // Not checked for I pictures.
        pic.coding_type = CodingType::I;
        assert!(map_reference_indices(&pic, &[slice(&[0], &[])]).is_ok());
    }

    #[test]
    fn empty_reference_list_downgrades_to_i() {
        let _ = env_logger::try_init();

        let pic = make_pic(&[], CodingType::B);
        let slices = [slice(&[0], &[1])];
        let map = map_reference_indices(&pic, &slices).unwrap();

        assert_eq!(map.coding_type(), CodingType::I);
        assert_eq!(map.num_ref(), 0);
        // The input is left untouched.
        assert_eq!(pic.coding_type, CodingType::B);

        let pic = make_pic(&[(3, 1)], CodingType::B);
        assert_eq!(
            map_reference_indices(&pic, &slices).unwrap().coding_type(),
            CodingType::B
        );
    }

    #[test]
    fn unique_refs_cover_all_valid_entries() {
        // Frame 7 at positions 2 and 5; none of them is referenced by a slice.
        let pic = make_pic(&[(2, 7), (3, 8), (5, 7)], CodingType::P);
        let map = map_reference_indices(&pic, &[slice(&[3], &[])]).unwrap();

        let positions: Vec<usize> = map.unique_refs().iter().map(|(pos, _)| *pos).collect();
        assert_eq!(positions, vec![2, 3]);
    }
}
