// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encoder-side H.265 syntax structures as handed over by the client for every picture.
//!
//! These mirror the sequence, picture and slice parameter buffers of a VA-style encode API rather
//! than the bitstream syntax itself: frame identities are frame-store indices, not POCs, and the
//! reference lists of a slice index into the picture's `ref_frame_list`.

use enumn::N;

/// Number of entries in the picture level reference frame list.
pub const MAX_NUM_REF_FRAME: usize = 16;

/// Maximum number of distinct reference frames the hardware can address for one picture.
pub const MAX_CUR_NUM_REF_FRAME: usize = 8;

/// Number of entries in each of the slice level reference picture lists.
pub const MAX_NUM_REF_IDX_ACTIVE: usize = 15;

/// Size of the frame-store index domain, i.e. the number of uncompressed surfaces that may be
/// tracked by the encoder at the same time.
pub const NUM_UNCOMPRESSED_SURFACE: usize = 127;

/// Highest QP a slice may be encoded with.
pub const MAX_SLICE_QP: i32 = 51;

/// Valid range of the ICQ/QVBR quality factor.
pub const MIN_ICQ_QUALITY_FACTOR: u8 = 1;
pub const MAX_ICQ_QUALITY_FACTOR: u8 = 51;

/// Index into the encoder frame store. Always below [`NUM_UNCOMPRESSED_SURFACE`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameIdx(u8);

impl FrameIdx {
    /// Returns `None` if `idx` lies outside of the frame-store domain.
    pub fn new(idx: u8) -> Option<Self> {
        if usize::from(idx) < NUM_UNCOMPRESSED_SURFACE {
            Some(Self(idx))
        } else {
            None
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        usize::from(self.0)
    }
}

/// A picture as identified by the client: its frame-store slot plus the reference marking.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CodecPicture {
    pub frame_idx: FrameIdx,
    pub long_term: bool,
}

impl CodecPicture {
    pub fn new(frame_idx: FrameIdx) -> Self {
        Self {
            frame_idx,
            long_term: false,
        }
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RateControlMethod {
    Cbr = 1,
    Vbr = 2,
    #[default]
    Cqp = 3,
    Avbr = 4,
    Icq = 6,
    Vcm = 7,
    Qvbr = 8,
}

impl RateControlMethod {
    /// Whether this method is driven by the bit-rate control kernels.
    pub fn is_brc(&self) -> bool {
        !matches!(self, RateControlMethod::Cqp)
    }

    /// ICQ and QVBR are quality-factor driven and need LCU level BRC.
    pub fn is_quality_based(&self) -> bool {
        matches!(self, RateControlMethod::Icq | RateControlMethod::Qvbr)
    }
}

/// Per-macroblock (LCU for HEVC) BRC mode requested by the client.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MbBrcMode {
    /// Let the driver decide based on the target usage.
    #[default]
    Internal = 0,
    Enabled = 1,
    Disabled = 2,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CodingType {
    #[default]
    I = 1,
    P = 2,
    B = 3,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SliceType {
    B = 0,
    P = 1,
    #[default]
    I = 2,
}

impl SliceType {
    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChromaFormat {
    Monochrome = 0,
    #[default]
    Yuv420 = 1,
    Yuv422 = 2,
    Yuv444 = 3,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceParameters {
    pub frame_width_in_min_cb_minus1: u16,
    pub frame_height_in_min_cb_minus1: u16,
    pub log2_min_coding_block_size_minus3: u8,
    pub log2_max_coding_block_size_minus3: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub chroma_format_idc: ChromaFormat,

    pub rate_control_method: RateControlMethod,
    pub mb_brc: MbBrcMode,
    /// 1 (best quality) to 7 (best speed).
    pub target_usage: u8,
    pub icq_quality_factor: u8,
    pub target_bit_rate: u32,
    pub max_bit_rate: u32,
    pub reset_brc: bool,

    pub gop_pic_size: u16,
    pub gop_ref_dist: u8,

    pub sao_enabled_flag: bool,
    pub scaling_list_enable_flag: bool,
    pub screen_content: bool,
}

impl SequenceParameters {
    /// Returns the raw syntax fields needed to describe a frame of `width`x`height` with the
    /// given minimum coding block size. Dimensions are rounded up to whole coding blocks.
    ///
    /// `log2_min_cb_size` is clamped to 3..=6, the coding block sizes HEVC allows.
    pub fn with_frame_size(width: u32, height: u32, log2_min_cb_size: u8) -> Self {
        let log2_min_cb_size = log2_min_cb_size.clamp(3, 6);
        let cb = 1u32 << log2_min_cb_size;
        Self {
            frame_width_in_min_cb_minus1: width.div_ceil(cb).saturating_sub(1) as u16,
            frame_height_in_min_cb_minus1: height.div_ceil(cb).saturating_sub(1) as u16,
            log2_min_coding_block_size_minus3: log2_min_cb_size - 3,
            log2_max_coding_block_size_minus3: 3,
            target_usage: 4,
            gop_pic_size: 30,
            gop_ref_dist: 1,
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PictureParameters {
    pub curr_original_pic: CodecPicture,
    pub curr_reconstructed_pic: CodecPicture,
    /// Reference frames of the picture, `None` for unused entries. The same frame-store index may
    /// appear more than once.
    pub ref_frame_list: [Option<CodecPicture>; MAX_NUM_REF_FRAME],
    pub ref_frame_poc_list: [i32; MAX_NUM_REF_FRAME],
    pub curr_pic_order_cnt: i32,
    pub coding_type: CodingType,
    /// Position in `ref_frame_list` of the collocated picture for temporal MV prediction.
    pub collocated_ref_pic_index: Option<u8>,
    pub qp_y: u8,
    pub used_as_ref: bool,
    pub use_raw_pic_for_ref: bool,
    pub tiles_enabled_flag: bool,
    pub num_slices: u32,
    pub last_pic_in_seq: bool,
    pub last_pic_in_stream: bool,
    pub status_report_feedback_number: u32,
    /// 0 means "no limit requested".
    pub lcu_max_bitsize_allowed: u32,
    pub screen_content: bool,
}

impl Default for PictureParameters {
    fn default() -> Self {
        Self {
            curr_original_pic: Default::default(),
            curr_reconstructed_pic: Default::default(),
            ref_frame_list: [None; MAX_NUM_REF_FRAME],
            ref_frame_poc_list: [0; MAX_NUM_REF_FRAME],
            curr_pic_order_cnt: 0,
            coding_type: CodingType::I,
            collocated_ref_pic_index: None,
            qp_y: 26,
            used_as_ref: true,
            use_raw_pic_for_ref: false,
            tiles_enabled_flag: false,
            num_slices: 1,
            last_pic_in_seq: false,
            last_pic_in_stream: false,
            status_report_feedback_number: 0,
            lcu_max_bitsize_allowed: 0,
            screen_content: false,
        }
    }
}

impl PictureParameters {
    /// Iterates over the valid entries of the reference frame list with their list position.
    pub fn valid_refs(&self) -> impl Iterator<Item = (usize, CodecPicture)> + '_ {
        self.ref_frame_list
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.map(|r| (i, r)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceParameters {
    pub slice_segment_address: u32,
    pub num_lcus_in_slice: u32,
    pub slice_type: SliceType,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    /// L0 and L1 entries, each one a position in the picture's `ref_frame_list`.
    pub ref_pic_list: [[Option<u8>; MAX_NUM_REF_IDX_ACTIVE]; 2],
    pub slice_qp_delta: i8,
    pub slice_sao_luma_flag: bool,
    pub slice_sao_chroma_flag: bool,
}

impl Default for SliceParameters {
    fn default() -> Self {
        Self {
            slice_segment_address: 0,
            num_lcus_in_slice: 0,
            slice_type: SliceType::I,
            num_ref_idx_l0_active_minus1: 0,
            num_ref_idx_l1_active_minus1: 0,
            ref_pic_list: [[None; MAX_NUM_REF_IDX_ACTIVE]; 2],
            slice_qp_delta: 0,
            slice_sao_luma_flag: false,
            slice_sao_chroma_flag: false,
        }
    }
}

impl SliceParameters {
    /// Number of active entries of list `list` (0 or 1).
    pub fn num_active(&self, list: usize) -> usize {
        let minus1 = if list == 0 {
            self.num_ref_idx_l0_active_minus1
        } else {
            self.num_ref_idx_l1_active_minus1
        };

        (usize::from(minus1) + 1).min(MAX_NUM_REF_IDX_ACTIVE)
    }

    /// Active entries of list `list`, `None` for invalid ones.
    pub fn active_refs(&self, list: usize) -> &[Option<u8>] {
        &self.ref_pic_list[list][..self.num_active(list)]
    }
}
