// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Derivation of hardware parameters from the sequence, picture and slice parameters, and their
//! cross-field validation.

use crate::backend::align_up;
use crate::backend::CACHELINE_SIZE;
use crate::backend::PAGE_SIZE;
use crate::backend::YTILE_H_ALIGNMENT;
use crate::codec::h265::params::ChromaFormat;
use crate::codec::h265::params::CodingType;
use crate::codec::h265::params::MbBrcMode;
use crate::codec::h265::params::PictureParameters;
use crate::codec::h265::params::RateControlMethod;
use crate::codec::h265::params::SequenceParameters;
use crate::codec::h265::params::SliceParameters;
use crate::codec::h265::params::MAX_ICQ_QUALITY_FACTOR;
use crate::codec::h265::params::MAX_NUM_REF_FRAME;
use crate::codec::h265::params::MAX_SLICE_QP;
use crate::codec::h265::params::MIN_ICQ_QUALITY_FACTOR;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::Resolution;

pub const MACROBLOCK_SIZE: u32 = 16;
pub const MIN_LCU_SIZE: u32 = 16;
pub const MAX_LCU_SIZE: u32 = 64;

/// Largest `log2_min_coding_block_size_minus3`, i.e. 64x64 minimum coding blocks.
const MAX_LOG2_MIN_CB_SIZE_MINUS3: u8 = 3;
/// `log2_max_coding_block_size_minus3` range the hardware handles: 16x16 to 64x64 CTBs.
const LOG2_CTB_SIZE_MINUS3_RANGE: std::ops::RangeInclusive<u8> = 1..=3;

const ENCODE_4K_PIC_WIDTH: u32 = 3840;
const ENCODE_4K_PIC_HEIGHT: u32 = 2160;

/// Size properties of the PAK hardware that influence buffer sizes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HwCaps {
    /// Size of one HCP_PAK_OBJECT command in dwords.
    pub hcp_pak_obj_size_dw: u32,
    /// Size of one CU record written by ENC in bytes.
    pub cu_record_size: u32,
}

impl Default for HwCaps {
    fn default() -> Self {
        Self {
            hcp_pak_obj_size_dw: 5,
            cu_record_size: 64,
        }
    }
}

/// Dimensions of a downscaled copy of the frame, aligned to whole macroblocks.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ScaledDimensions {
    pub width: u32,
    pub height: u32,
    pub width_in_mb: u32,
    pub height_in_mb: u32,
}

impl ScaledDimensions {
    fn new(frame: Resolution, factor: u32) -> Self {
        let width_in_mb = (frame.width / factor).div_ceil(MACROBLOCK_SIZE);
        let height_in_mb = (frame.height / factor).div_ceil(MACROBLOCK_SIZE);

        Self {
            width: width_in_mb * MACROBLOCK_SIZE,
            height: height_in_mb * MACROBLOCK_SIZE,
            width_in_mb,
            height_in_mb,
        }
    }
}

/// Sizes of the per-sequence and per-frame buffers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferSizes {
    /// Offset of the CU records inside the MB code buffer.
    pub mv_offset: u32,
    /// Size of the PAK objects plus CU records of one frame.
    pub mb_code_size: u32,
    /// Size of the separate MV data buffer. Always 0 for HEVC, where MV data lives in the MB code
    /// buffer.
    pub mv_data_size: u32,
    pub mv_temporal_size: u32,
    pub bitstream_upper_bound: u32,
    pub deblocking_row_store: u32,
    pub deblocking_column_row_store: u32,
    pub metadata_line: u32,
    pub metadata_tile_line: u32,
    pub metadata_tile_column: u32,
    /// Dimensions of the 4x downscaled reconstruction surface used by VDEnc. The 8x surface is
    /// half of it in both directions.
    pub ds_recon_4x: Resolution,
}

/// Everything the hardware needs to know about the frame geometry of a sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceGeometry {
    pub frame_width: u32,
    pub frame_height: u32,
    pub pic_width_in_mb: u32,
    pub pic_height_in_mb: u32,
    pub lcu_size: u32,
    pub width_in_lcu: u32,
    pub height_in_lcu: u32,
    pub pic_size_in_lcu: u32,
    pub lcu_to_mb_ratio: u32,
    pub scaled_4x: ScaledDimensions,
    pub scaled_16x: ScaledDimensions,
    pub scaled_32x: ScaledDimensions,
    pub buffers: BufferSizes,
    pub chroma_format: ChromaFormat,
    pub is_10bit: bool,
    pub is_4k_sequence: bool,
    /// The GOP only holds intra pictures, so no picture is ever referenced.
    pub gop_is_idr_only: bool,
    /// The frame size differs from the one of the previous sequence.
    pub resolution_changed: bool,
    /// BRC needs to be initialized again, because the frame size changed.
    pub brc_init_required: bool,
}

impl SequenceGeometry {
    pub fn resolution(&self) -> Resolution {
        Resolution::from((self.frame_width, self.frame_height))
    }
}

/// Checks the coding block sizes of `seq` before anything is derived from them.
fn validate_cb_sizes(seq: &SequenceParameters) -> EncodeResult<()> {
    let log2_min = seq.log2_min_coding_block_size_minus3;
    let log2_max = seq.log2_max_coding_block_size_minus3;

    if log2_min > MAX_LOG2_MIN_CB_SIZE_MINUS3 {
        return Err(EncodeError::invalid(format!(
            "invalid log2_min_coding_block_size_minus3 {}",
            log2_min
        )));
    }

    if !LOG2_CTB_SIZE_MINUS3_RANGE.contains(&log2_max) {
        return Err(EncodeError::invalid(format!(
            "unsupported log2_max_coding_block_size_minus3 {}",
            log2_max
        )));
    }

    if log2_min > log2_max {
        return Err(EncodeError::invalid(format!(
            "minimum coding block ({}) larger than the CTB ({})",
            8 << log2_min,
            8 << log2_max
        )));
    }

    Ok(())
}

/// Frame size derived from the syntax: `(min_cb_count_minus1 + 1) << log2_min_cb_size`.
pub fn frame_size(seq: &SequenceParameters) -> EncodeResult<Resolution> {
    validate_cb_sizes(seq)?;
    let log2_min_cb = u32::from(seq.log2_min_coding_block_size_minus3) + 3;

    Ok(Resolution {
        width: (u32::from(seq.frame_width_in_min_cb_minus1) + 1) << log2_min_cb,
        height: (u32::from(seq.frame_height_in_min_cb_minus1) + 1) << log2_min_cb,
    })
}

fn buffer_sizes(
    frame: Resolution,
    chroma_format: ChromaFormat,
    is_10bit: bool,
    hw: &HwCaps,
) -> BufferSizes {
    let (width, height) = (frame.width, frame.height);

    // Smallest LCU gives the largest number of LCUs.
    let width_in_min_lcu = width.div_ceil(MIN_LCU_SIZE);
    let height_in_min_lcu = height.div_ceil(MIN_LCU_SIZE);
    let max_num_lcus = width_in_min_lcu * height_in_min_lcu;
    let mv_offset = align_up(max_num_lcus * hw.hcp_pak_obj_size_dw * 4, PAGE_SIZE);

    // Largest LCU gives the largest number of CU records.
    let max_num_cu_records = width.div_ceil(MAX_LCU_SIZE) * height.div_ceil(MAX_LCU_SIZE) * 64;
    let mb_code_size = mv_offset + align_up(max_num_cu_records * hw.cu_record_size, PAGE_SIZE);

    let mvt_size = align_up(width.div_ceil(64) * height.div_ceil(16), 2) * CACHELINE_SIZE;
    let mvtb_size = align_up(width.div_ceil(32) * height.div_ceil(32), 2) * CACHELINE_SIZE;
    let mv_temporal_size = mvt_size.max(mvtb_size);

    let mut bs_width = align_up(width, MAX_LCU_SIZE);
    let bs_height = align_up(height, MAX_LCU_SIZE) * 3 / if is_10bit { 1 } else { 2 };
    match chroma_format {
        ChromaFormat::Yuv422 => bs_width = bs_width * 8 / 6,
        ChromaFormat::Yuv444 => bs_width = bs_width * 12 / 6,
        _ => (),
    }

    let planes = if chroma_format == ChromaFormat::Yuv444 { 3 } else { 2 };
    let format_mult = if is_10bit { planes * 2 } else { planes };
    let row_store = |len: u32| align_up((len * format_mult).div_ceil(2), 4) * CACHELINE_SIZE;
    let deblocking_row_store = row_store(align_up(width, 32) >> 3);
    let deblocking_column_row_store = row_store(align_up(height + height_in_min_lcu * 6, 32) >> 3);

    let metadata = |len: u32, len_in_min_lcu: u32, inter_factor: u32| {
        let intra = align_up((len + len_in_min_lcu * 8 + 1023) >> 9, 2) * CACHELINE_SIZE;
        let inter = align_up(
            (len.div_ceil(16) * inter_factor + len_in_min_lcu * 9 + 1023) >> 9,
            2,
        ) * CACHELINE_SIZE;
        intra.max(inter)
    };

    let scaled_4x = ScaledDimensions::new(frame, 4);
    // Field based: each field is Y-tile aligned on its own.
    let ds_field_height_4x = ((scaled_4x.height_in_mb + 1) >> 1) * MACROBLOCK_SIZE;
    let ds_height_4x = align_up(ds_field_height_4x, YTILE_H_ALIGNMENT) << 1;

    BufferSizes {
        mv_offset,
        mb_code_size,
        mv_data_size: 0,
        mv_temporal_size,
        bitstream_upper_bound: bs_width * bs_height,
        deblocking_row_store,
        deblocking_column_row_store,
        metadata_line: metadata(width, width_in_min_lcu, 188),
        metadata_tile_line: metadata(width, width_in_min_lcu, 172),
        metadata_tile_column: metadata(height, height_in_min_lcu, 172),
        ds_recon_4x: Resolution {
            width: scaled_4x.width_in_mb * MACROBLOCK_SIZE,
            height: ds_height_4x,
        },
    }
}

/// Sequence level derivation. Remembers the frame size of the previous sequence in order to
/// detect resolution changes.
#[derive(Debug, Default)]
pub struct SequenceDeriver {
    origin: Option<Resolution>,
    hw: HwCaps,
}

impl SequenceDeriver {
    pub fn new(hw: HwCaps) -> Self {
        Self { origin: None, hw }
    }

    /// Frame size of the last successfully derived sequence.
    pub fn origin(&self) -> Option<Resolution> {
        self.origin
    }

    pub fn derive(&mut self, seq: &SequenceParameters) -> EncodeResult<SequenceGeometry> {
        let frame = frame_size(seq)?;

        let lcu_size = 1u32 << (u32::from(seq.log2_max_coding_block_size_minus3) + 3);
        let width_in_lcu = align_up(frame.width, lcu_size) / lcu_size;
        let height_in_lcu = align_up(frame.height, lcu_size) / lcu_size;
        let lcu_to_mb_ratio = lcu_size / MACROBLOCK_SIZE;
        if width_in_lcu < 1 || lcu_to_mb_ratio < 1 {
            return Err(EncodeError::invalid(format!(
                "invalid LCU geometry: {} LCUs per row, LCU to MB ratio {}",
                width_in_lcu, lcu_to_mb_ratio
            )));
        }

        let resolution_changed = matches!(self.origin, Some(origin) if origin != frame);
        if resolution_changed {
            log::debug!(
                "resolution change {:?} -> {}x{}",
                self.origin,
                frame.width,
                frame.height
            );
        }
        self.origin = Some(frame);

        let is_10bit = seq.bit_depth_luma_minus8 > 0;

        Ok(SequenceGeometry {
            frame_width: frame.width,
            frame_height: frame.height,
            pic_width_in_mb: frame.width.div_ceil(MACROBLOCK_SIZE),
            pic_height_in_mb: frame.height.div_ceil(MACROBLOCK_SIZE),
            lcu_size,
            width_in_lcu,
            height_in_lcu,
            pic_size_in_lcu: width_in_lcu * height_in_lcu,
            lcu_to_mb_ratio,
            scaled_4x: ScaledDimensions::new(frame, 4),
            scaled_16x: ScaledDimensions::new(frame, 16),
            scaled_32x: ScaledDimensions::new(frame, 32),
            buffers: buffer_sizes(frame, seq.chroma_format_idc, is_10bit, &self.hw),
            chroma_format: seq.chroma_format_idc,
            is_10bit,
            is_4k_sequence: frame.get_area()
                >= (ENCODE_4K_PIC_WIDTH * ENCODE_4K_PIC_HEIGHT) as usize,
            gop_is_idr_only: seq.gop_pic_size == 1,
            resolution_changed,
            brc_init_required: resolution_changed,
        })
    }
}

/// Bit-rate control mode resolved from the sequence parameters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RateControlState {
    pub brc_enabled: bool,
    pub lcu_brc_enabled: bool,
    pub brc_reset: bool,
}

pub fn resolve_rate_control(seq: &SequenceParameters) -> EncodeResult<RateControlState> {
    let method = seq.rate_control_method;
    let brc_enabled = method.is_brc();

    let mut lcu_brc_enabled = false;
    if brc_enabled {
        lcu_brc_enabled = match seq.mb_brc {
            MbBrcMode::Internal => seq.target_usage == 1,
            MbBrcMode::Disabled => false,
            MbBrcMode::Enabled => true,
        };

        if method.is_quality_based() {
            lcu_brc_enabled = true;
        }
    }

    // VCM only supports frame level BRC.
    if method == RateControlMethod::Vcm {
        lcu_brc_enabled = false;
    }

    if method.is_quality_based()
        && !(MIN_ICQ_QUALITY_FACTOR..=MAX_ICQ_QUALITY_FACTOR).contains(&seq.icq_quality_factor)
    {
        return Err(EncodeError::invalid(format!(
            "invalid ICQ quality factor {}",
            seq.icq_quality_factor
        )));
    }

    let mut brc_reset = seq.reset_brc;
    if brc_reset
        && (!brc_enabled || matches!(method, RateControlMethod::Cbr | RateControlMethod::Icq))
    {
        log::warn!("BRC reset cannot be triggered in {:?} mode, ignoring", method);
        brc_reset = false;
    }

    Ok(RateControlState {
        brc_enabled,
        lcu_brc_enabled,
        brc_reset,
    })
}

/// POC distance between the current picture and the reference at `ref_pos` of the reference
/// frame list, as programmed into the hardware.
pub fn temporal_difference(pic: &PictureParameters, ref_pos: Option<u8>) -> i8 {
    let Some(pos) = ref_pos.map(usize::from).filter(|p| *p < MAX_NUM_REF_FRAME) else {
        return 0;
    };

    let diff = i64::from(pic.curr_pic_order_cnt) - i64::from(pic.ref_frame_poc_list[pos]);
    diff.clamp(-128, 127) as i8
}

/// Result of the slice level validation of a picture.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceState {
    /// No reference of any B slice follows the current picture in output order.
    pub low_delay: bool,
    /// L0 and L1 of every slice are identical up to the length of the shorter list. Entries are
    /// compared by the frame they name, not by their reference frame list position.
    pub same_ref_list: bool,
    /// At least one slice does not cover whole LCU rows.
    pub arbitrary_num_mbs_in_slice: bool,
    /// QP of the first slice.
    pub slice_qp: i32,
}

/// Validates the slices of a picture one at a time, accumulating the picture level flags.
pub struct SliceValidator<'a> {
    pic: &'a PictureParameters,
    geometry: &'a SequenceGeometry,
    state: SliceState,
    next_lcu: u32,
    num_slices: u32,
}

impl<'a> SliceValidator<'a> {
    pub fn new(pic: &'a PictureParameters, geometry: &'a SequenceGeometry) -> Self {
        Self {
            pic,
            geometry,
            state: SliceState {
                low_delay: true,
                same_ref_list: true,
                arbitrary_num_mbs_in_slice: false,
                slice_qp: 0,
            },
            next_lcu: 0,
            num_slices: 0,
        }
    }

    pub fn validate(&mut self, slice: &SliceParameters) -> EncodeResult<()> {
        if self.num_slices == 0 && slice.slice_segment_address != 0 {
            return Err(EncodeError::invalid(
                "first slice segment address is not 0",
            ));
        }

        self.validate_ref_frame_data(slice)?;

        let qp = i32::from(self.pic.qp_y) + i32::from(slice.slice_qp_delta);
        if qp > MAX_SLICE_QP {
            return Err(EncodeError::invalid(format!(
                "slice {} QP {} exceeds {}",
                self.num_slices, qp, MAX_SLICE_QP
            )));
        }
        if self.num_slices == 0 {
            self.state.slice_qp = qp;
        }

        self.check_low_delay(slice);
        self.check_same_ref_list(slice);

        if slice.num_lcus_in_slice % self.geometry.width_in_lcu != 0 {
            self.state.arbitrary_num_mbs_in_slice = true;
        }

        if !self.pic.tiles_enabled_flag {
            if slice.slice_segment_address != self.next_lcu {
                return Err(EncodeError::invalid(format!(
                    "slice {} starts at LCU {}, expected {}",
                    self.num_slices, slice.slice_segment_address, self.next_lcu
                )));
            }
            self.next_lcu = self
                .next_lcu
                .checked_add(slice.num_lcus_in_slice)
                .ok_or_else(|| {
                    EncodeError::invalid(format!(
                        "slice {} LCU count {} overflows",
                        self.num_slices, slice.num_lcus_in_slice
                    ))
                })?;
        }

        self.num_slices += 1;

        Ok(())
    }

    /// Finishes the validation once all slices have been seen.
    pub fn finish(self) -> EncodeResult<SliceState> {
        if !self.pic.tiles_enabled_flag && self.next_lcu != self.geometry.pic_size_in_lcu {
            return Err(EncodeError::invalid(format!(
                "slices cover {} LCUs, picture has {}",
                self.next_lcu, self.geometry.pic_size_in_lcu
            )));
        }

        Ok(self.state)
    }

    fn validate_ref_frame_data(&self, slice: &SliceParameters) -> EncodeResult<()> {
        if slice.slice_type.is_i() {
            return Ok(());
        }

        for list in 0..2 {
            for pos in slice.active_refs(list).iter().flatten() {
                if usize::from(*pos) >= MAX_NUM_REF_FRAME {
                    return Err(EncodeError::invalid(format!(
                        "slice {} L{} references list position {}",
                        self.num_slices, list, pos
                    )));
                }
            }
        }

        Ok(())
    }

    fn check_low_delay(&mut self, slice: &SliceParameters) {
        if !slice.slice_type.is_b() || !self.state.low_delay {
            return;
        }

        let curr_poc = self.pic.curr_pic_order_cnt;
        let is_future = |pos: &u8| {
            self.pic
                .ref_frame_poc_list
                .get(usize::from(*pos))
                .is_some_and(|poc| *poc > curr_poc)
        };

        if (0..2).any(|list| slice.active_refs(list).iter().flatten().any(is_future)) {
            self.state.low_delay = false;
        }
    }

    fn check_same_ref_list(&mut self, slice: &SliceParameters) {
        if !self.state.same_ref_list {
            return;
        }

        let differs = slice
            .active_refs(0)
            .iter()
            .zip(slice.active_refs(1))
            .any(|(l0, l1)| match (l0, l1) {
                (Some(l0), Some(l1)) => {
                    let frame = |pos: &u8| {
                        self.pic
                            .ref_frame_list
                            .get(usize::from(*pos))
                            .copied()
                            .flatten()
                            .map(|p| p.frame_idx)
                    };
                    frame(l0) != frame(l1)
                }
                _ => false,
            });

        if differs {
            self.state.same_ref_list = false;
        }
    }
}

/// Returns whether SAO stays enabled for the picture. All slices must agree on the SAO flags,
/// otherwise SAO is turned off for the whole picture.
pub fn verify_sao_consistency(sao_enabled: bool, slices: &[SliceParameters]) -> bool {
    if !sao_enabled {
        return false;
    }

    let num_slices = slices.len();
    let luma = slices.iter().filter(|s| s.slice_sao_luma_flag).count();
    let chroma = slices.iter().filter(|s| s.slice_sao_chroma_flag).count();

    if (luma > 0 && luma != num_slices) || (chroma > 0 && chroma != num_slices) {
        log::warn!(
            "slices disagree on SAO (luma {}/{}, chroma {}/{}), disabling SAO",
            luma,
            num_slices,
            chroma,
            num_slices
        );
        return false;
    }

    true
}

/// Runs the slice level validation over all slices of a picture.
pub fn validate_slices(
    seq: &SequenceParameters,
    pic: &PictureParameters,
    slices: &[SliceParameters],
    geometry: &SequenceGeometry,
    coding_type: CodingType,
    max_num_slices: usize,
) -> EncodeResult<(SliceState, bool)> {
    if slices.is_empty() {
        return Err(EncodeError::NullPointer("slice parameters"));
    }

    if slices.len() >= max_num_slices {
        return Err(EncodeError::invalid(format!(
            "{} slices exceed the limit of {}",
            slices.len(),
            max_num_slices
        )));
    }

    if pic.num_slices as usize != slices.len() {
        return Err(EncodeError::invalid(format!(
            "picture declares {} slices, {} provided",
            pic.num_slices,
            slices.len()
        )));
    }

    let mut validator = SliceValidator::new(pic, geometry);
    for slice in slices {
        validator.validate(slice)?;
    }
    let state = validator.finish()?;

    if seq.rate_control_method == RateControlMethod::Vcm
        && coding_type == CodingType::B
        && !state.low_delay
    {
        return Err(EncodeError::invalid(
            "VCM BRC mode does not support regular B pictures",
        ));
    }

    let sao_enabled = verify_sao_consistency(seq.sao_enabled_flag, slices);

    Ok((state, sao_enabled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h265::params::CodecPicture;
    use crate::codec::h265::params::FrameIdx;
    use crate::codec::h265::params::SliceType;

    fn seq_1080p() -> SequenceParameters {
        SequenceParameters::with_frame_size(1920, 1080, 3)
    }

    fn pic_with_refs(refs: &[(u8, i32)], curr_poc: i32) -> PictureParameters {
        let mut pic = PictureParameters {
            curr_pic_order_cnt: curr_poc,
            coding_type: CodingType::B,
            ..Default::default()
        };
        for (i, (frame, poc)) in refs.iter().enumerate() {
            pic.ref_frame_list[i] = Some(CodecPicture::new(FrameIdx::new(*frame).unwrap()));
            pic.ref_frame_poc_list[i] = *poc;
        }
        pic
    }

    fn b_slice(address: u32, lcus: u32, l0: &[u8], l1: &[u8]) -> SliceParameters {
        let mut slice = SliceParameters {
            slice_segment_address: address,
            num_lcus_in_slice: lcus,
            slice_type: SliceType::B,
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
    fn geometry_1080p() {
        let mut deriver = SequenceDeriver::default();
        let geometry = deriver.derive(&seq_1080p()).unwrap();

        assert_eq!(geometry.frame_width, 1920);
        assert_eq!(geometry.frame_height, 1080);
        assert_eq!(geometry.pic_width_in_mb, 120);
        assert_eq!(geometry.pic_height_in_mb, 68);
        assert_eq!(geometry.lcu_size, 64);
        assert_eq!(geometry.width_in_lcu, 30);
        assert_eq!(geometry.height_in_lcu, 17);
        assert_eq!(geometry.pic_size_in_lcu, 510);
        assert_eq!(geometry.lcu_to_mb_ratio, 4);
        assert_eq!(geometry.scaled_4x.width, 480);
        assert_eq!(geometry.scaled_4x.height_in_mb, 17);
        assert_eq!(geometry.scaled_16x.width_in_mb, 8);
        assert_eq!(geometry.scaled_32x.width_in_mb, 4);
        assert!(!geometry.is_4k_sequence);
        assert!(!geometry.resolution_changed);

        // 120x68 LCUs of 16 pixels, 20 bytes each, page aligned.
        assert_eq!(geometry.buffers.mv_offset, align_up(120 * 68 * 20, PAGE_SIZE));
        assert_eq!(
            geometry.buffers.mb_code_size,
            geometry.buffers.mv_offset + align_up(30 * 17 * 64 * 64, PAGE_SIZE)
        );
        assert_eq!(geometry.buffers.bitstream_upper_bound, 1920 * (1088 * 3 / 2));
        assert_eq!(
            geometry.buffers.ds_recon_4x,
            Resolution {
                width: 480,
                height: 320
            }
        );
    }

    #[test]
    fn geometry_is_deterministic() {
        let seq = seq_1080p();
        let first = SequenceDeriver::default().derive(&seq).unwrap();
        let second = SequenceDeriver::default().derive(&seq).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn resolution_change_is_reported_once() {
        let mut deriver = SequenceDeriver::default();
        let small = SequenceParameters::with_frame_size(640, 480, 3);
        let large = seq_1080p();

        assert!(!deriver.derive(&small).unwrap().resolution_changed);
        assert!(!deriver.derive(&small).unwrap().resolution_changed);

        let changed = deriver.derive(&large).unwrap();
        assert!(changed.resolution_changed);
        assert!(changed.brc_init_required);

        assert!(!deriver.derive(&large).unwrap().resolution_changed);

        // Only the height changes.
        let taller = SequenceParameters::with_frame_size(1920, 1088, 3);
        assert!(deriver.derive(&taller).unwrap().resolution_changed);
        assert_eq!(deriver.origin().unwrap().height, 1088);
    }

    #[test]
    fn geometry_rejects_small_lcu() {
        let mut seq = seq_1080p();
        // 8x8 LCUs are smaller than a macroblock.
        seq.log2_max_coding_block_size_minus3 = 0;

        let mut deriver = SequenceDeriver::default();
        assert!(matches!(
            deriver.derive(&seq),
            Err(EncodeError::InvalidParameter(_))
        ));
        assert_eq!(deriver.origin(), None);
    }

    #[test]
    fn geometry_rejects_out_of_range_cb_sizes() {
        let mut deriver = SequenceDeriver::default();

        for (log2_min, log2_max) in [(40, 3), (4, 3), (0, 29), (0, 4), (2, 1)] {
            let mut seq = seq_1080p();
            seq.log2_min_coding_block_size_minus3 = log2_min;
            seq.log2_max_coding_block_size_minus3 = log2_max;

            assert!(matches!(
                deriver.derive(&seq),
                Err(EncodeError::InvalidParameter(_))
            ));
            assert!(matches!(
                frame_size(&seq),
                Err(EncodeError::InvalidParameter(_))
            ));
        }
        assert_eq!(deriver.origin(), None);

        // 64x64 minimum coding blocks in 64x64 CTBs: 30x17 of them.
        let mut seq = seq_1080p();
        seq.log2_min_coding_block_size_minus3 = 3;
        seq.frame_width_in_min_cb_minus1 = 29;
        seq.frame_height_in_min_cb_minus1 = 16;
        let geometry = deriver.derive(&seq).unwrap();
        assert_eq!(geometry.frame_width, 1920);
        assert_eq!(geometry.frame_height, 1088);
    }

    #[test]
    fn bitstream_bound_depends_on_format() {
        let mut seq = seq_1080p();
        seq.chroma_format_idc = ChromaFormat::Yuv444;
        seq.bit_depth_luma_minus8 = 2;
        let geometry = SequenceDeriver::default().derive(&seq).unwrap();

        assert!(geometry.is_10bit);
        assert_eq!(geometry.buffers.bitstream_upper_bound, 3840 * 1088 * 3);
    }

    #[test]
    fn icq_forces_lcu_brc() {
        let mut seq = seq_1080p();
        seq.rate_control_method = RateControlMethod::Icq;
        seq.icq_quality_factor = 30;

        for mb_brc in [MbBrcMode::Internal, MbBrcMode::Enabled, MbBrcMode::Disabled] {
            seq.mb_brc = mb_brc;
            let rc = resolve_rate_control(&seq).unwrap();
            assert!(rc.brc_enabled);
            assert!(rc.lcu_brc_enabled);
        }
    }

    #[test]
    fn icq_quality_factor_out_of_range() {
        let mut seq = seq_1080p();
        seq.rate_control_method = RateControlMethod::Icq;
        seq.icq_quality_factor = 255;
        assert!(matches!(
            resolve_rate_control(&seq),
            Err(EncodeError::InvalidParameter(_))
        ));

        seq.icq_quality_factor = 0;
        assert!(resolve_rate_control(&seq).is_err());

        seq.rate_control_method = RateControlMethod::Qvbr;
        seq.icq_quality_factor = 51;
        assert!(resolve_rate_control(&seq).is_ok());
    }

    #[test]
    fn vcm_disables_lcu_brc() {
        let mut seq = seq_1080p();
        seq.rate_control_method = RateControlMethod::Vcm;
        seq.mb_brc = MbBrcMode::Enabled;

        let rc = resolve_rate_control(&seq).unwrap();
        assert!(rc.brc_enabled);
        assert!(!rc.lcu_brc_enabled);
    }

    #[test]
    fn internal_mb_brc_follows_target_usage() {
        let mut seq = seq_1080p();
        seq.rate_control_method = RateControlMethod::Vbr;
        seq.mb_brc = MbBrcMode::Internal;

        seq.target_usage = 1;
        assert!(resolve_rate_control(&seq).unwrap().lcu_brc_enabled);
        seq.target_usage = 4;
        assert!(!resolve_rate_control(&seq).unwrap().lcu_brc_enabled);

        seq.rate_control_method = RateControlMethod::Cqp;
        seq.mb_brc = MbBrcMode::Enabled;
        let rc = resolve_rate_control(&seq).unwrap();
        assert!(!rc.brc_enabled);
        assert!(!rc.lcu_brc_enabled);
    }

    #[test]
    fn brc_reset_dropped_for_cbr() {
        let _ = env_logger::try_init();

        let mut seq = seq_1080p();
        seq.reset_brc = true;
        seq.rate_control_method = RateControlMethod::Cbr;
        assert!(!resolve_rate_control(&seq).unwrap().brc_reset);

        seq.rate_control_method = RateControlMethod::Vbr;
        assert!(resolve_rate_control(&seq).unwrap().brc_reset);
    }

    #[test]
    fn temporal_difference_is_clamped() {
        let pic = pic_with_refs(&[(1, 0), (2, 300), (3, -300)], 10);
        assert_eq!(temporal_difference(&pic, Some(0)), 10);
        assert_eq!(temporal_difference(&pic, Some(1)), -128);
        assert_eq!(temporal_difference(&pic, Some(2)), 127);
        assert_eq!(temporal_difference(&pic, None), 0);

        let pic = pic_with_refs(&[(1, i32::MAX), (2, i32::MIN)], i32::MIN);
        assert_eq!(temporal_difference(&pic, Some(0)), -128);
        assert_eq!(temporal_difference(&pic, Some(1)), 0);
        let pic = pic_with_refs(&[(1, i32::MIN)], i32::MAX);
        assert_eq!(temporal_difference(&pic, Some(0)), 127);
    }

    #[test]
    fn low_delay_and_same_ref_list() {
        let geometry = SequenceDeriver::default().derive(&seq_1080p()).unwrap();

        // Both references precede the current picture.
        let pic = pic_with_refs(&[(1, 4), (2, 6)], 8);
        let mut validator = SliceValidator::new(&pic, &geometry);
        validator.validate(&b_slice(0, 510, &[0, 1], &[0])).unwrap();
        let state = validator.finish().unwrap();
        assert!(state.low_delay);
        assert!(state.same_ref_list);
        assert!(!state.arbitrary_num_mbs_in_slice);
        assert_eq!(state.slice_qp, 26);

        // The second slice has a future reference in L1 and a different L1.
        let pic = pic_with_refs(&[(1, 4), (2, 12)], 8);
        let mut validator = SliceValidator::new(&pic, &geometry);
        validator.validate(&b_slice(0, 255, &[0], &[0])).unwrap();
        validator.validate(&b_slice(255, 255, &[0], &[1])).unwrap();
        let state = validator.finish().unwrap();
        assert!(!state.low_delay);
        assert!(!state.same_ref_list);
        // 255 is not a multiple of 30 LCUs per row.
        assert!(state.arbitrary_num_mbs_in_slice);
    }

    #[test]
    fn low_delay_is_not_reset_by_later_slices() {
        let geometry = SequenceDeriver::default().derive(&seq_1080p()).unwrap();
        let pic = pic_with_refs(&[(1, 4), (2, 12)], 8);

        let mut validator = SliceValidator::new(&pic, &geometry);
        validator.validate(&b_slice(0, 240, &[1], &[1])).unwrap();
        validator.validate(&b_slice(240, 270, &[0], &[0])).unwrap();
        let state = validator.finish().unwrap();
        assert!(!state.low_delay);
        assert!(state.same_ref_list);
    }

    #[test]
    fn same_ref_list_compares_frames() {
        let geometry = SequenceDeriver::default().derive(&seq_1080p()).unwrap();
        // Positions 0 and 1 both hold frame 7.
        let pic = pic_with_refs(&[(7, 4), (7, 4)], 8);

        let mut validator = SliceValidator::new(&pic, &geometry);
        validator.validate(&b_slice(0, 510, &[0, 1], &[1])).unwrap();
        assert!(validator.finish().unwrap().same_ref_list);
    }

    #[test]
    fn slice_addressing() {
        let geometry = SequenceDeriver::default().derive(&seq_1080p()).unwrap();
        let pic = pic_with_refs(&[(1, 4)], 8);

        let mut validator = SliceValidator::new(&pic, &geometry);
        assert!(validator.validate(&b_slice(30, 510, &[0], &[0])).is_err());

        let mut validator = SliceValidator::new(&pic, &geometry);
        validator.validate(&b_slice(0, 30, &[0], &[0])).unwrap();
        assert!(validator.validate(&b_slice(60, 480, &[0], &[0])).is_err());

        let mut validator = SliceValidator::new(&pic, &geometry);
        validator.validate(&b_slice(0, 30, &[0], &[0])).unwrap();
        assert!(matches!(
            validator.finish(),
            Err(EncodeError::InvalidParameter(_))
        ));
    }

    #[test]
    fn slice_lcu_count_overflow_is_invalid() {
        let geometry = SequenceDeriver::default().derive(&seq_1080p()).unwrap();
        let pic = pic_with_refs(&[(1, 4)], 8);

        let mut validator = SliceValidator::new(&pic, &geometry);
        validator
            .validate(&b_slice(0, u32::MAX, &[0], &[0]))
            .unwrap();
        assert!(matches!(
            validator.validate(&b_slice(u32::MAX, u32::MAX, &[0], &[0])),
            Err(EncodeError::InvalidParameter(_))
        ));

        let seq = seq_1080p();
        let mut slices = vec![
            b_slice(0, u32::MAX, &[0], &[0]),
            b_slice(u32::MAX, 1, &[0], &[0]),
        ];
        let mut pic = pic;
        pic.num_slices = 2;
        assert!(matches!(
            validate_slices(&seq, &pic, &slices, &geometry, CodingType::B, 256),
            Err(EncodeError::InvalidParameter(_))
        ));

        // Tiled pictures do not accumulate addresses.
        pic.tiles_enabled_flag = true;
        slices[1].slice_segment_address = 0;
        assert!(validate_slices(&seq, &pic, &slices, &geometry, CodingType::B, 256).is_ok());
    }

    #[test]
    fn slice_qp_limit() {
        let geometry = SequenceDeriver::default().derive(&seq_1080p()).unwrap();
        let mut pic = pic_with_refs(&[(1, 4)], 8);
        pic.qp_y = 50;

        let mut slice = b_slice(0, 510, &[0], &[0]);
        slice.slice_qp_delta = 1;
        let mut validator = SliceValidator::new(&pic, &geometry);
        validator.validate(&slice).unwrap();
        assert_eq!(validator.finish().unwrap().slice_qp, 51);

        slice.slice_qp_delta = 2;
        let mut validator = SliceValidator::new(&pic, &geometry);
        assert!(validator.validate(&slice).is_err());
    }

    #[test]
    fn ref_position_out_of_range() {
        let geometry = SequenceDeriver::default().derive(&seq_1080p()).unwrap();
        let pic = pic_with_refs(&[(1, 4)], 8);

        let mut validator = SliceValidator::new(&pic, &geometry);
        assert!(validator.validate(&b_slice(0, 510, &[16], &[0])).is_err());
    }

    #[test]
    fn sao_consistency() {
        let _ = env_logger::try_init();

        let mut slices = vec![SliceParameters::default(); 3];
        for slice in slices.iter_mut() {
            slice.slice_sao_luma_flag = true;
        }
        assert!(verify_sao_consistency(true, &slices));
        assert!(!verify_sao_consistency(false, &slices));

        slices[1].slice_sao_luma_flag = false;
        assert!(!verify_sao_consistency(true, &slices));

        for slice in slices.iter_mut() {
            slice.slice_sao_luma_flag = false;
        }
        assert!(verify_sao_consistency(true, &slices));

        slices[2].slice_sao_chroma_flag = true;
        assert!(!verify_sao_consistency(true, &slices));
    }

    #[test]
    fn vcm_rejects_regular_b() {
        let mut seq = seq_1080p();
        seq.rate_control_method = RateControlMethod::Vcm;
        let geometry = SequenceDeriver::default().derive(&seq).unwrap();
        let pic = pic_with_refs(&[(1, 4), (2, 12)], 8);
        let slices = [b_slice(0, 510, &[0], &[1])];

        assert!(validate_slices(&seq, &pic, &slices, &geometry, CodingType::B, 256).is_err());
        assert!(validate_slices(&seq, &pic, &slices, &geometry, CodingType::P, 256).is_ok());
    }

    #[test]
    fn slice_count_checks() {
        let seq = seq_1080p();
        let geometry = SequenceDeriver::default().derive(&seq).unwrap();
        let mut pic = pic_with_refs(&[(1, 4)], 8);
        let slices = [b_slice(0, 240, &[0], &[0]), b_slice(240, 270, &[0], &[0])];

        // Declared count differs.
        assert!(validate_slices(&seq, &pic, &slices, &geometry, CodingType::B, 256).is_err());

        pic.num_slices = 2;
        assert!(validate_slices(&seq, &pic, &slices, &geometry, CodingType::B, 256).is_ok());
        assert!(validate_slices(&seq, &pic, &slices, &geometry, CodingType::B, 2).is_err());
        assert!(matches!(
            validate_slices(&seq, &pic, &[], &geometry, CodingType::B, 256),
            Err(EncodeError::NullPointer(_))
        ));
    }
}
