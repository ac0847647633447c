// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-picture control plane of the HEVC encoder.
//!
//! [`PictureOrchestrator`] receives the parameter buffers of every picture, validates them,
//! derives the state the hardware needs and reserves the per-frame buffers. The result is a
//! [`PictureState`], handed to a [`CommandBuilder`] to produce the actual hardware commands.

pub mod derive;
pub mod ref_idx;
pub mod ref_list;

use enumn::N;

use crate::backend::CommandBuilder;
use crate::backend::GpuResourceLayer;
use crate::backend::ResourceHandle;
use crate::codec::h265::params::CodingType;
use crate::codec::h265::params::FrameIdx;
use crate::codec::h265::params::PictureParameters;
use crate::codec::h265::params::SequenceParameters;
use crate::codec::h265::params::SliceParameters;
use crate::codec::h265::params::MAX_SLICE_QP;
use crate::encoder::hevc::derive::resolve_rate_control;
use crate::encoder::hevc::derive::validate_slices;
use crate::encoder::hevc::derive::HwCaps;
use crate::encoder::hevc::derive::MAX_LCU_SIZE;
use crate::encoder::hevc::derive::RateControlState;
use crate::encoder::hevc::derive::SequenceDeriver;
use crate::encoder::hevc::derive::SequenceGeometry;
use crate::encoder::hevc::ref_idx::map_reference_indices;
use crate::encoder::hevc::ref_idx::ReferenceMap;
use crate::encoder::hevc::ref_list::RefListEntry;
use crate::encoder::hevc::ref_list::RefListTable;
use crate::encoder::tracked_buffer::FrameAllocRequest;
use crate::encoder::tracked_buffer::TrackedBufferAllocator;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;

/// Hardware passes run for every picture.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CodecFunction {
    /// Mode decision only. The MB code buffer is provided by the client.
    Enc = 1,
    #[default]
    EncPak = 4,
    EncVdencPak = 32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderConfig {
    pub codec_function: CodecFunction,
    pub vdenc_enabled: bool,
    pub hme_supported: bool,
    pub me16x_supported: bool,
    pub me32x_supported: bool,
    /// Number of slices per picture must stay strictly below this.
    pub max_num_slices: usize,
    pub hw: HwCaps,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            codec_function: Default::default(),
            vdenc_enabled: false,
            hme_supported: true,
            me16x_supported: true,
            me32x_supported: false,
            max_num_slices: 256,
            hw: Default::default(),
        }
    }
}

/// Client surfaces of the current picture.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureSurfaces {
    pub recon: Option<ResourceHandle>,
    pub raw: Option<ResourceHandle>,
    pub bitstream: Option<ResourceHandle>,
    /// Only used with [`CodecFunction::Enc`], the other functions use tracked MB code buffers.
    pub mb_code: Option<ResourceHandle>,
}

/// Parameter buffers of one picture.
#[derive(Clone, Debug)]
pub struct PictureInput<'a> {
    /// Set on the first picture of a new sequence.
    pub seq: Option<&'a SequenceParameters>,
    pub pic: &'a PictureParameters,
    pub slices: &'a [SliceParameters],
    pub surfaces: PictureSurfaces,
}

/// State derived for the current picture, as consumed by the command builder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PictureState {
    /// Coding type the hardware is programmed with.
    pub coding_type: CodingType,
    /// Coding type written into the picture header.
    pub header_coding_type: CodingType,
    pub curr_original: FrameIdx,
    pub curr_reconstructed: FrameIdx,
    pub geometry: SequenceGeometry,
    pub ref_map: ReferenceMap,
    /// Copy of the reference list entry of the current picture.
    pub ref_list_entry: RefListEntry,
    pub low_delay: bool,
    pub same_ref_list: bool,
    pub arbitrary_num_mbs_in_slice: bool,
    pub slice_qp: i32,
    pub sao_enabled: bool,
    /// Wait for the previous PAK pass before starting this picture.
    pub wait_for_pak: bool,
    /// Signal the end of the ENC pass to the PAK pass.
    pub signal_enc: bool,
    pub brc_enabled: bool,
    pub lcu_brc_enabled: bool,
    pub brc_init_required: bool,
    pub brc_reset: bool,
    pub hme_enabled: bool,
    pub me16x_enabled: bool,
    pub me32x_enabled: bool,
    pub lcu_max_bitsize_allowed: u32,
    pub screen_content: bool,
    pub resolution_changed: bool,
    pub tracked_buffer_index: usize,
    pub wait_for_tracked_buffer: bool,
    pub mb_code: Option<ResourceHandle>,
    pub mv_temporal: Option<ResourceHandle>,
    pub ds_recon_4x: Option<ResourceHandle>,
    pub ds_recon_8x: Option<ResourceHandle>,
    pub surfaces: PictureSurfaces,
    pub last_pic_in_seq: bool,
    pub last_pic_in_stream: bool,
    pub status_report_feedback_number: u32,
}

/// Largest size in bits a CTU of `log2_ctb_size` may take: its raw 4:2:0 size plus margin.
fn raw_ctu_bits(log2_ctb_size: u32) -> u32 {
    let log2_ctb_size = log2_ctb_size.min(MAX_LCU_SIZE.trailing_zeros());
    let raw = (1u64 << (2 * log2_ctb_size + 3)) + (1u64 << (2 * log2_ctb_size + 2));
    u32::try_from(5 * raw / 3).unwrap_or(u32::MAX)
}

/// Active sequence along with what was derived from it.
#[derive(Clone, Debug)]
struct SequenceState {
    params: SequenceParameters,
    geometry: SequenceGeometry,
    rate_control: RateControlState,
}

pub struct PictureOrchestrator<G: GpuResourceLayer> {
    config: EncoderConfig,
    gpu: G,
    deriver: SequenceDeriver,
    sequence: Option<SequenceState>,
    ref_lists: RefListTable,
    tracked: TrackedBufferAllocator,
    first_frame: bool,
    /// Reconstructed frame of the previous picture.
    prev_recon: Option<FrameIdx>,
    brc_init_pending: bool,
    brc_reset_pending: bool,
    resolution_change_pending: bool,
}

impl<G: GpuResourceLayer> PictureOrchestrator<G> {
    pub fn new(config: EncoderConfig, gpu: G) -> Self {
        let deriver = SequenceDeriver::new(config.hw.clone());

        Self {
            config,
            gpu,
            deriver,
            sequence: None,
            ref_lists: Default::default(),
            tracked: TrackedBufferAllocator::new(),
            first_frame: true,
            prev_recon: None,
            brc_init_pending: true,
            brc_reset_pending: false,
            resolution_change_pending: false,
        }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn gpu(&self) -> &G {
        &self.gpu
    }

    pub fn gpu_mut(&mut self) -> &mut G {
        &mut self.gpu
    }

    pub fn geometry(&self) -> Option<&SequenceGeometry> {
        self.sequence.as_ref().map(|s| &s.geometry)
    }

    pub fn tracked_buffers(&self) -> &TrackedBufferAllocator {
        &self.tracked
    }

    pub fn ref_list(&self, idx: FrameIdx) -> &RefListEntry {
        &self.ref_lists[idx]
    }

    pub fn is_first_frame(&self) -> bool {
        self.first_frame
    }

    /// Signals a change of the frame size decided outside of the sequence parameters. Must be
    /// called between pictures.
    pub fn notify_resize(&mut self) {
        log::debug!("resize notified");
        self.tracked.resize(&mut self.gpu);
    }

    fn set_sequence(&mut self, seq: &SequenceParameters) -> EncodeResult<()> {
        let rate_control = resolve_rate_control(seq)?;
        let geometry = self.deriver.derive(seq)?;

        log::debug!(
            "new sequence: {}x{}, {} LCUs of {}, {:?}",
            geometry.frame_width,
            geometry.frame_height,
            geometry.pic_size_in_lcu,
            geometry.lcu_size,
            seq.rate_control_method
        );

        if geometry.resolution_changed {
            self.notify_resize();
            self.resolution_change_pending = true;
        }
        if geometry.brc_init_required {
            self.brc_init_pending = true;
        }
        self.brc_reset_pending = rate_control.brc_reset;

        self.sequence = Some(SequenceState {
            params: seq.clone(),
            geometry,
            rate_control,
        });

        Ok(())
    }

    /// Validates the parameters of a picture and derives its hardware state.
    ///
    /// On error, nothing is handed to the hardware and the caller may resubmit the picture.
    /// Buffers already allocated for it are kept.
    pub fn setup_picture(&mut self, input: &PictureInput) -> EncodeResult<PictureState> {
        if let Some(seq) = input.seq {
            self.set_sequence(seq)?;
        }

        let sequence = self
            .sequence
            .clone()
            .ok_or(EncodeError::NullPointer("sequence parameters"))?;
        let seq = &sequence.params;
        let geometry = &sequence.geometry;
        let rate_control = sequence.rate_control;
        let pic = input.pic;
        let surfaces = input.surfaces;

        if input.slices.is_empty() {
            return Err(EncodeError::NullPointer("slice parameters"));
        }

        log::trace!(
            "picture {:?} recon {} POC {}",
            pic.coding_type,
            pic.curr_reconstructed_pic.frame_idx.get(),
            pic.curr_pic_order_cnt
        );

        let ref_map = map_reference_indices(pic, input.slices)?;

        if i32::from(pic.qp_y) > MAX_SLICE_QP {
            return Err(EncodeError::invalid(format!("QpY {} exceeds {}", pic.qp_y, MAX_SLICE_QP)));
        }

        let enc_only = self.config.codec_function == CodecFunction::Enc;
        if surfaces.recon.is_none() && !(pic.use_raw_pic_for_ref && enc_only) {
            return Err(EncodeError::invalid("no reconstructed surface"));
        }

        let external_mb_code = if enc_only {
            Some(
                surfaces
                    .mb_code
                    .ok_or(EncodeError::NullPointer("MB code surface"))?,
            )
        } else {
            None
        };

        let brc_enabled = rate_control.brc_enabled;
        let prev_used_as_ref = self
            .prev_recon
            .is_some_and(|prev| self.ref_lists[prev].used_as_ref);
        let wait_for_pak = !(self.first_frame
            || (!brc_enabled
                && (pic.use_raw_pic_for_ref
                    || pic.coding_type == CodingType::I
                    || !prev_used_as_ref)));
        let signal_enc = brc_enabled || pic.used_as_ref;

        let coding_type = ref_map.coding_type();
        let (slices, sao_enabled) = validate_slices(
            seq,
            pic,
            input.slices,
            geometry,
            coding_type,
            self.config.max_num_slices,
        )?;

        // Everything is valid, record the picture.
        let recon = pic.curr_reconstructed_pic.frame_idx;
        let entry = self.ref_lists.claim(recon);
        entry.ref_pic = pic.curr_original_pic;
        entry.recon = surfaces.recon;
        entry.raw = surfaces.raw;
        entry.used_as_ref = pic.used_as_ref;
        entry.poc = pic.curr_pic_order_cnt;
        entry.slice_qp = slices.slice_qp;

        for (pos, ref_pic) in ref_map.unique_refs() {
            let entry = self.ref_lists.get_mut(ref_pic.frame_idx);
            entry.ref_pic.long_term |= ref_pic.long_term;
            entry.poc = pic.ref_frame_poc_list[*pos];
            entry.ref_buffer = if pic.use_raw_pic_for_ref {
                entry.raw
            } else {
                entry.recon
            };
        }

        let refs: Vec<FrameIdx> = ref_map
            .unique_refs()
            .iter()
            .map(|(_, ref_pic)| ref_pic.frame_idx)
            .collect();
        self.ref_lists.set_ref_list(recon, &refs);

        let tracked_buffer_index = self.tracked.allocate_for_curr_frame(
            &mut self.gpu,
            &FrameAllocRequest {
                recon,
                used_as_ref: pic.used_as_ref,
                ref_list: &refs,
                gop_is_idr_only: geometry.gop_is_idr_only,
                wait_for_pak,
                geometry,
                alloc_mb_code: !enc_only,
                alloc_ds_recon: self.config.vdenc_enabled,
            },
        )?;

        let raw_ctu_bits = raw_ctu_bits(geometry.lcu_size.trailing_zeros());
        let lcu_max_bitsize_allowed = match pic.lcu_max_bitsize_allowed {
            0 => raw_ctu_bits,
            bits => bits.min(raw_ctu_bits),
        };

        let inter = coding_type != CodingType::I;
        let slot = self.tracked.current_slot();

        let state = PictureState {
            coding_type,
            header_coding_type: pic.coding_type,
            curr_original: pic.curr_original_pic.frame_idx,
            curr_reconstructed: recon,
            geometry: geometry.clone(),
            ref_list_entry: self.ref_lists[recon].clone(),
            ref_map,
            low_delay: slices.low_delay,
            same_ref_list: slices.same_ref_list,
            arbitrary_num_mbs_in_slice: slices.arbitrary_num_mbs_in_slice,
            slice_qp: slices.slice_qp,
            sao_enabled,
            wait_for_pak,
            signal_enc,
            brc_enabled,
            lcu_brc_enabled: rate_control.lcu_brc_enabled,
            brc_init_required: brc_enabled && self.brc_init_pending,
            brc_reset: self.brc_reset_pending,
            hme_enabled: self.config.hme_supported && inter,
            me16x_enabled: self.config.me16x_supported && inter,
            me32x_enabled: self.config.me32x_supported && inter,
            lcu_max_bitsize_allowed,
            screen_content: pic.screen_content || seq.screen_content,
            resolution_changed: self.resolution_change_pending,
            tracked_buffer_index,
            wait_for_tracked_buffer: self.tracked.wait_for_tracked_buffer(),
            mb_code: external_mb_code.or_else(|| slot.and_then(|s| s.mb_code())),
            mv_temporal: slot.and_then(|s| s.mv_temporal()),
            ds_recon_4x: slot.and_then(|s| s.ds_recon_4x()),
            ds_recon_8x: slot.and_then(|s| s.ds_recon_8x()),
            surfaces,
            last_pic_in_seq: pic.last_pic_in_seq,
            last_pic_in_stream: pic.last_pic_in_stream,
            status_report_feedback_number: pic.status_report_feedback_number,
        };

        self.first_frame = false;
        self.prev_recon = Some(recon);
        if brc_enabled {
            self.brc_init_pending = false;
        }
        self.brc_reset_pending = false;
        self.resolution_change_pending = false;

        Ok(state)
    }

    /// Sets the picture up and hands its state over to `builder`.
    pub fn encode_picture<C: CommandBuilder + ?Sized>(
        &mut self,
        input: &PictureInput,
        builder: &mut C,
    ) -> EncodeResult<PictureState> {
        let state = self.setup_picture(input)?;

        builder
            .build_picture(&state, input.slices)
            .map_err(EncodeError::CommandBuilder)?;

        Ok(state)
    }
}

impl<G: GpuResourceLayer> Drop for PictureOrchestrator<G> {
    fn drop(&mut self) {
        self.tracked.release_all(&mut self.gpu);
    }
}
