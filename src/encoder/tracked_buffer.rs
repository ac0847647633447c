// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pool of per-frame GPU buffers whose lifetime follows the hardware.
//!
//! Every picture gets one slot of the pool. The slot owns the buffers the hardware writes for that
//! picture (MB code, MV temporal data, downscaled reconstructions) and that later pictures may
//! read again. Slots of pictures used as reference are taken from the reference region and stay
//! reserved as long as a picture references them. Non-reference pictures rotate through a small
//! ring.
//!
//! The hardware runs asynchronously and is never waited upon here. Instead, the pool relies on at
//! most [`MAX_PIPELINE_DEPTH`] pictures being in flight: on a resolution change, the slots of the
//! last [`MAX_PIPELINE_DEPTH`] pictures are kept alive and released one per picture afterwards.

use crate::backend::allocate_zeroed_buffer;
use crate::backend::AllocDescriptor;
use crate::backend::GpuResourceLayer;
use crate::backend::ResourceHandle;
use crate::backend::SurfaceFormat;
use crate::backend::TileType;
use crate::backend::CACHELINE_SIZE;
use crate::codec::h265::params::FrameIdx;
use crate::codec::h265::params::MAX_NUM_REF_FRAME;
use crate::encoder::hevc::derive::SequenceGeometry;
use crate::encoder::map_alloc_err;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::Resolution;

/// Size of the reference region of the pool.
pub const NUM_REF_BUFFERS: usize = MAX_NUM_REF_FRAME + 1;
/// Size of the non-reference ring of the pool.
pub const NUM_NON_REF_BUFFERS: usize = 3;
pub const NUM_TRACKED_BUFFERS: usize = NUM_REF_BUFFERS + NUM_NON_REF_BUFFERS;

/// Maximum number of pictures the hardware may be processing at the same time, including the one
/// being set up. Buffers of older pictures can be reused or freed without waiting.
pub const MAX_PIPELINE_DEPTH: usize = 3;

/// Hardware prefetches up to 8 cachelines past the end of a batch buffer.
const MB_CODE_PREFETCH_PADDING: u32 = 8 * CACHELINE_SIZE;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SlotTag {
    #[default]
    Free,
    /// Allocated for the previous resolution and possibly still in use by the hardware.
    ResizePending,
    /// Owned by the picture reconstructed into this frame-store index.
    Frame(FrameIdx),
}

/// A GPU resource along with the frame size it was sized for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct TrackedResource {
    handle: ResourceHandle,
    geometry: Resolution,
}

#[derive(Debug, Default)]
pub struct TrackedBufferSlot {
    tag: SlotTag,
    mb_code: Option<TrackedResource>,
    mv_data: Option<TrackedResource>,
    mv_temporal: Option<TrackedResource>,
    ds_recon_4x: Option<TrackedResource>,
    ds_recon_8x: Option<TrackedResource>,
    used_for_curr_frame: bool,
}

impl TrackedBufferSlot {
    pub fn tag(&self) -> SlotTag {
        self.tag
    }

    pub fn mb_code(&self) -> Option<ResourceHandle> {
        self.mb_code.map(|r| r.handle)
    }

    pub fn mv_data(&self) -> Option<ResourceHandle> {
        self.mv_data.map(|r| r.handle)
    }

    pub fn mv_temporal(&self) -> Option<ResourceHandle> {
        self.mv_temporal.map(|r| r.handle)
    }

    pub fn ds_recon_4x(&self) -> Option<ResourceHandle> {
        self.ds_recon_4x.map(|r| r.handle)
    }

    pub fn ds_recon_8x(&self) -> Option<ResourceHandle> {
        self.ds_recon_8x.map(|r| r.handle)
    }

    pub fn used_for_curr_frame(&self) -> bool {
        self.used_for_curr_frame
    }

    /// Frame sizes the resources of this slot were allocated for, without duplicates.
    pub fn geometries(&self) -> Vec<Resolution> {
        let mut geometries: Vec<Resolution> = Vec::new();
        for resource in self.resources() {
            if !geometries.contains(&resource.geometry) {
                geometries.push(resource.geometry);
            }
        }
        geometries
    }

    pub fn is_empty(&self) -> bool {
        self.resources().next().is_none()
    }

    fn resources(&self) -> impl Iterator<Item = &TrackedResource> {
        [
            &self.mb_code,
            &self.mv_data,
            &self.mv_temporal,
            &self.ds_recon_4x,
            &self.ds_recon_8x,
        ]
        .into_iter()
        .flatten()
    }

    /// Frees all the resources of the slot and makes it available again.
    fn release<G: GpuResourceLayer + ?Sized>(&mut self, gpu: &mut G) {
        for resource in [
            &mut self.mb_code,
            &mut self.mv_data,
            &mut self.mv_temporal,
            &mut self.ds_recon_4x,
            &mut self.ds_recon_8x,
        ] {
            if let Some(resource) = resource.take() {
                gpu.free_resource(resource.handle);
            }
        }
        self.tag = SlotTag::Free;
    }
}

/// Returns the resource in `res`, allocating it with `alloc` if the slot does not own one yet.
fn get_or_allocate<G, F>(
    gpu: &mut G,
    res: &mut Option<TrackedResource>,
    geometry: Resolution,
    alloc: F,
) -> EncodeResult<ResourceHandle>
where
    G: GpuResourceLayer + ?Sized,
    F: FnOnce(&mut G) -> EncodeResult<ResourceHandle>,
{
    if let Some(resource) = *res {
        if resource.geometry != geometry {
            log::error!(
                "{} was allocated for {}x{}, requested for {}x{}",
                resource.handle,
                resource.geometry.width,
                resource.geometry.height,
                geometry.width,
                geometry.height
            );
            return Err(EncodeError::InvalidInternalState);
        }
        return Ok(resource.handle);
    }

    let handle = alloc(gpu)?;
    *res = Some(TrackedResource { handle, geometry });
    Ok(handle)
}

/// What the current picture needs from the pool.
#[derive(Clone, Debug)]
pub struct FrameAllocRequest<'a> {
    /// Frame-store index of the reconstructed picture.
    pub recon: FrameIdx,
    pub used_as_ref: bool,
    /// Distinct frames referenced by the current picture. Their slots must not be reused.
    pub ref_list: &'a [FrameIdx],
    pub gop_is_idr_only: bool,
    /// The hardware waits for the previous PAK pass before running this picture.
    pub wait_for_pak: bool,
    pub geometry: &'a SequenceGeometry,
    /// Whether MB code (and MV data) buffers are owned by the pool.
    pub alloc_mb_code: bool,
    /// Whether the VDEnc downscaled reconstructions are needed.
    pub alloc_ds_recon: bool,
}

#[derive(Debug)]
pub struct TrackedBufferAllocator {
    slots: [TrackedBufferSlot; NUM_TRACKED_BUFFERS],
    /// Slots of the most recent pictures, the current one first.
    recent: [Option<usize>; MAX_PIPELINE_DEPTH],
    /// Position in the non-reference ring of the last non-reference picture.
    non_ref_cursor: usize,
    /// Consecutive non-reference pictures set up without a PAK wait, saturating at the ring size.
    count_non_ref: usize,
    /// Pictures left until all buffers of the previous resolution are released.
    resize_countdown: usize,
    wait_for_tracked_buffer: bool,
}

impl Default for TrackedBufferAllocator {
    fn default() -> Self {
        Self {
            slots: Default::default(),
            recent: [None; MAX_PIPELINE_DEPTH],
            non_ref_cursor: NUM_NON_REF_BUFFERS - 1,
            count_non_ref: 0,
            resize_countdown: 0,
            wait_for_tracked_buffer: false,
        }
    }
}

impl TrackedBufferAllocator {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn slot(&self, index: usize) -> Option<&TrackedBufferSlot> {
        self.slots.get(index)
    }

    pub fn current(&self) -> Option<usize> {
        self.recent[0]
    }

    pub fn penultimate(&self) -> Option<usize> {
        self.recent[1]
    }

    pub fn ante_penultimate(&self) -> Option<usize> {
        self.recent[2]
    }

    pub fn current_slot(&self) -> Option<&TrackedBufferSlot> {
        self.current().and_then(|i| self.slot(i))
    }

    /// Whether the hardware must wait before reusing the current non-reference slot, because the
    /// whole non-reference ring has been cycled through without any PAK wait.
    pub fn wait_for_tracked_buffer(&self) -> bool {
        self.wait_for_tracked_buffer
    }

    pub fn resize_countdown(&self) -> usize {
        self.resize_countdown
    }

    fn is_protected(&self, index: usize) -> bool {
        self.recent.contains(&Some(index))
    }

    /// Picks the slot of the current picture and makes sure it owns all the buffers the picture
    /// needs. Returns the slot index.
    pub fn allocate_for_curr_frame<G: GpuResourceLayer + ?Sized>(
        &mut self,
        gpu: &mut G,
        req: &FrameAllocRequest,
    ) -> EncodeResult<usize> {
        if self.resize_countdown > 0 {
            self.release_on_res_change(gpu);
            self.resize_countdown -= 1;
            if self.resize_countdown == 0 {
                self.sweep_resize_pending(gpu);
            }
        }

        let index = self.look_up_buf_index(req)?;
        self.recent.rotate_right(1);
        self.recent[0] = Some(index);

        self.wait_for_tracked_buffer =
            index >= NUM_REF_BUFFERS && self.count_non_ref >= NUM_NON_REF_BUFFERS;

        log::debug!(
            "recon frame {} (ref: {}, {} refs) uses tracked buffer {}",
            req.recon.get(),
            req.used_as_ref,
            req.ref_list.len(),
            index
        );

        let geometry = req.geometry.resolution();
        let buffers = &req.geometry.buffers;
        let slot = &mut self.slots[index];

        if req.alloc_mb_code {
            get_or_allocate(gpu, &mut slot.mb_code, geometry, |gpu| {
                allocate_zeroed_buffer(
                    gpu,
                    buffers.mb_code_size + MB_CODE_PREFETCH_PADDING,
                    "MbCode",
                )
                .map_err(map_alloc_err)
            })?;

            if buffers.mv_data_size != 0 {
                get_or_allocate(gpu, &mut slot.mv_data, geometry, |gpu| {
                    allocate_zeroed_buffer(gpu, buffers.mv_data_size, "MvData")
                        .map_err(map_alloc_err)
                })?;
            }
        }

        get_or_allocate(gpu, &mut slot.mv_temporal, geometry, |gpu| {
            gpu.allocate(&AllocDescriptor::Buffer {
                size: buffers.mv_temporal_size,
                name: "MvTemporal",
            })
            .map_err(map_alloc_err)
        })?;

        if req.alloc_ds_recon {
            let ds_4x = buffers.ds_recon_4x;
            for (res, width, height, name) in [
                (&mut slot.ds_recon_4x, ds_4x.width, ds_4x.height, "4xDsRecon"),
                (
                    &mut slot.ds_recon_8x,
                    ds_4x.width >> 1,
                    ds_4x.height >> 1,
                    "8xDsRecon",
                ),
            ] {
                get_or_allocate(gpu, res, geometry, |gpu| {
                    gpu.allocate(&AllocDescriptor::Surface2D {
                        width,
                        height,
                        format: SurfaceFormat::Nv12,
                        tile: TileType::Y,
                        name,
                    })
                    .map_err(map_alloc_err)
                })?;
            }
        }

        Ok(index)
    }

    fn look_up_buf_index(&mut self, req: &FrameAllocRequest) -> EncodeResult<usize> {
        let index = if req.used_as_ref
            && req.ref_list.len() <= MAX_NUM_REF_FRAME
            && !req.gop_is_idr_only
        {
            let mut found = None;

            for (i, slot) in self.slots[..NUM_REF_BUFFERS].iter_mut().enumerate() {
                if let SlotTag::Frame(frame) = slot.tag {
                    if !req.ref_list.contains(&frame) {
                        slot.tag = SlotTag::Free;
                    }
                }

                if found.is_none() && slot.tag == SlotTag::Free {
                    found = Some(i);
                }
            }

            found.ok_or_else(|| {
                EncodeError::invalid(format!(
                    "no tracked buffer available for {} references",
                    req.ref_list.len()
                ))
            })?
        } else {
            if req.wait_for_pak {
                self.count_non_ref = 0;
            } else if self.count_non_ref < NUM_NON_REF_BUFFERS {
                self.count_non_ref += 1;
            }

            self.non_ref_cursor = (self.non_ref_cursor + 1) % NUM_NON_REF_BUFFERS;
            NUM_REF_BUFFERS + self.non_ref_cursor
        };

        self.slots[index].tag = SlotTag::Frame(req.recon);

        Ok(index)
    }

    /// Drops all the buffers, except the ones of the last [`MAX_PIPELINE_DEPTH`] pictures which
    /// are released over the next pictures.
    pub fn resize<G: GpuResourceLayer + ?Sized>(&mut self, gpu: &mut G) {
        self.resize_countdown = MAX_PIPELINE_DEPTH;

        for index in 0..NUM_TRACKED_BUFFERS {
            if self.is_protected(index) {
                self.slots[index].tag = SlotTag::ResizePending;
            } else {
                self.slots[index].release(gpu);
            }
        }

        log::debug!(
            "tracked buffers resized, keeping {:?} for {} pictures",
            self.recent,
            self.resize_countdown
        );
    }

    fn release_on_res_change<G: GpuResourceLayer + ?Sized>(&mut self, gpu: &mut G) {
        let [curr, penu, Some(ante)] = self.recent else {
            return;
        };

        if Some(ante) != penu && Some(ante) != curr {
            let slot = &mut self.slots[ante];
            if slot.tag == SlotTag::ResizePending {
                slot.release(gpu);
                log::debug!("tracked buffer {} released after resize", ante);
            }
        }
    }

    /// Releases the slots still waiting for a resize. Reached when the same slot was used by
    /// several of the last pictures before the resize.
    fn sweep_resize_pending<G: GpuResourceLayer + ?Sized>(&mut self, gpu: &mut G) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.tag == SlotTag::ResizePending {
                slot.release(gpu);
                log::debug!("tracked buffer {} released at end of resize", index);
            }
        }
    }

    /// Clears the per-frame usage marks of [`preenc_lookup`].
    ///
    /// [`preenc_lookup`]: TrackedBufferAllocator::preenc_lookup
    pub fn reset_used_for_curr_frame(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.used_for_curr_frame = false;
        }
    }

    /// Finds a slot for a pre-encode pass over `frame`. Returns the slot and whether it already
    /// held `frame`, or `None` if every slot is taken by the current frame.
    pub fn preenc_lookup(&mut self, frame: FrameIdx) -> Option<(usize, bool)> {
        let start = frame.as_usize() % NUM_TRACKED_BUFFERS;
        let mut candidates =
            (0..NUM_TRACKED_BUFFERS).map(move |i| (start + i) % NUM_TRACKED_BUFFERS);

        if let Some(index) = candidates
            .clone()
            .find(|i| self.slots[*i].tag == SlotTag::Frame(frame))
        {
            self.slots[index].used_for_curr_frame = true;
            return Some((index, true));
        }

        let index = candidates.find(|i| !self.slots[*i].used_for_curr_frame)?;
        let slot = &mut self.slots[index];
        slot.tag = SlotTag::Frame(frame);
        slot.used_for_curr_frame = true;

        Some((index, false))
    }

    /// Frees every buffer of the pool. Only safe once the hardware is idle.
    pub fn release_all<G: GpuResourceLayer + ?Sized>(&mut self, gpu: &mut G) {
        for slot in self.slots.iter_mut() {
            slot.release(gpu);
            slot.used_for_curr_frame = false;
        }
        self.recent = [None; MAX_PIPELINE_DEPTH];
        self.count_non_ref = 0;
        self.resize_countdown = 0;
        self.wait_for_tracked_buffer = false;
    }
}
