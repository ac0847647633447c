// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the encoder control plane
//! run so we can test it in isolation.

use std::collections::BTreeSet;
use std::collections::HashMap;

use anyhow::anyhow;
use bytes::BytesMut;

use crate::backend::align_up;
use crate::backend::AllocDescriptor;
use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::CommandBuilder;
use crate::backend::GpuResourceLayer;
use crate::backend::ResourceHandle;
use crate::backend::ResourceLayout;
use crate::backend::TileType;
use crate::backend::YTILE_H_ALIGNMENT;
use crate::codec::h265::params::SliceParameters;
use crate::encoder::hevc::PictureState;

struct DummyResource {
    desc: AllocDescriptor,
    layout: ResourceLayout,
    data: BytesMut,
}

/// GPU memory backed by system memory.
#[derive(Default)]
pub struct DummyGpu {
    resources: HashMap<u32, DummyResource>,
    locked: BTreeSet<u32>,
    next_id: u32,
    /// Number of allocations that will still succeed, `None` for unlimited.
    allocations_left: Option<usize>,
    fail_locks: bool,
    total_allocations: usize,
}

impl DummyGpu {
    /// Makes every allocation after the next `count` ones fail.
    pub fn fail_allocations_after(&mut self, count: usize) {
        self.allocations_left = Some(count);
    }

    pub fn fail_locks(&mut self, fail: bool) {
        self.fail_locks = fail;
    }

    /// Number of resources currently allocated.
    pub fn live_resources(&self) -> usize {
        self.resources.len()
    }

    pub fn locked_resources(&self) -> usize {
        self.locked.len()
    }

    /// Number of successful allocations since creation.
    pub fn total_allocations(&self) -> usize {
        self.total_allocations
    }

    pub fn is_live(&self, handle: ResourceHandle) -> bool {
        self.resources.contains_key(&handle.0)
    }

    /// Returns the descriptor `handle` was allocated with, if it is still live.
    pub fn descriptor(&self, handle: ResourceHandle) -> Option<&AllocDescriptor> {
        self.resources.get(&handle.0).map(|r| &r.desc)
    }
}

impl GpuResourceLayer for DummyGpu {
    fn allocate(&mut self, desc: &AllocDescriptor) -> BackendResult<ResourceHandle> {
        if let Some(left) = self.allocations_left.as_mut() {
            if *left == 0 {
                return Err(BackendError::AllocationFailed { name: desc.name() });
            }
            *left -= 1;
        }

        let (layout, size) = match *desc {
            AllocDescriptor::Buffer { size, .. } => (
                ResourceLayout {
                    pitch: size,
                    aligned_height: 1,
                },
                size,
            ),
            AllocDescriptor::Surface2D {
                width,
                height,
                tile,
                ..
            } => {
                let (pitch, aligned_height) = match tile {
                    TileType::Linear => (width, height),
                    TileType::Y => (align_up(width, 128), align_up(height, YTILE_H_ALIGNMENT)),
                };
                let layout = ResourceLayout {
                    pitch,
                    aligned_height,
                };
                // Luma plus interleaved chroma.
                (layout, pitch * aligned_height * 3 / 2)
            }
        };

        if size == 0 {
            return Err(BackendError::Other(anyhow!(
                "zero sized allocation for {}",
                desc.name()
            )));
        }

        self.next_id += 1;
        let handle = ResourceHandle(self.next_id);
        self.resources.insert(
            handle.0,
            DummyResource {
                desc: desc.clone(),
                layout,
                data: BytesMut::zeroed(size as usize),
            },
        );
        self.total_allocations += 1;

        log::trace!("dummy: allocated {} ({}, {} bytes)", handle, desc.name(), size);

        Ok(handle)
    }

    fn lock_for_write(&mut self, handle: ResourceHandle) -> BackendResult<&mut [u8]> {
        if self.fail_locks {
            return Err(BackendError::LockFailed(handle));
        }

        let resource = self
            .resources
            .get_mut(&handle.0)
            .ok_or(BackendError::InvalidHandle(handle))?;
        self.locked.insert(handle.0);

        Ok(&mut resource.data[..])
    }

    fn unlock(&mut self, handle: ResourceHandle) {
        self.locked.remove(&handle.0);
    }

    fn free_resource(&mut self, handle: ResourceHandle) {
        self.locked.remove(&handle.0);
        if self.resources.remove(&handle.0).is_some() {
            log::trace!("dummy: freed {}", handle);
        }
    }

    fn query_layout(&self, handle: ResourceHandle) -> BackendResult<ResourceLayout> {
        self.resources
            .get(&handle.0)
            .map(|r| r.layout)
            .ok_or(BackendError::InvalidHandle(handle))
    }
}

/// Command builder remembering every state it was handed.
#[derive(Default)]
pub struct RecordingCommandBuilder {
    pub pictures: Vec<(PictureState, usize)>,
    pub fail: bool,
}

impl CommandBuilder for RecordingCommandBuilder {
    fn build_picture(
        &mut self,
        state: &PictureState,
        slices: &[SliceParameters],
    ) -> BackendResult<()> {
        if self.fail {
            return Err(BackendError::Other(anyhow!("command emission failed")));
        }

        self.pictures.push((state.clone(), slices.len()));
        Ok(())
    }
}
