// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interfaces to the collaborators of the encoder control plane.
//!
//! A backend provides GPU memory (buffers and 2D surfaces) and consumes the per-picture state
//! computed by the encoder to emit hardware commands. Neither is implemented here: a real driver
//! plugs its own implementation in, while [`dummy`] provides in-memory stand-ins for tests.

use std::fmt;

use thiserror::Error;

use crate::codec::h265::params::SliceParameters;
use crate::encoder::hevc::PictureState;

pub mod dummy;

/// Size of a GPU cacheline in bytes.
pub const CACHELINE_SIZE: u32 = 64;
/// Size of a GPU page in bytes.
pub const PAGE_SIZE: u32 = 4096;
/// Height alignment of Y-tiled surfaces.
pub const YTILE_H_ALIGNMENT: u32 = 32;

/// Opaque handle to a resource allocated by a [`GpuResourceLayer`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceHandle(pub u32);

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res#{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SurfaceFormat {
    Nv12,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TileType {
    Linear,
    Y,
}

/// What to allocate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocDescriptor {
    /// Linear buffer of `size` bytes.
    Buffer { size: u32, name: &'static str },
    /// Two dimensional surface.
    Surface2D {
        width: u32,
        height: u32,
        format: SurfaceFormat,
        tile: TileType,
        name: &'static str,
    },
}

impl AllocDescriptor {
    pub fn name(&self) -> &'static str {
        match self {
            AllocDescriptor::Buffer { name, .. } => name,
            AllocDescriptor::Surface2D { name, .. } => name,
        }
    }
}

/// Memory layout of an allocated resource.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceLayout {
    pub pitch: u32,
    pub aligned_height: u32,
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("failed to allocate {name}")]
    AllocationFailed { name: &'static str },
    #[error("invalid resource handle {0}")]
    InvalidHandle(ResourceHandle),
    #[error("failed to lock {0}")]
    LockFailed(ResourceHandle),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// GPU memory provider.
pub trait GpuResourceLayer {
    /// Allocates a new resource as described by `desc`.
    fn allocate(&mut self, desc: &AllocDescriptor) -> BackendResult<ResourceHandle>;

    /// Maps `handle` for CPU writes. The mapping stays valid until [`unlock`] is called.
    ///
    /// [`unlock`]: GpuResourceLayer::unlock
    fn lock_for_write(&mut self, handle: ResourceHandle) -> BackendResult<&mut [u8]>;

    fn unlock(&mut self, handle: ResourceHandle);

    /// Frees `handle`. Freeing an already freed handle is a no-op.
    fn free_resource(&mut self, handle: ResourceHandle);

    fn query_layout(&self, handle: ResourceHandle) -> BackendResult<ResourceLayout>;
}

/// Allocates a linear buffer and clears its content, the way the hardware expects freshly
/// allocated statistics and PAK buffers to be.
pub fn allocate_zeroed_buffer<G: GpuResourceLayer + ?Sized>(
    gpu: &mut G,
    size: u32,
    name: &'static str,
) -> BackendResult<ResourceHandle> {
    let handle = gpu.allocate(&AllocDescriptor::Buffer { size, name })?;

    match gpu.lock_for_write(handle) {
        Ok(data) => data.fill(0),
        Err(e) => {
            gpu.free_resource(handle);
            return Err(e);
        }
    }
    gpu.unlock(handle);

    Ok(handle)
}

/// Consumer of the per-picture state, responsible for turning it into hardware commands.
pub trait CommandBuilder {
    fn build_picture(
        &mut self,
        state: &PictureState,
        slices: &[SliceParameters],
    ) -> BackendResult<()>;
}

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two.
pub(crate) fn align_up(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::dummy::DummyGpu;
    use super::*;

    #[test]
    fn align() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(4097, PAGE_SIZE), 8192);
    }

    #[test]
    fn zeroed_buffer() {
        let mut gpu = DummyGpu::default();
        let handle = allocate_zeroed_buffer(&mut gpu, 128, "test").unwrap();

        let data = gpu.lock_for_write(handle).unwrap();
        assert_eq!(data.len(), 128);
        assert!(data.iter().all(|b| *b == 0));
        gpu.unlock(handle);

        assert_eq!(gpu.live_resources(), 1);
        assert_eq!(gpu.locked_resources(), 0);
    }

    #[test]
    fn zeroed_buffer_lock_failure_releases_resource() {
        let mut gpu = DummyGpu::default();
        gpu.fail_locks(true);

        assert!(matches!(
            allocate_zeroed_buffer(&mut gpu, 128, "test"),
            Err(BackendError::LockFailed(_))
        ));
        assert_eq!(gpu.live_resources(), 0);
    }
}
