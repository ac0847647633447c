// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Picture and slice level control plane of a hardware HEVC encoder.
//!
//! The [`encoder::hevc::PictureOrchestrator`] validates the sequence, picture and slice
//! parameters of each picture, compacts the reference lists into the hardware reference index
//! space and keeps the per-frame GPU buffers alive for as long as the pictures using them may
//! still be referenced. Memory and command emission are delegated to the traits of [`backend`].

pub mod backend;
pub mod codec;
pub mod encoder;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn get_area(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}
