// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod hevc;
pub mod tracked_buffer;

use thiserror::Error;

use crate::backend::BackendError;

#[derive(Error, Debug)]
pub enum EncodeError {
    /// Malformed or out of range syntax. Fatal for the current picture.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// A required input structure was not provided.
    #[error("missing required input: {0}")]
    NullPointer(&'static str),
    #[error("GPU resource allocation failed")]
    AllocationFailed(#[source] BackendError),
    #[error("command builder failed")]
    CommandBuilder(#[source] BackendError),
    #[error("invalid internal state. This is likely a bug.")]
    InvalidInternalState,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl EncodeError {
    /// Logs `msg` and wraps it into [`EncodeError::InvalidParameter`].
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        log::error!("{}", msg);
        EncodeError::InvalidParameter(msg)
    }
}

pub type EncodeResult<T> = Result<T, EncodeError>;

/// Maps allocation errors of the backend to [`EncodeError::AllocationFailed`], leaving the others
/// as generic backend errors.
pub(crate) fn map_alloc_err(e: BackendError) -> EncodeError {
    match e {
        BackendError::AllocationFailed { .. } => EncodeError::AllocationFailed(e),
        e => EncodeError::Backend(e),
    }
}
