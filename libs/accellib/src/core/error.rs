// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The closed error set every public operation returns.
//!
//! Exhaustion errors are ordinary outcomes the caller retries around;
//! [`AccelError::Timeout`] separates "busy" from "broken"; and
//! [`AccelError::Integrity`] is a trip-wire for states only reachable through
//! stale handles or corrupted memory, never silently recovered.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccelError {
    #[error("no device available: {0}")]
    NoDevice(String),

    #[error("no kernel available: {0}")]
    NoKernel(String),

    #[error("no channel available: {0}")]
    NoChannel(String),

    #[error("no free execution buffer: {0}")]
    NoBuffer(String),

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("hardware queue error: {0}")]
    Queue(String),

    #[error("OS error {errno}: {context}")]
    Os { errno: i32, context: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AccelError {
    /// True for the exhaustion class: the caller may retry against another
    /// device, kernel, or at a later time. Never a corruption signal.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            AccelError::NoDevice(_)
                | AccelError::NoKernel(_)
                | AccelError::NoChannel(_)
                | AccelError::NoBuffer(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AccelError>;
