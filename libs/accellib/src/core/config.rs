// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Deserialized system configuration consumed by database initialization.
//!
//! Parsing the configuration file is the front-end's job; this module only
//! defines the shape the core reads: which images cover which devices, the
//! kernel types each image provides, and whether an image enables zero-copy
//! hand-off between sessions.

use serde::{Deserialize, Serialize};

/// Function class of a hardware kernel.
///
/// One compute unit implements exactly one of these. The class participates
/// in kernel matching together with the vendor string and the type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelFunction {
    Decoder,
    Encoder,
    Scaler,
    Filter,
    Kernel,
}

impl KernelFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelFunction::Decoder => "decoder",
            KernelFunction::Encoder => "encoder",
            KernelFunction::Scaler => "scaler",
            KernelFunction::Filter => "filter",
            KernelFunction::Kernel => "kernel",
        }
    }
}

/// Requested kernel identity: function class plus a per-class type tag.
///
/// The tag discriminates hardware variants within one class (e.g. H.264 vs
/// HEVC encoders). It replaces the single overloaded selector the legacy
/// configuration format used for every class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", content = "type", rename_all = "lowercase")]
pub enum KernelClass {
    Decoder(u32),
    Encoder(u32),
    Scaler(u32),
    Filter(u32),
    Kernel(u32),
}

impl KernelClass {
    pub fn function(&self) -> KernelFunction {
        match self {
            KernelClass::Decoder(_) => KernelFunction::Decoder,
            KernelClass::Encoder(_) => KernelFunction::Encoder,
            KernelClass::Scaler(_) => KernelFunction::Scaler,
            KernelClass::Filter(_) => KernelFunction::Filter,
            KernelClass::Kernel(_) => KernelFunction::Kernel,
        }
    }

    pub fn type_tag(&self) -> u32 {
        match self {
            KernelClass::Decoder(t)
            | KernelClass::Encoder(t)
            | KernelClass::Scaler(t)
            | KernelClass::Filter(t)
            | KernelClass::Kernel(t) => *t,
        }
    }
}

/// One kernel type entry within an image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Kernel name as it appears in the image metadata.
    pub name: String,
    /// Vendor string matched against allocation requests.
    pub vendor: String,
    /// Function class of every instance of this entry.
    pub function: KernelFunction,
    /// Hardware type tag within the function class.
    #[serde(default)]
    pub type_tag: u32,
    /// Number of physical instances the image places on each device.
    pub instances: u32,
}

/// One downloadable image and the devices it applies to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Image file name, recorded in the database for diagnostics.
    pub name: String,
    /// Devices this image is downloaded to.
    pub devices: Vec<u32>,
    /// Whether sessions on these devices may negotiate zero-copy connections.
    #[serde(default)]
    pub zerocopy: bool,
    pub kernels: Vec<KernelConfig>,
}

/// Top-level configuration handed to [`SharedDatabase::open`].
///
/// [`SharedDatabase::open`]: crate::core::shm::SharedDatabase::open
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    pub images: Vec<ImageConfig>,
}

impl SystemConfig {
    /// Distinct device ids named by any image.
    pub fn device_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .images
            .iter()
            .flat_map(|img| img.devices.iter().copied())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Whether the image downloaded to `device` enables zero-copy.
    pub fn zerocopy_enabled(&self, device: u32) -> bool {
        self.images
            .iter()
            .any(|img| img.zerocopy && img.devices.contains(&device))
    }
}
