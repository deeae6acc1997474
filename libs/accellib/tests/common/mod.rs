//! Shared fixtures for the integration tests.
//!
//! One configured device carrying two encoder instances and one scaler,
//! backed by a simulated hardware queue and a database isolated in a
//! temporary directory.

// Each test binary uses a different slice of this module.
#![allow(dead_code)]

use std::sync::Arc;

use accellib::core::plugin::{ChannelPlan, PluginEntry};
use accellib::core::shm::DbOptions;
use accellib::{
    HwBank, HwComputeUnit, HwDevice, HwInventory, HwQueue, ImageConfig, KernelConfig,
    KernelFunction, PluginCatalog, ResourceManager, SimQueue, SystemConfig,
};
use tempfile::TempDir;

pub const VENDOR: &str = "acme";
pub const ENCODER_TAG: u32 = 1;
pub const SCALER_TAG: u32 = 1;

pub fn test_config(encoder_instances: u32, zerocopy: bool) -> SystemConfig {
    SystemConfig {
        images: vec![ImageConfig {
            name: "transcode.bin".into(),
            devices: vec![0],
            zerocopy,
            kernels: vec![
                KernelConfig {
                    name: "enc".into(),
                    vendor: VENDOR.into(),
                    function: KernelFunction::Encoder,
                    type_tag: ENCODER_TAG,
                    instances: encoder_instances,
                },
                KernelConfig {
                    name: "scal".into(),
                    vendor: VENDOR.into(),
                    function: KernelFunction::Scaler,
                    type_tag: SCALER_TAG,
                    instances: 1,
                },
            ],
        }],
    }
}

pub fn test_inventory(encoder_instances: u32) -> HwInventory {
    let mut units = Vec::new();
    for i in 0..encoder_instances {
        units.push(HwComputeUnit {
            name: format!("enc_{i}"),
            base_address: 0x1000 + (i as u64) * 0x1000,
            soft_kernel: false,
            channels: true,
            max_channel_id: 3,
            bank_connectivity: 0b1,
            default_bank: 0,
            cu_index: 0,
            cu_masks: [0; 4],
        });
    }
    units.push(HwComputeUnit {
        name: "scal_0".into(),
        base_address: 0x9000,
        soft_kernel: false,
        channels: false,
        max_channel_id: 0,
        bank_connectivity: 0b1,
        default_bank: 0,
        cu_index: 0,
        cu_masks: [0; 4],
    });
    HwInventory {
        devices: vec![HwDevice {
            index: 0,
            handle: 0xd00d,
            compute_units: units,
            banks: vec![HwBank {
                name: "bank0".into(),
                base_address: 0,
                size_kb: 1 << 20,
                in_use: true,
            }],
        }],
    }
}

/// Encoder plugin: up to four channels of 250 load each, next free id.
/// Scaler plugin: no balancer, single implicit channel.
pub fn test_plugins() -> PluginCatalog {
    let mut catalog = PluginCatalog::new();
    catalog.register(
        KernelFunction::Encoder,
        PluginEntry {
            type_tag: ENCODER_TAG,
            multi_process: Some(Arc::new(|_, _, ids| {
                let mut id = 0;
                for &used in ids {
                    if used == id {
                        id += 1;
                    } else {
                        break;
                    }
                }
                Ok(ChannelPlan {
                    chan_id: id,
                    load: 250,
                })
            })),
            single_process: None,
            private_data_size: 64,
        },
    );
    catalog.register(
        KernelFunction::Scaler,
        PluginEntry {
            type_tag: SCALER_TAG,
            ..Default::default()
        },
    );
    catalog
}

pub struct Fixture {
    pub manager: ResourceManager,
    pub queue: Arc<SimQueue>,
    // Held for its Drop: the database files live underneath.
    #[allow(dead_code)]
    pub dir: TempDir,
}

pub fn fixture(encoder_instances: u32, zerocopy: bool) -> Fixture {
    accellib::init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let queue = Arc::new(SimQueue::new());
    let queue_for_factory = queue.clone();
    let manager = ResourceManager::new(
        test_config(encoder_instances, zerocopy),
        test_inventory(encoder_instances),
        test_plugins(),
        DbOptions::in_dir(dir.path()),
        &move |_| -> Arc<dyn HwQueue> { queue_for_factory.clone() },
    )
    .expect("resource manager");
    Fixture {
        manager,
        queue,
        dir,
    }
}
