// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Plugin catalog: the per-kernel-type capabilities the core consults.
//!
//! Loading plugin tables from disk is an external collaborator's job. The
//! core only reads three things per kernel type: the hardware type tag used
//! for matching, the optional load-balance strategy consulted during channel
//! allocation, and the per-session private-data size (opaque here, used by
//! the layers above for allocation sizing).

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::config::KernelFunction;
use crate::core::error::Result;
use crate::core::session::Session;

/// What a load balancer hands back: the channel to use and the load share
/// (0..=1000) the new channel contributes to the kernel's aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPlan {
    pub chan_id: i32,
    pub load: u16,
}

/// Multi-process balancer: sees the kernel's aggregate load and the sorted
/// ids of channels currently live across all processes, picks a
/// non-colliding id and a load share, or declines.
pub type MultiProcessBalancer =
    Arc<dyn Fn(&Session, u16, &[i32]) -> Result<ChannelPlan> + Send + Sync>;

/// Legacy single-process balancer: sees only how many channels this process
/// already runs on the kernel and picks an id. No load accounting; kernels
/// using it are private to one process.
pub type SingleProcessBalancer = Arc<dyn Fn(&Session, u32) -> Result<i32> + Send + Sync>;

/// The channel-allocation capability a plugin declares.
#[derive(Clone)]
pub enum LoadStrategy {
    MultiProcess(MultiProcessBalancer),
    SingleProcess(SingleProcessBalancer),
}

impl std::fmt::Debug for LoadStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadStrategy::MultiProcess(_) => f.write_str("LoadStrategy::MultiProcess"),
            LoadStrategy::SingleProcess(_) => f.write_str("LoadStrategy::SingleProcess"),
        }
    }
}

/// One registered plugin table.
#[derive(Clone, Default)]
pub struct PluginEntry {
    /// Hardware type tag matched against kernel requests.
    pub type_tag: u32,
    pub multi_process: Option<MultiProcessBalancer>,
    pub single_process: Option<SingleProcessBalancer>,
    /// Opaque per-session allocation size for the layers above.
    pub private_data_size: usize,
}

impl PluginEntry {
    /// The strategy channel allocation uses. When a plugin declares both
    /// variants the multi-process one wins; the single-process form only
    /// survives for plugins that have not been ported.
    pub fn strategy(&self) -> Option<LoadStrategy> {
        if let Some(mp) = &self.multi_process {
            return Some(LoadStrategy::MultiProcess(mp.clone()));
        }
        self.single_process
            .as_ref()
            .map(|sp| LoadStrategy::SingleProcess(sp.clone()))
    }
}

/// Every plugin table known to this process, indexed the same way the
/// database numbers plugin handles: per function class, in load order.
#[derive(Default)]
pub struct PluginCatalog {
    entries: HashMap<KernelFunction, Vec<PluginEntry>>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin table, returning its handle within the class.
    pub fn register(&mut self, function: KernelFunction, entry: PluginEntry) -> i32 {
        let list = self.entries.entry(function).or_default();
        list.push(entry);
        (list.len() - 1) as i32
    }

    pub fn entry(&self, function: KernelFunction, handle: i32) -> Option<&PluginEntry> {
        if handle < 0 {
            return None;
        }
        self.entries.get(&function)?.get(handle as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_process_preferred_over_single() {
        let entry = PluginEntry {
            type_tag: 1,
            multi_process: Some(Arc::new(|_, _, _| {
                Ok(ChannelPlan {
                    chan_id: 0,
                    load: 100,
                })
            })),
            single_process: Some(Arc::new(|_, _| Ok(0))),
            private_data_size: 0,
        };
        assert!(matches!(
            entry.strategy(),
            Some(LoadStrategy::MultiProcess(_))
        ));
    }

    #[test]
    fn test_no_strategy_when_plugin_declares_none() {
        let entry = PluginEntry::default();
        assert!(entry.strategy().is_none());
    }

    #[test]
    fn test_handles_number_per_class() {
        let mut catalog = PluginCatalog::new();
        let enc0 = catalog.register(KernelFunction::Encoder, PluginEntry::default());
        let dec0 = catalog.register(KernelFunction::Decoder, PluginEntry::default());
        let enc1 = catalog.register(KernelFunction::Encoder, PluginEntry::default());
        assert_eq!(enc0, 0);
        assert_eq!(dec0, 0);
        assert_eq!(enc1, 1);
        assert!(catalog.entry(KernelFunction::Encoder, 1).is_some());
        assert!(catalog.entry(KernelFunction::Decoder, 1).is_none());
    }
}
