// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Channel allocation within an already-reserved kernel instance.
//!
//! A kernel that has never been used gets the cheap path: no strategy means
//! channel 0 at full load and the kernel is marked channel-incapable. A
//! kernel with live channels requires a strategy, which sees the aggregate
//! load and the sorted list of live channel ids and either picks a
//! non-colliding id with a load share or declines. Load is conserved: the
//! aggregate never exceeds [`MAX_CHAN_LOAD`] and always equals the sum of
//! live channels.

use crate::core::error::{AccelError, Result};
use crate::core::plugin::{ChannelPlan, LoadStrategy};
use crate::core::session::Session;
use crate::core::shm::layout::{
    ChannelRecord, KernelInstanceRecord, MAX_CHAN_LOAD, MAX_KERNEL_CHANNELS,
};

/// Allocates a channel on `kern` for `session`. Runs under the database lock.
///
/// Returns the assigned channel id. Exhaustion errors leave the kernel
/// untouched apart from the channel-incapable marking described above, so
/// the caller can continue scanning other kernels.
pub fn allocate_channel(
    kern: &mut KernelInstanceRecord,
    session: &Session,
    strategy: Option<&LoadStrategy>,
    pid: u32,
) -> Result<i32> {
    let occupied = kern.chan_cnt as usize;

    if occupied == 0 {
        let plan = match strategy {
            None => {
                // Plugin declares no balancer at all: one channel, ever.
                kern.no_chan_cap = true;
                ChannelPlan {
                    chan_id: 0,
                    load: MAX_CHAN_LOAD,
                }
            }
            Some(LoadStrategy::MultiProcess(balance)) => {
                tracing::debug!(session = session.id(), "kernel unused, consulting balancer");
                match balance(session, kern.curr_load, &[]) {
                    Ok(plan) if plan.chan_id >= 0 => plan,
                    Ok(_) => {
                        kern.no_chan_cap = true;
                        return Err(AccelError::NoChannel(
                            "balancer returned no channel id".into(),
                        ));
                    }
                    Err(e) => {
                        tracing::debug!(session = session.id(), "channel request rejected: {e}");
                        if matches!(e, AccelError::NoChannel(_) | AccelError::Other(_)) {
                            kern.no_chan_cap = true;
                        }
                        return Err(e);
                    }
                }
            }
            Some(LoadStrategy::SingleProcess(balance)) => {
                let chan_id = balance(session, 0)?;
                ChannelPlan {
                    chan_id: chan_id.max(0),
                    load: 0,
                }
            }
        };
        if plan.load > MAX_CHAN_LOAD {
            return Err(AccelError::NoChannel(
                "channel load share exceeds kernel capacity".into(),
            ));
        }
        kern.push_channel(ChannelRecord {
            client_pid: pid,
            session_id: session.id(),
            chan_id: plan.chan_id,
            load: plan.load,
        });
        tracing::debug!(
            session = session.id(),
            chan_id = plan.chan_id,
            "kernel acquired"
        );
        return Ok(plan.chan_id);
    }

    // Kernel already has live channels.
    let Some(strategy) = strategy else {
        return Err(AccelError::NoKernel(
            "kernel in use and does not support channels".into(),
        ));
    };
    if occupied >= MAX_KERNEL_CHANNELS || kern.no_chan_cap {
        return Err(AccelError::NoChannel("kernel channels exhausted".into()));
    }

    let plan = match strategy {
        LoadStrategy::MultiProcess(balance) => {
            let mut ids = kern.channel_ids();
            ids.sort_unstable();
            let plan = match balance(session, kern.curr_load, &ids) {
                Ok(plan) => plan,
                Err(e) => {
                    if matches!(e, AccelError::NoChannel(_) | AccelError::Other(_)) {
                        kern.no_chan_cap = true;
                    }
                    return Err(e);
                }
            };
            if plan.chan_id < 0 {
                kern.no_chan_cap = true;
                return Err(AccelError::NoChannel(
                    "balancer returned no channel id".into(),
                ));
            }
            if kern.curr_load as u32 + plan.load as u32 > MAX_CHAN_LOAD as u32 {
                tracing::debug!(
                    session = session.id(),
                    curr = kern.curr_load,
                    share = plan.load,
                    "channel load share exceeds kernel capacity"
                );
                return Err(AccelError::NoChannel("kernel load capacity exceeded".into()));
            }
            plan
        }
        LoadStrategy::SingleProcess(balance) => {
            // Legacy path: the kernel stays private to the first process.
            if kern.client_pids().first() != Some(&pid) {
                return Err(AccelError::NoKernel(
                    "kernel held by another process".into(),
                ));
            }
            let chan_id = balance(session, occupied as u32)?;
            ChannelPlan { chan_id, load: 0 }
        }
    };

    kern.push_channel(ChannelRecord {
        client_pid: pid,
        session_id: session.id(),
        chan_id: plan.chan_id,
        load: plan.load,
    });
    tracing::debug!(
        session = session.id(),
        chan_id = plan.chan_id,
        instance = occupied,
        "kernel in use, channel added"
    );
    Ok(plan.chan_id)
}
