/*
Copyright © 2025 Mako and JayAndJef

This file is part of nvmeboot.

nvmeboot is free software: you can redistribute it and/or modify it under the terms of the GNU General
Public License as published by the Free Software Foundation, either version 3 of the License, or (at
your option) any later version.

nvmeboot is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the
implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public
License for more details.

You should have received a copy of the GNU General Public License along with nvmeboot. If not, see
<https://www.gnu.org/licenses/>.
*/

//! Driver tunables

use super::{
    queue::{MAX_ASYNC_QUEUE_ENTRIES, SYNC_QUEUE_ENTRIES},
    registers::Capabilities,
};

/// Hard upper bound on namespaces tracked per controller
pub const MAX_NAMESPACES: usize = 10;

/// Default command timeout, 5 seconds in 100 ns units
pub const DEFAULT_COMMAND_TIMEOUT: u64 = 50_000_000;

/// Default platform DMA buffer budget (1 MiB)
pub const DEFAULT_DMA_BUFFER_BUDGET: usize = 1024 * 1024;

/// Period of the async completion tick in microseconds
pub const ASYNC_POLL_INTERVAL_US: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    /// Bytes of DMA buffer the platform sets aside for the driver; a block
    /// I/O chunk never exceeds half of it
    pub dma_buffer_budget: usize,
    /// Timeout applied when a packet asks for 0, in 100 ns units
    pub command_timeout: u64,
    /// Requested async I/O queue depth, further limited by CAP.MQES
    pub async_queue_depth: u16,
    /// Namespaces tracked at most, up to [`MAX_NAMESPACES`]
    pub namespace_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            dma_buffer_budget: DEFAULT_DMA_BUFFER_BUDGET,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            async_queue_depth: MAX_ASYNC_QUEUE_ENTRIES,
            namespace_capacity: MAX_NAMESPACES,
        }
    }
}

impl DriverConfig {
    /// Async I/O queue entries for a controller with capabilities `cap`
    pub fn async_queue_entries(&self, cap: Capabilities) -> u16 {
        let requested = self.async_queue_depth.clamp(SYNC_QUEUE_ENTRIES, MAX_ASYNC_QUEUE_ENTRIES) as u32;
        core::cmp::min(cap.max_queue_entries(), requested) as u16
    }

    pub fn namespace_limit(&self) -> usize {
        core::cmp::min(self.namespace_capacity, MAX_NAMESPACES)
    }

    /// Largest block I/O chunk in bytes allowed by the DMA budget
    pub fn chunk_budget(&self) -> usize {
        self.dma_buffer_budget / 2
    }

    pub fn timeout_or_default(&self, timeout: u64) -> u64 {
        if timeout == 0 { self.command_timeout } else { timeout }
    }
}
