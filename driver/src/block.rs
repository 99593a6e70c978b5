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

//! Block I/O on top of the pass-through layer
//!
//! Requests are checked against the namespace geometry, then split into
//! chunks no larger than the controller transfer limit or half the DMA
//! budget, one Read or Write command per chunk. Synchronous requests use the
//! one-deep I/O queue; async requests become subtasks that the async tick
//! places on the ring queue.

use alloc::boxed::Box;
use log::{debug, trace, warn};

use super::{
    commands::Command,
    controller::{Controller, Platform},
    error::NvmeError,
    passthru::{CommandPacket, Completion, TransferBuffer},
    queue::{ASYNC_IO_QUEUE_ID, QueueType},
};

/// Largest block count one Read/Write command can encode (16-bit NLB)
pub const MAX_BLOCKS_PER_COMMAND: u32 = 1 << 16;

/// Interval between checks while waiting for a namespace to go idle
pub const NAMESPACE_DRAIN_INTERVAL_NS: u64 = 100_000;

/// Called once when every chunk of an async block request is done
pub type BlockNotifier = Box<dyn FnOnce(Result<(), NvmeError>)>;

/// What a namespace looks like to a block I/O consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaInfo {
    pub media_id: u32,
    pub block_size: u32,
    pub last_block: u64,
    pub io_align: u32,
    pub media_present: bool,
    pub read_only: bool,
    pub logical_partition: bool,
    pub write_caching: bool,
    pub removable: bool,
}

impl MediaInfo {
    pub fn block_count(&self) -> u64 {
        self.last_block + 1
    }
}

/// One chunk of an async block request, not yet on the queue
pub(crate) struct Subtask {
    pub(crate) request: u32,
    pub(crate) nsid: u32,
    pub(crate) packet: CommandPacket<'static>,
}

/// Async block request tracked until its last chunk completes
pub(crate) struct BlockRequest {
    pub(crate) id: u32,
    pub(crate) nsid: u32,
    /// Chunks queued or in flight
    outstanding: usize,
    result: Result<(), NvmeError>,
    notifier: Option<BlockNotifier>,
}

/// Geometry of a checked request
#[derive(Debug, Clone, Copy)]
struct Extent {
    block_size: u32,
    blocks: u64,
}

impl<P: Platform> Controller<P> {
    /// Blocks per chunk for `block_size`, bounded by MDTS, half the DMA
    /// budget and the 16-bit block count of a command
    pub fn max_transfer_blocks(&self, block_size: u32) -> u32 {
        let budget = core::cmp::min(self.config.chunk_budget(), u32::MAX as usize) as u32;
        let bytes = match self.max_transfer_size() {
            Some(mdts) => core::cmp::min(mdts, budget),
            None => budget,
        };
        (bytes / block_size.max(1)).clamp(1, MAX_BLOCKS_PER_COMMAND)
    }

    /// Check a request of `len` bytes at `lba` against the namespace
    fn check_request(&self, nsid: u32, lba: u64, addr: usize, len: usize) -> Result<Extent, NvmeError> {
        self.ensure_active()?;
        let media = self.namespace(nsid).map(|ns| ns.media).ok_or(NvmeError::NoMedia)?;
        if !media.media_present {
            return Err(NvmeError::NoMedia);
        }

        let block_size = media.block_size;
        if len == 0 {
            return Ok(Extent { block_size, blocks: 0 });
        }
        if len % block_size as usize != 0 {
            return Err(NvmeError::BadBufferSize);
        }
        let blocks = (len / block_size as usize) as u64;
        if lba > media.last_block || blocks - 1 > media.last_block - lba {
            return Err(NvmeError::InvalidParameter);
        }
        if media.io_align > 1 && addr % media.io_align as usize != 0 {
            return Err(NvmeError::InvalidParameter);
        }
        Ok(Extent { block_size, blocks })
    }

    /// Whether async work for `nsid` is queued or in flight
    pub fn namespace_busy(&self, nsid: u32) -> bool {
        self.async_pending.iter().any(|request| request.nsid == nsid)
            || self.unsubmitted.iter().any(|subtask| subtask.nsid == nsid)
    }

    /// Run the async tick until nothing is pending for `nsid`
    fn wait_for_namespace_idle(&mut self, nsid: u32) -> Result<(), NvmeError> {
        let iterations = self.config.command_timeout * 100 / NAMESPACE_DRAIN_INTERVAL_NS;
        for remaining in (0..=iterations).rev() {
            self.process_async_tasks();
            if !self.namespace_busy(nsid) {
                return Ok(());
            }
            if remaining > 0 {
                self.platform.stall_ns(NAMESPACE_DRAIN_INTERVAL_NS);
            }
        }
        warn!("Namespace {} still has async I/O pending", nsid);
        Err(NvmeError::Timeout)
    }

    /// Read `buffer.len()` bytes starting at `lba`
    pub fn read_blocks(&mut self, nsid: u32, lba: u64, buffer: &mut [u8]) -> Result<(), NvmeError> {
        let extent = self.check_request(nsid, lba, buffer.as_ptr() as usize, buffer.len())?;
        if extent.blocks == 0 {
            return Ok(());
        }
        self.wait_for_namespace_idle(nsid)?;

        let chunk_blocks = self.max_transfer_blocks(extent.block_size);
        let chunk_bytes = chunk_blocks as usize * extent.block_size as usize;
        debug!("Read of {} blocks at LBA {} (nsid {})", extent.blocks, lba, nsid);

        let mut lba = lba;
        for chunk in buffer.chunks_mut(chunk_bytes) {
            let blocks = (chunk.len() / extent.block_size as usize) as u32;
            let mut packet = CommandPacket::new(Command::read(nsid, lba, blocks), QueueType::Io)
                .with_transfer(TransferBuffer::Writable(chunk));
            self.pass_thru(nsid, &mut packet)?;
            lba += blocks as u64;
        }
        Ok(())
    }

    /// Write `buffer` starting at `lba`. Writes use Force Unit Access, so
    /// the data is durable once this returns.
    pub fn write_blocks(&mut self, nsid: u32, lba: u64, buffer: &[u8]) -> Result<(), NvmeError> {
        let extent = self.check_request(nsid, lba, buffer.as_ptr() as usize, buffer.len())?;
        if extent.blocks == 0 {
            return Ok(());
        }
        self.wait_for_namespace_idle(nsid)?;

        let chunk_blocks = self.max_transfer_blocks(extent.block_size);
        let chunk_bytes = chunk_blocks as usize * extent.block_size as usize;
        debug!("Write of {} blocks at LBA {} (nsid {})", extent.blocks, lba, nsid);

        let mut lba = lba;
        for chunk in buffer.chunks(chunk_bytes) {
            let blocks = (chunk.len() / extent.block_size as usize) as u32;
            let mut packet = CommandPacket::new(Command::write(nsid, lba, blocks), QueueType::Io)
                .with_transfer(TransferBuffer::Readable(chunk));
            self.pass_thru(nsid, &mut packet)?;
            lba += blocks as u64;
        }
        Ok(())
    }

    pub fn flush_blocks(&mut self, nsid: u32) -> Result<(), NvmeError> {
        self.check_request(nsid, 0, 0, 0)?;
        self.wait_for_namespace_idle(nsid)?;
        self.pass_thru(nsid, &mut CommandPacket::new(Command::flush(nsid), QueueType::Io))
    }

    /// Queue a read of `buffer.len()` bytes at `lba`; `notifier` runs from
    /// the async tick once all of it has landed in `buffer`.
    pub fn read_blocks_async(
        &mut self,
        nsid: u32,
        lba: u64,
        buffer: &'static mut [u8],
        notifier: BlockNotifier,
    ) -> Result<(), NvmeError> {
        let extent = self.check_request(nsid, lba, buffer.as_ptr() as usize, buffer.len())?;
        if extent.blocks == 0 {
            notifier(Ok(()));
            return Ok(());
        }

        let chunk_bytes = self.max_transfer_blocks(extent.block_size) as usize * extent.block_size as usize;
        let request = self.open_request(nsid, notifier);
        let mut rest = buffer;
        let mut lba = lba;
        while !rest.is_empty() {
            let take = core::cmp::min(chunk_bytes, rest.len());
            let (chunk, tail) = core::mem::take(&mut rest).split_at_mut(take);
            rest = tail;

            let blocks = (take / extent.block_size as usize) as u32;
            let packet = CommandPacket::new(Command::read(nsid, lba, blocks), QueueType::Io)
                .with_transfer(TransferBuffer::Writable(chunk));
            self.queue_subtask(request, nsid, packet);
            lba += blocks as u64;
        }

        self.submit_subtasks();
        Ok(())
    }

    /// Queue a write of `buffer` at `lba`; `notifier` runs from the async
    /// tick once every chunk is durable.
    pub fn write_blocks_async(
        &mut self,
        nsid: u32,
        lba: u64,
        buffer: &'static [u8],
        notifier: BlockNotifier,
    ) -> Result<(), NvmeError> {
        let extent = self.check_request(nsid, lba, buffer.as_ptr() as usize, buffer.len())?;
        if extent.blocks == 0 {
            notifier(Ok(()));
            return Ok(());
        }

        let chunk_bytes = self.max_transfer_blocks(extent.block_size) as usize * extent.block_size as usize;
        let request = self.open_request(nsid, notifier);
        let mut lba = lba;
        for chunk in buffer.chunks(chunk_bytes) {
            let blocks = (chunk.len() / extent.block_size as usize) as u32;
            let packet = CommandPacket::new(Command::write(nsid, lba, blocks), QueueType::Io)
                .with_transfer(TransferBuffer::Readable(chunk));
            self.queue_subtask(request, nsid, packet);
            lba += blocks as u64;
        }

        self.submit_subtasks();
        Ok(())
    }

    /// Let queued I/O for `nsid` finish, flush, then notify
    pub fn flush_blocks_async(&mut self, nsid: u32, notifier: BlockNotifier) -> Result<(), NvmeError> {
        let result = self.flush_blocks(nsid);
        notifier(result);
        result
    }

    /// Async block requests not yet reported to their notifier
    pub fn block_requests_pending(&self) -> usize {
        self.block_requests.len()
    }

    fn open_request(&mut self, nsid: u32, notifier: BlockNotifier) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.block_requests.push(BlockRequest {
            id,
            nsid,
            outstanding: 0,
            result: Ok(()),
            notifier: Some(notifier),
        });
        id
    }

    fn queue_subtask(&mut self, request: u32, nsid: u32, packet: CommandPacket<'static>) {
        if let Some(entry) = self.block_requests.iter_mut().find(|r| r.id == request) {
            entry.outstanding += 1;
        }
        self.unsubmitted.push_back(Subtask { request, nsid, packet });
    }

    /// Move queued chunks onto the async queue until it pushes back
    pub(crate) fn submit_subtasks(&mut self) {
        while !self.unsubmitted.is_empty() {
            if self.queues[ASYNC_IO_QUEUE_ID as usize].is_full() {
                trace!("Async queue full, {} chunk(s) waiting", self.unsubmitted.len());
                break;
            }
            let Some(Subtask { request, nsid, packet }) = self.unsubmitted.pop_front() else {
                break;
            };

            let result = self
                .validate(nsid, &packet)
                .and_then(|()| self.start_async(nsid, packet, Completion::Block(request)));
            if let Err(err) = result {
                warn!("Async block I/O chunk for request {} failed to submit: {}", request, err);
                self.finish_subtask(request, Err(err));
            }
        }
    }

    /// Account for one finished chunk. The first failure drops the chunks
    /// of the same request that were not submitted yet; the notifier runs
    /// once nothing of the request is outstanding.
    pub(crate) fn finish_subtask(&mut self, request: u32, result: Result<(), NvmeError>) {
        let Some(pos) = self.block_requests.iter().position(|r| r.id == request) else {
            return;
        };

        let entry = &mut self.block_requests[pos];
        entry.outstanding = entry.outstanding.saturating_sub(1);
        if let Err(err) = result {
            if entry.result.is_ok() {
                entry.result = Err(err);
            }
            let queued = self.unsubmitted.len();
            self.unsubmitted.retain(|subtask| subtask.request != request);
            entry.outstanding = entry.outstanding.saturating_sub(queued - self.unsubmitted.len());
        }

        if entry.outstanding == 0 {
            let done = self.block_requests.remove(pos);
            trace!("Async block request {} on nsid {} done: {:?}", done.id, done.nsid, done.result);
            if let Some(notify) = done.notifier {
                notify(done.result);
            }
        }
    }

    /// Fail every block request that has not reported yet
    pub(crate) fn fail_block_requests(&mut self, err: NvmeError) {
        self.unsubmitted.clear();
        for request in core::mem::take(&mut self.block_requests) {
            if let Some(notify) = request.notifier {
                notify(Err(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DriverConfig,
        registers::opcodes,
        sim::{AlignedBuffer, SimConfig, SimController, SimNamespace},
    };
    use alloc::{rc::Rc, vec::Vec};
    use core::cell::RefCell;
    use proptest::prelude::*;

    const BASE: u64 = 0xFEB0_0000;

    fn attach(sim: &SimController, config: DriverConfig) -> Controller<SimController> {
        let mut ctrl = Controller::new(sim.clone(), BASE, config).unwrap();
        ctrl.discover_namespaces();
        ctrl
    }

    fn recorder() -> (Rc<RefCell<Vec<Result<(), NvmeError>>>>, BlockNotifier) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        (seen, Box::new(move |result| sink.borrow_mut().push(result)))
    }

    #[test]
    fn chunk_size_follows_mdts_and_budget() {
        let sim = SimController::new();
        let ctrl = attach(&sim, DriverConfig::default());
        // 2^5 pages of 4 KiB
        assert_eq!(ctrl.max_transfer_blocks(512), 256);
        assert_eq!(ctrl.max_transfer_blocks(4096), 32);

        let small = attach(&sim, DriverConfig { dma_buffer_budget: 64 * 1024, ..Default::default() });
        assert_eq!(small.max_transfer_blocks(512), 64);

        let unlimited = SimController::with_config(SimConfig { mdts: 0, ..Default::default() });
        let ctrl = attach(&unlimited, DriverConfig::default());
        assert_eq!(ctrl.max_transfer_blocks(512), 1024);
    }

    proptest! {
        #[test]
        fn chunk_never_exceeds_limits(budget in 1usize..(1 << 24), shift in 9u32..13) {
            let sim = SimController::new();
            let ctrl = attach(&sim, DriverConfig { dma_buffer_budget: budget, ..Default::default() });
            let block_size = 1u32 << shift;
            let blocks = ctrl.max_transfer_blocks(block_size);
            prop_assert!(blocks >= 1 && blocks <= MAX_BLOCKS_PER_COMMAND);
            prop_assert!(blocks == 1 || blocks as usize * block_size as usize <= budget / 2);
            prop_assert!(blocks as u64 * block_size as u64 <= 32 * 4096);
        }
    }

    #[test]
    fn request_checks() {
        let sim = SimController::new();
        let mut ctrl = attach(&sim, DriverConfig::default());
        sim.clear_commands();

        let mut buffer = AlignedBuffer::zeroed(4096);
        assert_eq!(ctrl.read_blocks(1, 0, &mut buffer[..0]), Ok(()));
        assert_eq!(ctrl.read_blocks(1, 0, &mut buffer[..100]), Err(NvmeError::BadBufferSize));
        assert_eq!(ctrl.read_blocks(1, 2048, &mut buffer[..512]), Err(NvmeError::InvalidParameter));
        assert_eq!(ctrl.read_blocks(1, 2047, &mut buffer[..1024]), Err(NvmeError::InvalidParameter));
        assert_eq!(ctrl.read_blocks(1, 0, &mut buffer[4..516]), Err(NvmeError::InvalidParameter));
        assert_eq!(ctrl.read_blocks(7, 0, &mut buffer[..512]), Err(NvmeError::NoMedia));
        assert!(sim.commands().is_empty());

        assert_eq!(ctrl.read_blocks(1, 2047, &mut buffer[..512]), Ok(()));
    }

    #[test]
    fn writes_set_force_unit_access_and_split_at_limit() {
        let sim = SimController::new();
        let mut ctrl = attach(&sim, DriverConfig::default());
        sim.clear_commands();

        let data = AlignedBuffer::with_pattern(300 * 512, |i| (i % 251) as u8);
        ctrl.write_blocks(1, 10, &data).unwrap();

        let writes = sim.io_commands(opcodes::NVM_WRITE);
        let split: Vec<(u64, u32)> = writes.iter().map(|c| (c.lba(), c.blocks())).collect();
        assert_eq!(split, [(10, 256), (266, 44)]);
        assert!(writes.iter().all(|c| c.force_unit_access() && c.queue_id == 1));
        assert_eq!(&sim.namespace_data(1).unwrap()[10 * 512..310 * 512], &data[..]);
    }

    #[test]
    fn failed_chunk_stops_the_request() {
        let sim = SimController::new();
        let mut ctrl = attach(&sim, DriverConfig::default());
        sim.clear_commands();
        sim.fail_next(false, opcodes::NVM_READ, crate::error::CompletionStatus::generic(0x04));

        let mut buffer = AlignedBuffer::zeroed(600 * 512);
        assert!(matches!(ctrl.read_blocks(1, 0, &mut buffer), Err(NvmeError::DeviceError(_))));
        assert_eq!(sim.io_commands(opcodes::NVM_READ).len(), 1);
        assert_eq!(sim.live_mappings(), 0);
    }

    #[test]
    fn async_read_notifies_once_after_all_chunks() {
        let sim = SimController::new();
        sim.write_namespace_data(1, 0, &alloc::vec![0xA5; 600 * 512]);
        let mut ctrl = attach(&sim, DriverConfig::default());
        sim.hold_queue(2);

        let buffer = AlignedBuffer::zeroed(600 * 512).leak();
        let view = buffer.as_ptr();
        let (seen, notifier) = recorder();
        ctrl.read_blocks_async(1, 0, buffer, notifier).unwrap();
        assert!(ctrl.namespace_busy(1));
        assert_eq!(sim.pending_submissions(2), 3);

        ctrl.process_async_tasks();
        assert!(seen.borrow().is_empty());

        sim.release_queue(2);
        ctrl.process_async_tasks();
        assert_eq!(*seen.borrow(), [Ok(())]);
        assert!(!ctrl.namespace_busy(1));
        assert_eq!(ctrl.block_requests_pending(), 0);
        assert_eq!(sim.live_mappings(), 0);

        // SAFETY: the request is complete, nothing else refers to the buffer
        let data = unsafe { core::slice::from_raw_parts(view, 600 * 512) };
        assert!(data.iter().all(|&b| b == 0xA5));
    }

    #[test]
    fn async_backpressure_defers_chunks() {
        let sim = SimController::with_config(SimConfig { mqes: 3, ..Default::default() });
        let mut ctrl = attach(&sim, DriverConfig::default());
        assert_eq!(ctrl.queue(ASYNC_IO_QUEUE_ID).map(|q| q.size()), Some(4));
        sim.hold_queue(2);

        let data: &'static [u8] = AlignedBuffer::with_pattern(6 * 256 * 512, |i| i as u8).leak();
        let (seen, notifier) = recorder();
        ctrl.write_blocks_async(1, 0, data, notifier).unwrap();
        // a ring of 4 holds 3 commands
        assert_eq!(sim.pending_submissions(2), 3);
        assert_eq!(ctrl.async_in_flight(), 3);

        sim.release_queue(2);
        ctrl.process_async_tasks();
        ctrl.process_async_tasks();
        assert_eq!(*seen.borrow(), [Ok(())]);
        assert_eq!(sim.io_commands(opcodes::NVM_WRITE).len(), 6);
        assert_eq!(&sim.namespace_data(1).unwrap()[..data.len()], data);
    }

    #[test]
    fn async_failure_drops_remaining_chunks() {
        let sim = SimController::with_config(SimConfig { mqes: 1, ..Default::default() });
        let mut ctrl = attach(&sim, DriverConfig::default());
        sim.fail_next(false, opcodes::NVM_READ, crate::error::CompletionStatus::generic(0x04));

        let buffer = AlignedBuffer::zeroed(3 * 256 * 512).leak();
        let (seen, notifier) = recorder();
        ctrl.read_blocks_async(1, 0, buffer, notifier).unwrap();
        ctrl.process_async_tasks();
        ctrl.process_async_tasks();

        assert_eq!(seen.borrow().len(), 1);
        assert!(matches!(seen.borrow()[0], Err(NvmeError::DeviceError(_))));
        assert_eq!(sim.io_commands(opcodes::NVM_READ).len(), 1);
        assert!(!ctrl.namespace_busy(1));
    }

    #[test]
    fn sync_read_waits_for_async_work() {
        let sim = SimController::new();
        let mut ctrl = attach(&sim, DriverConfig::default());

        let data: &'static [u8] = AlignedBuffer::with_pattern(512, |_| 0x3C).leak();
        let (seen, notifier) = recorder();
        ctrl.write_blocks_async(1, 5, data, notifier).unwrap();

        let mut buffer = AlignedBuffer::zeroed(512);
        ctrl.read_blocks(1, 5, &mut buffer).unwrap();
        assert_eq!(*seen.borrow(), [Ok(())]);
        assert!(buffer.iter().all(|&b| b == 0x3C));
    }

    #[test]
    fn drain_wait_is_bounded() {
        let sim = SimController::new();
        let mut ctrl = attach(&sim, DriverConfig { command_timeout: 10_000, ..Default::default() });
        sim.hold_queue(2);

        let data: &'static [u8] = AlignedBuffer::zeroed(512).leak();
        let (_seen, notifier) = recorder();
        ctrl.write_blocks_async(1, 0, data, notifier).unwrap();
        assert_eq!(ctrl.flush_blocks(1), Err(NvmeError::Timeout));
    }

    #[test]
    fn shutdown_fails_pending_requests_once() {
        let sim = SimController::new();
        let mut ctrl = attach(&sim, DriverConfig::default());
        sim.hold_queue(2);

        let buffer = AlignedBuffer::zeroed(1024).leak();
        let (seen, notifier) = recorder();
        ctrl.read_blocks_async(1, 0, buffer, notifier).unwrap();
        ctrl.shutdown();
        ctrl.shutdown();
        assert_eq!(*seen.borrow(), [Err(NvmeError::DeviceNotReady)]);
        assert_eq!(sim.live_mappings(), 0);
        assert_eq!(sim.live_allocations(), 0);
    }

    #[test]
    fn flush_reaches_namespace() {
        let sim = SimController::with_config(SimConfig {
            namespaces: alloc::vec![SimNamespace::new(1, 64, 12)],
            ..Default::default()
        });
        let mut ctrl = attach(&sim, DriverConfig::default());
        sim.clear_commands();
        let (seen, notifier) = recorder();
        ctrl.flush_blocks_async(1, notifier).unwrap();
        assert_eq!(*seen.borrow(), [Ok(())]);
        assert_eq!(sim.io_commands(opcodes::NVM_FLUSH).len(), 1);
    }
}
