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

//! Command submission
//!
//! Turns a [`CommandPacket`] into a submission queue entry, maps its buffers
//! for DMA, rings the doorbell and either polls for the completion or
//! records the command for the periodic async tick.

use alloc::boxed::Box;
use bitflags::bitflags;
use log::{debug, error, trace, warn};
use x86_64::{PhysAddr, VirtAddr};

use super::{
    commands::{CdwValid, Command, NvmeCommand, NvmeCompletion},
    controller::{Controller, Platform},
    dma::{DmaDirection, DmaMapping, DmaService},
    error::NvmeError,
    prp::{PrpEntries, PrpList},
    queue::{ASYNC_IO_QUEUE_ID, QueueType, select_queue},
    registers::opcodes,
    wait::{Delay, Poll},
};

/// Namespace id addressing every namespace
pub const BROADCAST_NAMESPACE: u32 = 0xFFFF_FFFF;

bitflags! {
    /// Capabilities advertised through [`PassThruMode`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PassThruAttributes: u32 {
        /// Commands may address the controller itself
        const PHYSICAL = 0x0001;
        /// Commands may address namespaces
        const LOGICAL = 0x0002;
        /// Non-blocking I/O through the async queue
        const NONBLOCKIO = 0x0004;
        /// NVM command set
        const CMD_SET_NVM = 0x0008;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassThruMode {
    pub attributes: PassThruAttributes,
    /// Required alignment of transfer and metadata buffers
    pub io_align: u32,
    /// Contents of the VS register
    pub nvme_version: u32,
}

impl PassThruMode {
    pub fn new(nvme_version: u32) -> Self {
        Self {
            attributes: PassThruAttributes::PHYSICAL
                | PassThruAttributes::LOGICAL
                | PassThruAttributes::NONBLOCKIO
                | PassThruAttributes::CMD_SET_NVM,
            io_align: core::mem::size_of::<usize>() as u32,
            nvme_version,
        }
    }
}

/// Data buffer of a command
#[derive(Debug, Default)]
pub enum TransferBuffer<'a> {
    #[default]
    None,
    /// The device only reads this memory
    Readable(&'a [u8]),
    /// The device may write this memory
    Writable(&'a mut [u8]),
    /// Device memory the caller has already made visible, passed through
    /// as PRP1 without mapping (queue creation)
    Pinned(PhysAddr),
}

impl TransferBuffer<'_> {
    pub fn len(&self) -> usize {
        match self {
            TransferBuffer::Readable(buf) => buf.len(),
            TransferBuffer::Writable(buf) => buf.len(),
            TransferBuffer::None | TransferBuffer::Pinned(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Host address and length of a non-empty host buffer
    fn region(&self) -> Option<(VirtAddr, usize)> {
        let (ptr, len) = match self {
            TransferBuffer::Readable(buf) => (buf.as_ptr(), buf.len()),
            TransferBuffer::Writable(buf) => (buf.as_ptr(), buf.len()),
            TransferBuffer::None | TransferBuffer::Pinned(_) => return None,
        };
        (len != 0).then(|| (VirtAddr::from_ptr(ptr), len))
    }
}

/// A command plus everything needed to execute it
#[derive(Debug)]
pub struct CommandPacket<'a> {
    pub command: Command,
    pub queue_type: QueueType,
    pub transfer: TransferBuffer<'a>,
    pub metadata: TransferBuffer<'a>,
    /// 100 ns units; 0 selects the driver default
    pub timeout: u64,
    /// Completion entry, filled in when the command completes
    pub completion: NvmeCompletion,
}

impl<'a> CommandPacket<'a> {
    pub fn new(command: Command, queue_type: QueueType) -> Self {
        Self {
            command,
            queue_type,
            transfer: TransferBuffer::None,
            metadata: TransferBuffer::None,
            timeout: 0,
            completion: NvmeCompletion::default(),
        }
    }

    pub fn with_transfer(mut self, transfer: TransferBuffer<'a>) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn with_metadata(mut self, metadata: TransferBuffer<'a>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the buffers must be mapped for DMA. Queue creation carries a
    /// caller-pinned address instead.
    fn moves_data(&self) -> bool {
        let creates_queue = self.queue_type == QueueType::Admin
            && matches!(self.command.opcode, opcodes::ADMIN_CREATE_IO_SQ | opcodes::ADMIN_CREATE_IO_CQ);
        self.command.transfers_data() && !creates_queue
    }
}

/// Called once with the completion of a non-blocking command
pub type Notifier = Box<dyn FnOnce(Result<NvmeCompletion, NvmeError>)>;

/// DMA state created for one submission, released exactly once
#[derive(Debug, Default)]
pub(crate) struct CommandResources {
    transfer: Option<DmaMapping>,
    metadata: Option<DmaMapping>,
    prp: Option<PrpList>,
}

impl CommandResources {
    pub(crate) fn release<D: DmaService + ?Sized>(self, dma: &D) {
        if let Some(prp) = self.prp {
            prp.release(dma);
        }
        if let Some(mapping) = self.metadata {
            dma.unmap(mapping);
        }
        if let Some(mapping) = self.transfer {
            dma.unmap(mapping);
        }
    }
}

/// Who learns about an async completion
pub(crate) enum Completion {
    Caller(Notifier),
    /// Subtask of the block request with this id
    Block(u32),
}

/// A command placed on the async queue, waiting for its completion
pub(crate) struct AsyncRequest {
    pub(crate) cid: u16,
    pub(crate) nsid: u32,
    pub(crate) packet: CommandPacket<'static>,
    pub(crate) resources: CommandResources,
    pub(crate) completion: Completion,
}

impl<P: Platform> Controller<P> {
    /// Execute `packet` and wait for it to complete.
    ///
    /// DMA mappings created for the command are released before returning,
    /// whatever the outcome.
    pub fn pass_thru(&mut self, nsid: u32, packet: &mut CommandPacket<'_>) -> Result<(), NvmeError> {
        self.validate(nsid, packet)?;
        let queue_id = select_queue(packet.queue_type, false);

        self.reclaim_abandoned(queue_id, packet.timeout)?;

        let mut resources = CommandResources::default();
        let result = self
            .submit(queue_id, nsid, packet, &mut resources)
            .and_then(|cid| self.wait_for_completion(queue_id, cid, packet));
        resources.release(&self.platform);
        result
    }

    /// Submit an I/O `packet` to the async queue and return once it is
    /// queued; `notifier` runs from [`Controller::process_async_tasks`] when
    /// it completes. Admin packets execute synchronously and notify before
    /// returning.
    pub fn pass_thru_async(
        &mut self,
        nsid: u32,
        mut packet: CommandPacket<'static>,
        notifier: Notifier,
    ) -> Result<(), NvmeError> {
        if packet.queue_type == QueueType::Admin {
            let result = self.pass_thru(nsid, &mut packet);
            notifier(result.map(|()| packet.completion));
            return result;
        }

        self.validate(nsid, &packet)?;
        self.start_async(nsid, packet, Completion::Caller(notifier))
    }

    /// Reject malformed packets before any register write or mapping
    pub(crate) fn validate(&self, nsid: u32, packet: &CommandPacket<'_>) -> Result<(), NvmeError> {
        self.ensure_active()?;

        let attributes = self.mode.attributes;
        if !attributes.intersects(PassThruAttributes::PHYSICAL | PassThruAttributes::LOGICAL) {
            return Err(NvmeError::InvalidParameter);
        }

        let align = self.mode.io_align as u64;
        for buffer in [&packet.transfer, &packet.metadata] {
            if let Some((host, _)) = buffer.region() {
                if align > 1 && host.as_u64() % align != 0 {
                    debug!("Rejecting buffer at {:#x}: not {}-byte aligned", host.as_u64(), align);
                    return Err(NvmeError::InvalidParameter);
                }
            }
        }

        if self.identify.is_some() && nsid != BROADCAST_NAMESPACE && nsid > self.namespace_count() {
            return Err(NvmeError::InvalidParameter);
        }
        if packet.command.nsid != nsid {
            return Err(NvmeError::InvalidParameter);
        }
        if packet.command.psdt != 0 {
            return Err(NvmeError::Unsupported);
        }

        if let Some(max_transfer) = self.max_transfer_size() {
            if packet.transfer.len() > max_transfer as usize {
                warn!(
                    "Transfer of {} bytes exceeds controller limit of {} bytes",
                    packet.transfer.len(),
                    max_transfer
                );
                return Err(NvmeError::BufferTooSmall { max_transfer });
            }
        }

        if packet.moves_data() {
            // the device writes host memory unless opcode bit 0 is set
            let device_writes = !packet.command.is_host_to_device();
            for buffer in [&packet.transfer, &packet.metadata] {
                match buffer {
                    TransferBuffer::Pinned(_) => return Err(NvmeError::InvalidParameter),
                    TransferBuffer::Readable(buf) if device_writes && !buf.is_empty() => {
                        return Err(NvmeError::InvalidParameter);
                    }
                    _ => {}
                }
            }
        } else if matches!(packet.metadata, TransferBuffer::Pinned(_)) {
            return Err(NvmeError::InvalidParameter);
        }

        Ok(())
    }

    /// Build the submission entry, map its buffers and ring the doorbell.
    /// Anything mapped is recorded in `resources`, also on failure.
    fn submit(
        &mut self,
        queue_id: u16,
        nsid: u32,
        packet: &CommandPacket<'_>,
        resources: &mut CommandResources,
    ) -> Result<u16, NvmeError> {
        if self.queues[queue_id as usize].is_full() {
            return Err(NvmeError::NotReady);
        }

        let command = &packet.command;
        let mut sqe = NvmeCommand::new();
        sqe.set_opcode(command.opcode);
        sqe.set_fuse(command.fuse);
        sqe.nsid = nsid;

        if packet.moves_data() {
            let direction = if command.is_host_to_device() {
                DmaDirection::DeviceRead
            } else {
                DmaDirection::DeviceWrite
            };

            if let Some((host, len)) = packet.transfer.region() {
                let mapping = self.platform.map(direction, host, len)?;
                let phys = mapping.phys();
                resources.transfer = Some(mapping);

                let prp = PrpEntries::for_transfer(&self.platform, phys, len)?;
                sqe.prp1 = prp.prp1;
                sqe.prp2 = prp.prp2;
                resources.prp = prp.list;
            }
            if let Some((host, len)) = packet.metadata.region() {
                let mapping = self.platform.map(direction, host, len)?;
                sqe.mptr = mapping.phys().as_u64();
                resources.metadata = Some(mapping);
            }
        } else if let TransferBuffer::Pinned(phys) = packet.transfer {
            sqe.prp1 = phys.as_u64();
        }

        let valid = command.valid;
        let dwords = [
            (CdwValid::CDW2, &mut sqe.cdw2, command.cdw2),
            (CdwValid::CDW3, &mut sqe.cdw3, command.cdw3),
            (CdwValid::CDW10, &mut sqe.cdw10, command.cdw10),
            (CdwValid::CDW11, &mut sqe.cdw11, command.cdw11),
            (CdwValid::CDW12, &mut sqe.cdw12, command.cdw12),
            (CdwValid::CDW13, &mut sqe.cdw13, command.cdw13),
            (CdwValid::CDW14, &mut sqe.cdw14, command.cdw14),
            (CdwValid::CDW15, &mut sqe.cdw15, command.cdw15),
        ];
        for (flag, slot, value) in dwords {
            if valid.contains(flag) {
                *slot = value;
            }
        }

        let queue = &mut self.queues[queue_id as usize];
        let cid = queue.allocate_command_id();
        sqe.set_command_id(cid);
        let tail = queue.push(&sqe)?;
        self.ring_sq(queue_id, tail)?;

        trace!(
            "Submitted opcode {:#04x} cid {} nsid {} on queue {} (tail {})",
            command.opcode,
            cid,
            nsid,
            queue_id,
            tail
        );
        Ok(cid)
    }

    /// Poll the completion queue of a synchronous queue
    fn wait_for_completion(
        &mut self,
        queue_id: u16,
        cid: u16,
        packet: &mut CommandPacket<'_>,
    ) -> Result<(), NvmeError> {
        let timeout = self.config.timeout_or_default(packet.timeout);
        let Some(completion) = self.reap_completion(queue_id, cid, timeout)? else {
            error!(
                "NVMe command {:#04x} (cid {}) on queue {} timed out",
                packet.command.opcode, cid, queue_id
            );
            self.queues[queue_id as usize].set_abandoned(Some(cid));
            return Err(NvmeError::Timeout);
        };

        packet.completion = completion;
        let status = completion.status();
        if !status.is_success() {
            error!(
                "NVMe command {:#04x} (cid {}) failed: {}",
                packet.command.opcode, cid, status
            );
            return Err(NvmeError::DeviceError(status));
        }
        Ok(())
    }

    /// Consume completions on `queue_id` until the one for `cid` shows up.
    /// Completions for other commands are dropped. `None` once `timeout`
    /// (100 ns units) runs out.
    fn reap_completion(
        &mut self,
        queue_id: u16,
        cid: u16,
        timeout: u64,
    ) -> Result<Option<NvmeCompletion>, NvmeError> {
        let poll = Poll::command(timeout);
        for remaining in (0..=poll.iterations).rev() {
            while let Some(completion) = self.queues[queue_id as usize].pop_completion() {
                let head = self.queues[queue_id as usize].cq_head();
                self.ring_cq(queue_id, head)?;
                if completion.cid == cid {
                    return Ok(Some(completion));
                }
                warn!(
                    "Dropping completion for cid {} on queue {} while waiting for cid {}",
                    completion.cid, queue_id, cid
                );
            }
            if remaining > 0 {
                self.platform.stall_ns(poll.interval_ns);
            }
        }
        Ok(None)
    }

    /// A one-deep queue whose last command timed out cannot take another
    /// until that command's completion has been consumed
    fn reclaim_abandoned(&mut self, queue_id: u16, timeout: u64) -> Result<(), NvmeError> {
        let Some(stale) = self.queues[queue_id as usize].abandoned() else {
            return Ok(());
        };

        let timeout = self.config.timeout_or_default(timeout);
        match self.reap_completion(queue_id, stale, timeout)? {
            Some(completion) => {
                debug!(
                    "Reclaimed cid {} on queue {} (status {})",
                    stale,
                    queue_id,
                    completion.status()
                );
                self.queues[queue_id as usize].set_abandoned(None);
                Ok(())
            }
            None => {
                error!("NVMe queue {} still busy with timed out cid {}", queue_id, stale);
                Err(NvmeError::Timeout)
            }
        }
    }

    /// Place a validated packet on the async queue
    pub(crate) fn start_async(
        &mut self,
        nsid: u32,
        packet: CommandPacket<'static>,
        completion: Completion,
    ) -> Result<(), NvmeError> {
        let mut resources = CommandResources::default();
        match self.submit(ASYNC_IO_QUEUE_ID, nsid, &packet, &mut resources) {
            Ok(cid) => {
                self.async_pending.push(AsyncRequest { cid, nsid, packet, resources, completion });
                Ok(())
            }
            Err(err) => {
                resources.release(&self.platform);
                Err(err)
            }
        }
    }

    /// Body of the periodic async timer: queue waiting block I/O chunks,
    /// then reap completions from the async queue and notify their owners.
    pub fn process_async_tasks(&mut self) {
        if !self.is_active() {
            return;
        }
        self.submit_subtasks();

        let mut consumed = false;
        while let Some(completion) = self.queues[ASYNC_IO_QUEUE_ID as usize].pop_completion() {
            consumed = true;
            let Some(pos) = self.async_pending.iter().position(|r| r.cid == completion.cid) else {
                warn!("Async completion for unknown cid {}", completion.cid);
                continue;
            };
            let AsyncRequest { packet, resources, completion: owner, .. } = self.async_pending.remove(pos);
            resources.release(&self.platform);

            let status = completion.status();
            let result = if status.is_success() {
                Ok(completion)
            } else {
                warn!("Async command {:#04x} (cid {}) failed: {}", packet.command.opcode, completion.cid, status);
                Err(NvmeError::DeviceError(status))
            };

            match owner {
                Completion::Caller(notify) => notify(result),
                Completion::Block(request) => self.finish_subtask(request, result.map(|_| ())),
            }
        }

        if consumed {
            let head = self.queues[ASYNC_IO_QUEUE_ID as usize].cq_head();
            if let Err(err) = self.ring_cq(ASYNC_IO_QUEUE_ID, head) {
                warn!("Async completion doorbell write failed: {}", err);
            }
        }
    }

    /// Drop every in-flight async command, notifying each owner with `err`
    pub(crate) fn abort_async_requests(&mut self, err: NvmeError) {
        for request in core::mem::take(&mut self.async_pending) {
            request.resources.release(&self.platform);
            if let Completion::Caller(notify) = request.completion {
                notify(Err(err));
            }
        }
        self.fail_block_requests(err);
    }

    /// Async commands submitted and not yet completed
    pub fn async_in_flight(&self) -> usize {
        self.async_pending.len()
    }
}
