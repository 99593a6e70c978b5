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

//! NVMe controller management
//!
//! Bring-up and teardown of one controller: the CC.EN/CSTS.RDY handshake,
//! admin queue programming, Identify Controller and I/O queue creation.
//! Command submission lives in `passthru`, namespaces in `namespace`.

use alloc::{boxed::Box, collections::VecDeque, vec::Vec};
use log::{debug, error, info, warn};

use super::{
    block::{BlockRequest, Subtask},
    commands::{Command, IdentifyController, as_bytes_mut, zeroed_box},
    config::{DriverConfig, MAX_NAMESPACES},
    dma::{DmaPages, DmaService, PAGE_SIZE},
    error::NvmeError,
    mmio::RegisterAccess,
    namespace::Namespace,
    passthru::{AsyncRequest, CommandPacket, PassThruMode, TransferBuffer},
    queue::{
        ADMIN_QUEUE_ID, ASYNC_IO_QUEUE_ID, Indexing, QUEUE_COUNT, QueuePair, QueueType, SYNC_IO_QUEUE_ID,
        SYNC_QUEUE_ENTRIES,
    },
    registers::{Capabilities, Registers, admin_queue_attributes, cc_bits, enable_configuration},
    wait::{Delay, Poll},
};

/// Everything the driver needs from the platform
pub trait Platform: RegisterAccess + DmaService + Delay {}

impl<T: RegisterAccess + DmaService + Delay + ?Sized> Platform for T {}

/// Scratch pages, in order: admin SQ, admin CQ, sync I/O SQ, sync I/O CQ,
/// async I/O SQ, async I/O CQ
pub const SCRATCH_PAGES: usize = 2 * QUEUE_COUNT;

/// One NVMe controller and the queues, identify data and namespaces that
/// belong to it
pub struct Controller<P: Platform> {
    pub(crate) platform: P,
    pub(crate) base: u64,
    pub(crate) config: DriverConfig,
    pub(crate) cap: Capabilities,
    pub(crate) mode: PassThruMode,
    pub(crate) scratch: Option<DmaPages>,
    pub(crate) queues: [QueuePair; QUEUE_COUNT],
    pub(crate) identify: Option<Box<IdentifyController>>,
    pub(crate) namespaces: heapless::Vec<Namespace, MAX_NAMESPACES>,
    /// Commands on the async queue awaiting completion
    pub(crate) async_pending: Vec<AsyncRequest>,
    /// Async block I/O chunks not yet placed on the queue
    pub(crate) unsubmitted: VecDeque<Subtask>,
    pub(crate) block_requests: Vec<BlockRequest>,
    pub(crate) next_request_id: u32,
}

impl<P: Platform> Controller<P> {
    /// Bring up the controller whose registers live at `base`
    pub fn new(platform: P, base: u64, config: DriverConfig) -> Result<Self, NvmeError> {
        if base == 0 {
            return Err(NvmeError::InvalidParameter);
        }

        let registers = Registers::new(&platform, base);
        let cap = registers.cap()?;
        if !cap.supports_nvm_command_set() {
            error!("NVMe controller at {:#x} does not support the NVM command set", base);
            return Err(NvmeError::UnsupportedCommandSet);
        }
        if cap.min_page_size() > PAGE_SIZE as u64 {
            error!("NVMe minimum page size {} exceeds platform page size", cap.min_page_size());
            return Err(NvmeError::Unsupported);
        }
        let version = registers.version()?;

        debug!("NVMe Controller Capabilities:");
        debug!("  Max Queue Entries: {}", cap.max_queue_entries());
        debug!("  Doorbell Stride: {} bytes", cap.doorbell_stride());
        debug!("  Min Page Size: {} bytes", cap.min_page_size());
        debug!("  Timeout: {} ms", cap.timeout() as u32 * 500);

        let mut scratch = platform.allocate(SCRATCH_PAGES)?;
        scratch.zero();
        let queues = match scratch_queues(&scratch, config.async_queue_entries(cap)) {
            Ok(queues) => queues,
            Err(err) => {
                platform.free(scratch);
                return Err(err);
            }
        };

        let mut controller = Self {
            platform,
            base,
            config,
            cap,
            mode: PassThruMode::new(version),
            scratch: Some(scratch),
            queues,
            identify: None,
            namespaces: heapless::Vec::new(),
            async_pending: Vec::new(),
            unsubmitted: VecDeque::new(),
            block_requests: Vec::new(),
            next_request_id: 0,
        };

        // on failure, Drop tears down what was set up
        controller.init()?;
        Ok(controller)
    }

    /// Reset the controller and rebuild its queues from scratch.
    ///
    /// Async work still outstanding is aborted with `DeviceNotReady` and the
    /// namespace table is emptied; rediscover namespaces afterwards.
    pub fn init(&mut self) -> Result<(), NvmeError> {
        self.ensure_active()?;
        info!("Initializing NVMe controller at {:#x}", self.base);

        self.disable()?;
        if self.async_in_flight() > 0 || self.block_requests_pending() > 0 {
            warn!("Aborting outstanding async NVMe requests for controller reset");
        }
        self.abort_async_requests(NvmeError::DeviceNotReady);
        self.namespaces.clear();

        for queue in &mut self.queues {
            queue.reset();
            queue.zero();
        }

        self.setup_admin_queue()?;
        self.enable()?;
        self.identify_controller()?;
        self.create_io_queues()?;

        info!("NVMe controller initialization complete");
        Ok(())
    }

    pub(crate) fn registers(&self) -> Registers<'_, P> {
        Registers::new(&self.platform, self.base)
    }

    /// Clear CC.EN and wait for CSTS.RDY to drop
    pub fn disable(&self) -> Result<(), NvmeError> {
        let registers = self.registers();
        let cc = registers.cc()?;
        registers.set_cc(cc & !cc_bits::EN)?;

        let poll = Poll::controller_ready(self.cap.timeout());
        if !poll.until(&self.platform, || Ok(!registers.is_ready()?))? {
            error!("NVMe controller did not clear RDY after {} ms", poll.iterations);
            return Err(NvmeError::DeviceBusyTimeout);
        }

        debug!("Controller disabled");
        Ok(())
    }

    /// Write a fresh CC with EN set and wait for CSTS.RDY
    pub fn enable(&self) -> Result<(), NvmeError> {
        info!("Enabling NVMe controller");
        let registers = self.registers();
        registers.set_cc(enable_configuration())?;

        let poll = Poll::controller_ready(self.cap.timeout());
        let ready = poll.until(&self.platform, || {
            if registers.is_fatal()? {
                error!("NVMe controller reported fatal status during enable");
                return Err(NvmeError::EnableTimeout);
            }
            registers.is_ready()
        })?;
        if !ready {
            error!("NVMe controller did not become ready after {} ms", poll.iterations);
            return Err(NvmeError::EnableTimeout);
        }

        info!("Controller enabled and ready");
        Ok(())
    }

    fn setup_admin_queue(&self) -> Result<(), NvmeError> {
        let admin = &self.queues[ADMIN_QUEUE_ID as usize];
        let registers = self.registers();
        registers.set_aqa(admin_queue_attributes(admin.size(), admin.size()))?;
        registers.set_asq(admin.sq_phys())?;
        registers.set_acq(admin.cq_phys())?;

        info!(
            "Admin queues configured: SQ={:#x}, CQ={:#x}",
            admin.sq_phys().as_u64(),
            admin.cq_phys().as_u64()
        );
        Ok(())
    }

    /// Identify the controller; the buffer is allocated on first use and
    /// kept for the controller's lifetime
    fn identify_controller(&mut self) -> Result<(), NvmeError> {
        info!("Identifying NVMe controller");

        let mut data = self.identify.take().unwrap_or_else(zeroed_box::<IdentifyController>);
        let result = {
            let mut packet = CommandPacket::new(Command::identify_controller(), QueueType::Admin)
                .with_transfer(TransferBuffer::Writable(as_bytes_mut(&mut *data)));
            self.pass_thru(0, &mut packet)
        };
        self.identify = Some(data);

        if let Err(err) = result {
            error!("Identify Controller failed: {}", err);
            return Err(NvmeError::IdentifyFailed);
        }

        if let Some(identify_data) = self.identify.as_deref() {
            info!("Controller Information:");
            info!("  Model: {}", identify_data.model_number());
            info!("  Serial: {}", identify_data.serial_number());
            info!("  Firmware: {}", identify_data.firmware_revision());
            info!("  Version: {:#x}", self.mode.nvme_version);
            info!("  Namespaces: {}", identify_data.nn);
            debug!("  MDTS: {}", identify_data.mdts);
        }
        Ok(())
    }

    /// Create I/O completion queues 1 and 2, then their submission queues
    fn create_io_queues(&mut self) -> Result<(), NvmeError> {
        info!("Creating I/O queues");

        for qid in [SYNC_IO_QUEUE_ID, ASYNC_IO_QUEUE_ID] {
            let queue = &self.queues[qid as usize];
            let command = Command::create_io_cq(qid, queue.size());
            let pinned = TransferBuffer::Pinned(queue.cq_phys());
            self.pass_thru(0, &mut CommandPacket::new(command, QueueType::Admin).with_transfer(pinned))?;
        }
        for qid in [SYNC_IO_QUEUE_ID, ASYNC_IO_QUEUE_ID] {
            let queue = &self.queues[qid as usize];
            let command = Command::create_io_sq(qid, qid, queue.size());
            let pinned = TransferBuffer::Pinned(queue.sq_phys());
            self.pass_thru(0, &mut CommandPacket::new(command, QueueType::Admin).with_transfer(pinned))?;
        }

        debug!(
            "I/O queues created: sync depth {}, async depth {}",
            self.queues[SYNC_IO_QUEUE_ID as usize].size(),
            self.queues[ASYNC_IO_QUEUE_ID as usize].size()
        );
        Ok(())
    }

    /// Abort outstanding work, disable the controller and release its DMA
    /// memory. Safe to call more than once.
    pub fn shutdown(&mut self) {
        let Some(scratch) = self.scratch.take() else {
            return;
        };
        info!("Shutting down NVMe controller at {:#x}", self.base);

        if let Err(err) = self.disable() {
            warn!("NVMe controller disable during shutdown failed: {}", err);
        }
        self.abort_async_requests(NvmeError::DeviceNotReady);
        self.namespaces.clear();
        self.identify = None;
        self.platform.free(scratch);
    }

    pub fn is_active(&self) -> bool {
        self.scratch.is_some()
    }

    pub(crate) fn ensure_active(&self) -> Result<(), NvmeError> {
        if self.is_active() { Ok(()) } else { Err(NvmeError::DeviceNotReady) }
    }

    pub(crate) fn ring_sq(&self, queue_id: u16, tail: u16) -> Result<(), NvmeError> {
        self.registers().ring_sq_tail(queue_id, self.cap.doorbell_stride(), tail)
    }

    pub(crate) fn ring_cq(&self, queue_id: u16, head: u16) -> Result<(), NvmeError> {
        self.registers().ring_cq_head(queue_id, self.cap.doorbell_stride(), head)
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn capabilities(&self) -> Capabilities {
        self.cap
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn mode(&self) -> &PassThruMode {
        &self.mode
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn identify_data(&self) -> Option<&IdentifyController> {
        self.identify.as_deref()
    }

    /// Identify Controller NN, 0 before identify data is available
    pub fn namespace_count(&self) -> u32 {
        self.identify.as_ref().map_or(0, |data| data.nn)
    }

    /// Largest transfer in bytes a single command may move, `None` when
    /// the controller reports no limit (MDTS = 0)
    pub fn max_transfer_size(&self) -> Option<u32> {
        let mdts = self.identify.as_ref()?.mdts;
        if mdts == 0 {
            return None;
        }
        let bytes = 1u64
            .checked_shl(mdts as u32)
            .and_then(|pages| pages.checked_mul(self.cap.min_page_size()))
            .unwrap_or(u64::MAX);
        Some(core::cmp::min(bytes, u32::MAX as u64) as u32)
    }

    pub fn queue(&self, queue_id: u16) -> Option<&QueuePair> {
        self.queues.get(queue_id as usize)
    }
}

impl<P: Platform> Drop for Controller<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Slice the scratch region into the three queue pairs
fn scratch_queues(scratch: &DmaPages, async_entries: u16) -> Result<[QueuePair; QUEUE_COUNT], NvmeError> {
    let page = |index: usize| -> Result<_, NvmeError> {
        let host = scratch.page_host(index).ok_or(NvmeError::OutOfResources)?;
        let phys = scratch.page_phys(index).ok_or(NvmeError::OutOfResources)?;
        Ok((host, phys))
    };
    let pair = |id: u16, size: u16, indexing: Indexing| -> Result<QueuePair, NvmeError> {
        let (sq, sq_phys) = page(2 * id as usize)?;
        let (cq, cq_phys) = page(2 * id as usize + 1)?;
        // SAFETY: each ring gets its own scratch page, which outlives the
        // queues (freed only in shutdown, after which they are unused)
        Ok(unsafe { QueuePair::new(id, size, indexing, sq, sq_phys, cq, cq_phys) })
    };

    Ok([
        pair(ADMIN_QUEUE_ID, SYNC_QUEUE_ENTRIES, Indexing::Toggle)?,
        pair(SYNC_IO_QUEUE_ID, SYNC_QUEUE_ENTRIES, Indexing::Toggle)?,
        pair(ASYNC_IO_QUEUE_ID, async_entries, Indexing::Ring)?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dma::{DmaDirection, DmaMapping},
        mmio::{MockRegisterAccess, Width},
        registers::{csts_bits, offsets},
        sim::{SimConfig, SimController},
    };
    use x86_64::VirtAddr;

    #[test]
    fn bring_up_programs_admin_queue_and_creates_io_queues() {
        let sim = SimController::new();
        let controller = Controller::new(sim.clone(), 0xFEB0_0000, DriverConfig::default()).unwrap();
        assert!(sim.is_enabled());

        let admin: Vec<u8> = sim.commands().iter().filter(|c| c.queue_id == 0).map(|c| c.opcode).collect();
        // identify, CQ 1, CQ 2, SQ 1, SQ 2
        assert_eq!(admin, [0x06, 0x05, 0x05, 0x01, 0x01]);
        assert_eq!(controller.queue(ASYNC_IO_QUEUE_ID).map(QueuePair::size), Some(64));
        assert_eq!(controller.mode().nvme_version, 0x0001_0400);
        assert_eq!(controller.identify_data().map(|d| d.serial_number()), Some("NVMESIM0001"));
        assert_eq!(controller.max_transfer_size(), Some(32 * 4096));
        assert_eq!(sim.live_allocations(), 1);
        assert_eq!(sim.live_mappings(), 0);
    }

    #[test]
    fn missing_nvm_command_set_is_rejected_before_any_write() {
        let mut mmio = MockRegisterAccess::new();
        mmio.expect_read()
            .withf(|_, offset, width| *offset == offsets::CAP && *width == Width::Qword)
            .returning(|_, _, _| Ok(0x3FF));
        mmio.expect_write().never();

        struct Board(MockRegisterAccess);
        impl RegisterAccess for Board {
            fn read(&self, base: u64, offset: u32, width: Width) -> Result<u64, NvmeError> {
                self.0.read(base, offset, width)
            }
            fn write(&self, base: u64, offset: u32, width: Width, value: u64) -> Result<(), NvmeError> {
                self.0.write(base, offset, width, value)
            }
        }
        impl DmaService for Board {
            fn allocate(&self, _: usize) -> Result<DmaPages, NvmeError> {
                panic!("no allocation expected")
            }
            fn free(&self, _: DmaPages) {}
            fn map(&self, _: DmaDirection, _: VirtAddr, _: usize) -> Result<DmaMapping, NvmeError> {
                panic!("no mapping expected")
            }
            fn unmap(&self, _: DmaMapping) {}
        }
        impl Delay for Board {
            fn stall_ns(&self, _: u64) {}
        }

        let result = Controller::new(Board(mmio), 0xFEB0_0000, DriverConfig::default());
        assert_eq!(result.err(), Some(NvmeError::UnsupportedCommandSet));
    }

    #[test]
    fn enable_times_out_when_ready_never_sets() {
        let sim = SimController::new();
        sim.set_never_ready(true);
        let result = Controller::new(sim.clone(), 0xFEB0_0000, DriverConfig::default());
        assert_eq!(result.err(), Some(NvmeError::EnableTimeout));
        // CAP.TO = 20 -> 10,000 polls of 1 ms
        assert_eq!(sim.elapsed_ns(), 10_000 * 1_000_000);
        assert_eq!(sim.live_allocations(), 0);
    }

    #[test]
    fn fatal_status_fails_enable_without_waiting() {
        let sim = SimController::new();
        sim.set_never_ready(true);
        sim.set_fatal(true);
        let result = Controller::new(sim.clone(), 0xFEB0_0000, DriverConfig::default());
        assert_eq!(result.err(), Some(NvmeError::EnableTimeout));
        assert_eq!(sim.elapsed_ns(), 0);
        assert_eq!(sim.live_allocations(), 0);
    }

    #[test]
    fn disable_times_out_when_ready_sticks() {
        let sim = SimController::with_config(SimConfig { timeout: 1, ..Default::default() });
        sim.set_stuck_ready(true);
        let result = Controller::new(sim.clone(), 0xFEB0_0000, DriverConfig::default());
        assert_eq!(result.err(), Some(NvmeError::DeviceBusyTimeout));
        assert_eq!(sim.live_allocations(), 0);
        assert_eq!(sim.read(1, offsets::CSTS, Width::Dword).unwrap() as u32 & csts_bits::RDY, 1);
    }

    #[test]
    fn identify_failure_aborts_bring_up() {
        let sim = SimController::new();
        sim.fail_next(true, 0x06, crate::error::CompletionStatus::generic(0x06));
        let result = Controller::new(sim.clone(), 0xFEB0_0000, DriverConfig::default());
        assert_eq!(result.err(), Some(NvmeError::IdentifyFailed));
        assert_eq!(sim.live_mappings(), 0);
        assert_eq!(sim.live_allocations(), 0);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let sim = SimController::new();
        let mut controller = Controller::new(sim.clone(), 0xFEB0_0000, DriverConfig::default()).unwrap();
        controller.shutdown();
        assert!(!sim.is_enabled());
        assert_eq!(sim.live_allocations(), 0);
        controller.shutdown();
        assert!(!controller.is_active());
        assert_eq!(sim.unmatched_releases(), 0);
        assert_eq!(controller.init(), Err(NvmeError::DeviceNotReady));
    }

    #[test]
    fn zero_base_is_invalid() {
        let result = Controller::new(SimController::new(), 0, DriverConfig::default());
        assert_eq!(result.err(), Some(NvmeError::InvalidParameter));
    }
}
