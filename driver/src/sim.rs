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

//! Software NVMe controller
//!
//! A register-level model of an NVMe controller with in-memory namespaces.
//! It implements every platform collaborator the driver needs (register
//! access, DMA, delay), processes submission queues when their tail doorbell
//! is written and posts phase-tagged completions, walking PRP lists through
//! its own device address space. Device addresses it hands out never equal
//! the host addresses behind them.
//!
//! Handles are cheap clones of shared state, so a test can keep one to turn
//! knobs and inspect counters while the driver owns another.

use alloc::{
    alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error},
    collections::BTreeMap,
    sync::Arc,
    vec,
    vec::Vec,
};
use core::{
    ops::{Deref, DerefMut},
    ptr::NonNull,
};
use log::trace;
use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

use super::{
    commands::{IdentifyController, IdentifyNamespace, NvmeCommand, NvmeCompletion, as_bytes, zeroed_box},
    dma::{DmaDirection, DmaMapping, DmaPages, DmaService, MappingHandle, PAGE_SIZE},
    error::{CompletionStatus, NvmeError, generic_status, status_type},
    mmio::{RegisterAccess, Width},
    registers::{aqa_bits, cap_bits, cc_bits, csts_bits, identify_cns, offsets, opcodes},
    wait::Delay,
};

const PAGE: u64 = PAGE_SIZE as u64;
const PAGE_MASK: u64 = PAGE - 1;
/// First device address handed out; far away from any host heap address
const DEVICE_ADDRESS_BASE: u64 = 0x0002_0000_0000;

/// One namespace backed by host memory
#[derive(Debug, Clone)]
pub struct SimNamespace {
    pub nsid: u32,
    /// Block size exponent (9 = 512 bytes)
    pub lbads: u8,
    pub blocks: u64,
    /// Reported capacity in blocks; zero marks an inactive namespace
    pub capacity: u64,
    pub eui64: u64,
    /// LBA format slot selected through FLBAS; other slots hold a decoy
    pub format_index: u8,
    data: Vec<u8>,
}

impl SimNamespace {
    pub fn new(nsid: u32, blocks: u64, lbads: u8) -> Self {
        Self {
            nsid,
            lbads,
            blocks,
            capacity: blocks,
            eui64: 0x0025_3845_0000_0000 | nsid as u64,
            format_index: 0,
            data: vec![0; (blocks << lbads) as usize],
        }
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_format_index(mut self, index: u8) -> Self {
        self.format_index = index & 0xF;
        self
    }

    pub fn block_size(&self) -> usize {
        1 << self.lbads
    }
}

/// Static description of the modelled controller
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// CAP.MQES, 0-based
    pub mqes: u16,
    /// CAP.TO in 500 ms units
    pub timeout: u8,
    /// CAP.DSTRD
    pub doorbell_stride: u8,
    pub mpsmin: u8,
    pub nvm_command_set: bool,
    pub mdts: u8,
    pub version: u32,
    /// Identify Controller NN; defaults to the highest namespace id
    pub namespace_count: Option<u32>,
    pub namespaces: Vec<SimNamespace>,
    pub serial: &'static str,
    pub model: &'static str,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            mqes: 1023,
            timeout: 20,
            doorbell_stride: 0,
            mpsmin: 0,
            nvm_command_set: true,
            mdts: 5,
            version: 0x0001_0400,
            namespace_count: None,
            namespaces: vec![SimNamespace::new(1, 2048, 9)],
            serial: "NVMESIM0001",
            model: "nvmeboot software controller",
        }
    }
}

/// Command as seen by the device, for assertions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggedCommand {
    pub queue_id: u16,
    pub opcode: u8,
    pub cid: u16,
    pub nsid: u32,
    pub prp1: u64,
    pub prp2: u64,
    pub mptr: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
}

impl LoggedCommand {
    /// Block count of a read/write (NLB + 1)
    pub fn blocks(&self) -> u32 {
        (self.cdw12 & 0xFFFF) + 1
    }

    pub fn lba(&self) -> u64 {
        (self.cdw11 as u64) << 32 | self.cdw10 as u64
    }

    pub fn force_unit_access(&self) -> bool {
        self.cdw12 & (1 << 30) != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionKind {
    Allocation { pages: usize },
    Mapping,
}

#[derive(Debug, Clone, Copy)]
struct Region {
    phys: u64,
    host: usize,
    len: usize,
    handle: u64,
    kind: RegionKind,
}

#[derive(Debug, Clone, Copy)]
struct SimSq {
    phys: u64,
    size: u16,
    head: u16,
    tail: u16,
    cqid: u16,
}

#[derive(Debug, Clone, Copy)]
struct SimCq {
    phys: u64,
    size: u16,
    head: u16,
    tail: u16,
    phase: bool,
}

struct State {
    config: SimConfig,
    cc: u32,
    csts: u32,
    aqa: u32,
    asq: u64,
    acq: u64,
    intms: u32,
    sqs: BTreeMap<u16, SimSq>,
    cqs: BTreeMap<u16, SimCq>,
    regions: Vec<Region>,
    next_phys: u64,
    next_handle: u64,
    maps_created: usize,
    unmatched_releases: usize,
    held: Vec<u16>,
    never_ready: bool,
    stuck_ready: bool,
    fail_allocations: bool,
    /// Successful maps left before every further map fails
    maps_until_failure: Option<usize>,
    injected: Vec<(bool, u8, CompletionStatus)>,
    log: Vec<LoggedCommand>,
    security_response: Vec<u8>,
    security_sent: Vec<u8>,
    elapsed_ns: u64,
}

/// Cloneable handle to one software controller
#[derive(Clone)]
pub struct SimController {
    state: Arc<Mutex<State>>,
}

impl Default for SimController {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for SimController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimController")
            .field("cc", &state.cc)
            .field("csts", &state.csts)
            .field("regions", &state.regions.len())
            .finish()
    }
}

impl SimController {
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    pub fn with_config(config: SimConfig) -> Self {
        let state = State {
            config,
            cc: 0,
            csts: 0,
            aqa: 0,
            asq: 0,
            acq: 0,
            intms: 0,
            sqs: BTreeMap::new(),
            cqs: BTreeMap::new(),
            regions: Vec::new(),
            next_phys: DEVICE_ADDRESS_BASE,
            next_handle: 1,
            maps_created: 0,
            unmatched_releases: 0,
            held: Vec::new(),
            never_ready: false,
            stuck_ready: false,
            fail_allocations: false,
            maps_until_failure: None,
            injected: Vec::new(),
            log: Vec::new(),
            security_response: Vec::new(),
            security_sent: Vec::new(),
            elapsed_ns: 0,
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    /// Stop consuming submissions on `queue_id` until released
    pub fn hold_queue(&self, queue_id: u16) {
        let mut state = self.state.lock();
        if !state.held.contains(&queue_id) {
            state.held.push(queue_id);
        }
    }

    /// Resume a held queue and process what was submitted meanwhile
    pub fn release_queue(&self, queue_id: u16) {
        let mut state = self.state.lock();
        state.held.retain(|&q| q != queue_id);
        state.process_sq(queue_id);
    }

    /// Submissions waiting on a held queue
    pub fn pending_submissions(&self, queue_id: u16) -> u16 {
        let state = self.state.lock();
        state.sqs.get(&queue_id).map_or(0, |sq| (sq.tail + sq.size - sq.head) % sq.size)
    }

    /// CSTS.RDY never sets after enable
    pub fn set_never_ready(&self, never_ready: bool) {
        self.state.lock().never_ready = never_ready;
    }

    /// CSTS.RDY stays set, so a disable never completes
    pub fn set_stuck_ready(&self, stuck: bool) {
        let mut state = self.state.lock();
        state.stuck_ready = stuck;
        if stuck {
            state.csts |= csts_bits::RDY;
        }
    }

    /// Raise or clear CSTS.CFS
    pub fn set_fatal(&self, fatal: bool) {
        let mut state = self.state.lock();
        if fatal {
            state.csts |= csts_bits::CFS;
        } else {
            state.csts &= !csts_bits::CFS;
        }
    }

    pub fn fail_allocations(&self, fail: bool) {
        self.state.lock().fail_allocations = fail;
    }

    pub fn fail_maps(&self, fail: bool) {
        self.state.lock().maps_until_failure = fail.then_some(0);
    }

    /// Let `count` more maps succeed, then fail every map after them
    pub fn fail_maps_after(&self, count: usize) {
        self.state.lock().maps_until_failure = Some(count);
    }

    /// Complete the next admin (`admin`) or I/O command with `opcode` with
    /// `status` instead of executing it
    pub fn fail_next(&self, admin: bool, opcode: u8, status: CompletionStatus) {
        self.state.lock().injected.push((admin, opcode, status));
    }

    /// Caller buffers currently mapped
    pub fn live_mappings(&self) -> usize {
        self.count_regions(|kind| kind == RegionKind::Mapping)
    }

    /// Common-buffer allocations currently outstanding
    pub fn live_allocations(&self) -> usize {
        self.count_regions(|kind| matches!(kind, RegionKind::Allocation { .. }))
    }

    fn count_regions(&self, pred: impl Fn(RegionKind) -> bool) -> usize {
        self.state.lock().regions.iter().filter(|r| pred(r.kind)).count()
    }

    /// Mappings created since start or the last `clear_commands`
    pub fn maps_created(&self) -> usize {
        self.state.lock().maps_created
    }

    /// Unmap/free calls for handles that were not live
    pub fn unmatched_releases(&self) -> usize {
        self.state.lock().unmatched_releases
    }

    pub fn commands(&self) -> Vec<LoggedCommand> {
        self.state.lock().log.clone()
    }

    pub fn clear_commands(&self) {
        let mut state = self.state.lock();
        state.log.clear();
        state.maps_created = 0;
    }

    /// I/O commands with `opcode`, in submission order
    pub fn io_commands(&self, opcode: u8) -> Vec<LoggedCommand> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|c| c.queue_id != 0 && c.opcode == opcode)
            .copied()
            .collect()
    }

    pub fn namespace_data(&self, nsid: u32) -> Option<Vec<u8>> {
        let state = self.state.lock();
        state.config.namespaces.iter().find(|ns| ns.nsid == nsid).map(|ns| ns.data.clone())
    }

    pub fn write_namespace_data(&self, nsid: u32, offset: usize, bytes: &[u8]) {
        let mut state = self.state.lock();
        if let Some(ns) = state.config.namespaces.iter_mut().find(|ns| ns.nsid == nsid) {
            ns.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
    }

    pub fn set_security_response(&self, bytes: &[u8]) {
        self.state.lock().security_response = bytes.to_vec();
    }

    /// Payload of the last Security Send
    pub fn security_sent(&self) -> Vec<u8> {
        self.state.lock().security_sent.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().cc & cc_bits::EN != 0
    }

    /// Time spent in [`Delay::stall_ns`]
    pub fn elapsed_ns(&self) -> u64 {
        self.state.lock().elapsed_ns
    }
}

impl State {
    fn cap(&self) -> u64 {
        let c = &self.config;
        let mut cap = c.mqes as u64
            | 1u64 << cap_bits::CQR_SHIFT
            | (c.timeout as u64) << cap_bits::TO_SHIFT
            | ((c.doorbell_stride & 0xF) as u64) << cap_bits::DSTRD_SHIFT
            | ((c.mpsmin & 0xF) as u64) << cap_bits::MPSMIN_SHIFT
            | 4u64 << cap_bits::MPSMAX_SHIFT;
        if c.nvm_command_set {
            cap |= cap_bits::CSS_NVM;
        }
        cap
    }

    fn register(&self, offset: u32) -> u64 {
        match offset {
            offsets::CAP => self.cap(),
            0x04 => self.cap() >> 32,
            offsets::VS => self.config.version as u64,
            offsets::INTMS | offsets::INTMC => self.intms as u64,
            offsets::CC => self.cc as u64,
            offsets::CSTS => self.csts as u64,
            offsets::AQA => self.aqa as u64,
            offsets::ASQ => self.asq,
            offsets::ACQ => self.acq,
            _ => 0,
        }
    }

    fn write_register(&mut self, offset: u32, value: u64) {
        match offset {
            offsets::CC => self.write_cc(value as u32),
            offsets::INTMS => self.intms |= value as u32,
            offsets::INTMC => self.intms &= !(value as u32),
            offsets::AQA => self.aqa = value as u32,
            offsets::ASQ => self.asq = value & !PAGE_MASK,
            offsets::ACQ => self.acq = value & !PAGE_MASK,
            o if o >= offsets::DOORBELL_BASE => self.ring_doorbell(o - offsets::DOORBELL_BASE, value as u16),
            _ => {}
        }
    }

    fn write_cc(&mut self, cc: u32) {
        let was_enabled = self.cc & cc_bits::EN != 0;
        let enable = cc & cc_bits::EN != 0;
        self.cc = cc;

        if enable && !was_enabled {
            self.sqs.clear();
            self.cqs.clear();
            let sq_size = ((self.aqa & aqa_bits::ASQS_MASK) + 1) as u16;
            let cq_size = (((self.aqa >> aqa_bits::ACQS_SHIFT) & aqa_bits::ASQS_MASK) + 1) as u16;
            self.cqs.insert(0, SimCq { phys: self.acq, size: cq_size, head: 0, tail: 0, phase: true });
            self.sqs.insert(0, SimSq { phys: self.asq, size: sq_size, head: 0, tail: 0, cqid: 0 });
            if !self.never_ready {
                self.csts |= csts_bits::RDY;
            }
        } else if !enable && was_enabled {
            self.sqs.clear();
            self.cqs.clear();
            if !self.stuck_ready {
                self.csts &= !csts_bits::RDY;
            }
        }
    }

    fn ring_doorbell(&mut self, relative: u32, value: u16) {
        let stride = 4u32 << (self.config.doorbell_stride & 0xF);
        if relative % stride != 0 {
            return;
        }
        let index = relative / stride;
        let queue_id = (index / 2) as u16;
        if index % 2 == 0 {
            if let Some(sq) = self.sqs.get_mut(&queue_id) {
                sq.tail = value % sq.size;
            }
            self.process_sq(queue_id);
        } else {
            if let Some(cq) = self.cqs.get_mut(&queue_id) {
                cq.head = value % cq.size;
            }
            // freed completion slots may unblock any submission queue
            let ids: Vec<u16> = self.sqs.keys().copied().collect();
            for id in ids {
                self.process_sq(id);
            }
        }
    }

    fn process_sq(&mut self, queue_id: u16) {
        if self.held.contains(&queue_id) || self.csts & csts_bits::RDY == 0 {
            return;
        }
        loop {
            let Some(mut sq) = self.sqs.get(&queue_id).copied() else { return };
            let Some(cq) = self.cqs.get(&sq.cqid).copied() else { return };
            if sq.head == sq.tail || (cq.tail + 1) % cq.size == cq.head {
                return;
            }

            let mut raw = [0u8; 64];
            if !self.dma_read(sq.phys + sq.head as u64 * 64, &mut raw) {
                return;
            }
            // SAFETY: 64 bytes read into a buffer of the entry's size
            let cmd: NvmeCommand = unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const NvmeCommand) };
            sq.head = (sq.head + 1) % sq.size;
            self.sqs.insert(queue_id, sq);

            let (status, dw0) = self.execute(queue_id, &cmd);
            self.post_completion(sq.cqid, queue_id, sq.head, cmd.command_id(), status, dw0);
        }
    }

    fn post_completion(&mut self, cqid: u16, sq_id: u16, sq_head: u16, cid: u16, status: CompletionStatus, dw0: u32) {
        let Some(mut cq) = self.cqs.get(&cqid).copied() else { return };
        let entry = NvmeCompletion {
            dw0,
            dw1: 0,
            sq_head,
            sq_id,
            cid,
            status: status.to_status_field(cq.phase),
        };
        // SAFETY: NvmeCompletion is plain 16 byte data
        let bytes = unsafe {
            core::slice::from_raw_parts(&entry as *const NvmeCompletion as *const u8, 16)
        };
        self.dma_write(cq.phys + cq.tail as u64 * 16, bytes);
        cq.tail = (cq.tail + 1) % cq.size;
        if cq.tail == 0 {
            cq.phase = !cq.phase;
        }
        self.cqs.insert(cqid, cq);
    }

    fn execute(&mut self, queue_id: u16, cmd: &NvmeCommand) -> (CompletionStatus, u32) {
        let admin = queue_id == 0;
        self.log.push(LoggedCommand {
            queue_id,
            opcode: cmd.opcode(),
            cid: cmd.command_id(),
            nsid: cmd.nsid,
            prp1: cmd.prp1,
            prp2: cmd.prp2,
            mptr: cmd.mptr,
            cdw10: cmd.cdw10,
            cdw11: cmd.cdw11,
            cdw12: cmd.cdw12,
        });
        trace!("sim: queue {} opcode {:#04x} cid {}", queue_id, cmd.opcode(), cmd.command_id());

        if let Some(pos) = self.injected.iter().position(|&(a, op, _)| a == admin && op == cmd.opcode()) {
            let (_, _, status) = self.injected.remove(pos);
            return (status, 0);
        }

        let status = if admin {
            match cmd.opcode() {
                opcodes::ADMIN_IDENTIFY => self.identify(cmd),
                opcodes::ADMIN_CREATE_IO_CQ => self.create_cq(cmd),
                opcodes::ADMIN_CREATE_IO_SQ => self.create_sq(cmd),
                opcodes::ADMIN_DELETE_IO_SQ => {
                    self.sqs.remove(&((cmd.cdw10 & 0xFFFF) as u16));
                    ok()
                }
                opcodes::ADMIN_DELETE_IO_CQ => {
                    self.cqs.remove(&((cmd.cdw10 & 0xFFFF) as u16));
                    ok()
                }
                opcodes::ADMIN_SECURITY_SEND => self.security_send(cmd),
                opcodes::ADMIN_SECURITY_RECEIVE => self.security_receive(cmd),
                _ => CompletionStatus::generic(generic_status::INVALID_OPCODE),
            }
        } else {
            match cmd.opcode() {
                opcodes::NVM_READ => self.read(cmd),
                opcodes::NVM_WRITE => self.write(cmd),
                opcodes::NVM_FLUSH => match self.namespace_index(cmd.nsid) {
                    Some(_) => ok(),
                    None => CompletionStatus::generic(generic_status::INVALID_NAMESPACE),
                },
                _ => CompletionStatus::generic(generic_status::INVALID_OPCODE),
            }
        };
        (status, 0)
    }

    fn namespace_count(&self) -> u32 {
        self.config
            .namespace_count
            .unwrap_or_else(|| self.config.namespaces.iter().map(|ns| ns.nsid).max().unwrap_or(0))
    }

    fn namespace_index(&self, nsid: u32) -> Option<usize> {
        self.config.namespaces.iter().position(|ns| ns.nsid == nsid)
    }

    fn max_transfer(&self) -> Option<usize> {
        (self.config.mdts != 0).then(|| (1usize << self.config.mdts) * (PAGE_SIZE << self.config.mpsmin))
    }

    fn identify(&mut self, cmd: &NvmeCommand) -> CompletionStatus {
        match cmd.cdw10 & 0xFF {
            identify_cns::CONTROLLER => {
                let mut data = zeroed_box::<IdentifyController>();
                data.vid = 0x1B36;
                data.ssvid = 0x1AF4;
                copy_padded(&mut data.sn, self.config.serial);
                copy_padded(&mut data.mn, self.config.model);
                copy_padded(&mut data.fr, "1.0");
                data.mdts = self.config.mdts;
                data.ver = self.config.version;
                data.sqes = 0x66;
                data.cqes = 0x44;
                data.nn = self.namespace_count();
                data.oacs = 1; // security send/receive
                self.to_host(cmd, as_bytes(&*data))
            }
            identify_cns::NAMESPACE => {
                let Some(index) = self.namespace_index(cmd.nsid) else {
                    return CompletionStatus::generic(generic_status::INVALID_NAMESPACE);
                };
                let ns = &self.config.namespaces[index];
                let mut data = zeroed_box::<IdentifyNamespace>();
                data.nsze = ns.blocks;
                data.ncap = ns.capacity;
                data.nuse = ns.blocks;
                data.nlbaf = ns.format_index;
                data.flbas = ns.format_index;
                data.lbaf[0].lbads = 9;
                data.lbaf[ns.format_index as usize].lbads = ns.lbads;
                data.eui64 = ns.eui64.to_le_bytes();
                self.to_host(cmd, as_bytes(&*data))
            }
            _ => CompletionStatus::generic(generic_status::INVALID_FIELD),
        }
    }

    fn create_cq(&mut self, cmd: &NvmeCommand) -> CompletionStatus {
        let qid = (cmd.cdw10 & 0xFFFF) as u16;
        let size = ((cmd.cdw10 >> 16) + 1) as u16;
        if qid == 0 || size as u32 > self.config.mqes as u32 + 1 {
            return CompletionStatus { sct: status_type::COMMAND_SPECIFIC, sc: 0x01, ..Default::default() };
        }
        self.cqs.insert(qid, SimCq { phys: cmd.prp1, size, head: 0, tail: 0, phase: true });
        ok()
    }

    fn create_sq(&mut self, cmd: &NvmeCommand) -> CompletionStatus {
        let qid = (cmd.cdw10 & 0xFFFF) as u16;
        let size = ((cmd.cdw10 >> 16) + 1) as u16;
        let cqid = (cmd.cdw11 >> 16) as u16;
        if !self.cqs.contains_key(&cqid) {
            // completion queue invalid
            return CompletionStatus { sct: status_type::COMMAND_SPECIFIC, sc: 0x00, ..Default::default() };
        }
        if qid == 0 || size as u32 > self.config.mqes as u32 + 1 {
            return CompletionStatus { sct: status_type::COMMAND_SPECIFIC, sc: 0x01, ..Default::default() };
        }
        self.sqs.insert(qid, SimSq { phys: cmd.prp1, size, head: 0, tail: 0, cqid });
        ok()
    }

    /// Validate a read/write and return (namespace index, byte offset, length)
    fn block_range(&self, cmd: &NvmeCommand) -> Result<(usize, usize, usize), CompletionStatus> {
        let index = self
            .namespace_index(cmd.nsid)
            .ok_or(CompletionStatus::generic(generic_status::INVALID_NAMESPACE))?;
        let ns = &self.config.namespaces[index];
        let lba = (cmd.cdw11 as u64) << 32 | cmd.cdw10 as u64;
        let blocks = (cmd.cdw12 & 0xFFFF) as u64 + 1;
        if lba + blocks > ns.blocks {
            return Err(CompletionStatus::generic(generic_status::LBA_OUT_OF_RANGE));
        }
        let len = (blocks as usize) << ns.lbads;
        if self.max_transfer().is_some_and(|max| len > max) {
            return Err(CompletionStatus::generic(generic_status::INVALID_FIELD));
        }
        Ok((index, (lba as usize) << ns.lbads, len))
    }

    fn read(&mut self, cmd: &NvmeCommand) -> CompletionStatus {
        match self.block_range(cmd) {
            Ok((index, offset, len)) => {
                let data = self.config.namespaces[index].data[offset..offset + len].to_vec();
                self.to_host(cmd, &data)
            }
            Err(status) => status,
        }
    }

    fn write(&mut self, cmd: &NvmeCommand) -> CompletionStatus {
        match self.block_range(cmd) {
            Ok((index, offset, len)) => match self.from_host(cmd, len) {
                Some(data) => {
                    self.config.namespaces[index].data[offset..offset + len].copy_from_slice(&data);
                    ok()
                }
                None => CompletionStatus::generic(generic_status::DATA_TRANSFER_ERROR),
            },
            Err(status) => status,
        }
    }

    fn security_send(&mut self, cmd: &NvmeCommand) -> CompletionStatus {
        let len = cmd.cdw11 as usize;
        if len == 0 {
            self.security_sent.clear();
            return ok();
        }
        match self.from_host(cmd, len) {
            Some(data) => {
                self.security_sent = data;
                ok()
            }
            None => CompletionStatus::generic(generic_status::DATA_TRANSFER_ERROR),
        }
    }

    fn security_receive(&mut self, cmd: &NvmeCommand) -> CompletionStatus {
        let len = cmd.cdw11 as usize;
        if len == 0 {
            return ok();
        }
        let mut data = vec![0u8; len];
        let n = core::cmp::min(len, self.security_response.len());
        data[..n].copy_from_slice(&self.security_response[..n]);
        self.to_host(cmd, &data)
    }

    fn to_host(&mut self, cmd: &NvmeCommand, data: &[u8]) -> CompletionStatus {
        let Some(segments) = self.prp_segments(cmd.prp1, cmd.prp2, data.len()) else {
            return CompletionStatus::generic(generic_status::DATA_TRANSFER_ERROR);
        };
        let mut done = 0;
        for (phys, len) in segments {
            if !self.dma_write(phys, &data[done..done + len]) {
                return CompletionStatus::generic(generic_status::DATA_TRANSFER_ERROR);
            }
            done += len;
        }
        ok()
    }

    fn from_host(&self, cmd: &NvmeCommand, len: usize) -> Option<Vec<u8>> {
        let mut data = vec![0u8; len];
        let mut done = 0;
        for (phys, seg) in self.prp_segments(cmd.prp1, cmd.prp2, len)? {
            if !self.dma_read(phys, &mut data[done..done + seg]) {
                return None;
            }
            done += seg;
        }
        Some(data)
    }

    /// Walk PRP1/PRP2 (and any chained PRP lists) into device address ranges
    fn prp_segments(&self, prp1: u64, prp2: u64, len: usize) -> Option<Vec<(u64, usize)>> {
        let mut segments = Vec::new();
        let first = core::cmp::min(len, (PAGE - (prp1 & PAGE_MASK)) as usize);
        segments.push((prp1, first));
        let mut remaining = len - first;
        if remaining == 0 {
            return Some(segments);
        }
        if remaining <= PAGE_SIZE {
            segments.push((prp2, remaining));
            return Some(segments);
        }

        let mut list_page = prp2 & !PAGE_MASK;
        let mut slot = ((prp2 & PAGE_MASK) / 8) as usize;
        while remaining > 0 {
            let entry = self.read_u64(list_page + slot as u64 * 8)?;
            if slot == 511 && remaining > PAGE_SIZE {
                list_page = entry & !PAGE_MASK;
                slot = ((entry & PAGE_MASK) / 8) as usize;
                continue;
            }
            if entry & PAGE_MASK != 0 {
                return None;
            }
            let seg = core::cmp::min(remaining, PAGE_SIZE);
            segments.push((entry, seg));
            remaining -= seg;
            slot += 1;
        }
        Some(segments)
    }

    fn translate(&self, phys: u64, len: usize) -> Option<*mut u8> {
        self.regions
            .iter()
            .find(|r| phys >= r.phys && phys + len as u64 <= r.phys + r.len as u64)
            .map(|r| (r.host + (phys - r.phys) as usize) as *mut u8)
    }

    fn dma_read(&self, phys: u64, out: &mut [u8]) -> bool {
        match self.translate(phys, out.len()) {
            Some(ptr) => {
                // SAFETY: the region is live host memory registered by map/allocate
                unsafe { core::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), out.len()) };
                true
            }
            None => false,
        }
    }

    fn dma_write(&mut self, phys: u64, data: &[u8]) -> bool {
        match self.translate(phys, data.len()) {
            Some(ptr) => {
                // SAFETY: the region is live host memory registered by map/allocate
                unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
                true
            }
            None => false,
        }
    }

    fn read_u64(&self, phys: u64) -> Option<u64> {
        let mut raw = [0u8; 8];
        self.dma_read(phys, &mut raw).then(|| u64::from_le_bytes(raw))
    }

    /// Reserve a device address window for `len` bytes at page offset
    /// `offset`, followed by an unmapped guard page
    fn reserve(&mut self, offset: u64, len: usize) -> (u64, u64) {
        let phys = self.next_phys + offset;
        self.next_phys += (offset + len as u64).div_ceil(PAGE) * PAGE + PAGE;
        let handle = self.next_handle;
        self.next_handle += 1;
        (phys, handle)
    }

    fn take_region(&mut self, handle: u64) -> Option<Region> {
        let pos = self.regions.iter().position(|r| r.handle == handle)?;
        Some(self.regions.swap_remove(pos))
    }
}

impl Drop for State {
    fn drop(&mut self) {
        for region in self.regions.drain(..) {
            if let RegionKind::Allocation { pages } = region.kind {
                if let Ok(layout) = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE) {
                    // SAFETY: allocated in `allocate` with this layout
                    unsafe { dealloc(region.host as *mut u8, layout) };
                }
            }
        }
    }
}

fn ok() -> CompletionStatus {
    CompletionStatus::generic(generic_status::SUCCESS)
}

fn copy_padded(field: &mut [u8], text: &str) {
    field.fill(b' ');
    let n = core::cmp::min(field.len(), text.len());
    field[..n].copy_from_slice(&text.as_bytes()[..n]);
}

impl RegisterAccess for SimController {
    fn read(&self, base: u64, offset: u32, width: Width) -> Result<u64, NvmeError> {
        if base == 0 {
            return Err(NvmeError::InvalidParameter);
        }
        Ok(self.state.lock().register(offset) & width.mask())
    }

    fn write(&self, base: u64, offset: u32, width: Width, value: u64) -> Result<(), NvmeError> {
        if base == 0 {
            return Err(NvmeError::InvalidParameter);
        }
        self.state.lock().write_register(offset, value & width.mask());
        Ok(())
    }
}

impl DmaService for SimController {
    fn allocate(&self, pages: usize) -> Result<DmaPages, NvmeError> {
        let mut state = self.state.lock();
        if state.fail_allocations || pages == 0 {
            return Err(NvmeError::OutOfResources);
        }
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE)
            .map_err(|_| NvmeError::OutOfResources)?;
        // SAFETY: non-zero size
        let host = unsafe { alloc_zeroed(layout) };
        if host.is_null() {
            return Err(NvmeError::OutOfResources);
        }
        let (phys, handle) = state.reserve(0, pages * PAGE_SIZE);
        state.regions.push(Region {
            phys,
            host: host as usize,
            len: pages * PAGE_SIZE,
            handle,
            kind: RegionKind::Allocation { pages },
        });
        // SAFETY: fresh allocation of `pages` pages, owned by the returned
        // value until `free`
        Ok(unsafe { DmaPages::new(VirtAddr::from_ptr(host), PhysAddr::new(phys), pages, MappingHandle(handle)) })
    }

    fn free(&self, pages: DmaPages) {
        let mut state = self.state.lock();
        match state.take_region(pages.handle().0) {
            Some(Region { host, kind: RegionKind::Allocation { pages: count }, .. }) => {
                if let Ok(layout) = Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE) {
                    // SAFETY: allocated in `allocate` with this layout
                    unsafe { dealloc(host as *mut u8, layout) };
                }
            }
            Some(region) => {
                state.regions.push(region);
                state.unmatched_releases += 1;
            }
            None => state.unmatched_releases += 1,
        }
    }

    fn map(&self, _direction: DmaDirection, host: VirtAddr, len: usize) -> Result<DmaMapping, NvmeError> {
        let mut state = self.state.lock();
        match state.maps_until_failure {
            Some(0) => return Err(NvmeError::OutOfResources),
            Some(left) => state.maps_until_failure = Some(left - 1),
            None => {}
        }
        let (phys, handle) = state.reserve(host.as_u64() & PAGE_MASK, len);
        state.regions.push(Region { phys, host: host.as_u64() as usize, len, handle, kind: RegionKind::Mapping });
        state.maps_created += 1;
        Ok(DmaMapping::new(PhysAddr::new(phys), len, MappingHandle(handle)))
    }

    fn unmap(&self, mapping: DmaMapping) {
        let mut state = self.state.lock();
        match state.take_region(mapping.handle().0) {
            Some(Region { kind: RegionKind::Mapping, .. }) => {}
            Some(region) => {
                state.regions.push(region);
                state.unmatched_releases += 1;
            }
            None => state.unmatched_releases += 1,
        }
    }
}

impl Delay for SimController {
    fn stall_ns(&self, nanos: u64) {
        self.state.lock().elapsed_ns += nanos;
    }
}

/// Page-aligned heap buffer, usable as a DMA target
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl AlignedBuffer {
    pub fn zeroed(len: usize) -> Self {
        let layout = match Layout::from_size_align(core::cmp::max(len, 1), PAGE_SIZE) {
            Ok(layout) => layout,
            Err(_) => Layout::new::<u8>(),
        };
        // SAFETY: non-zero size
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else { handle_alloc_error(layout) };
        Self { ptr, len, layout }
    }

    /// Buffer whose byte `i` is `pattern(i)`
    pub fn with_pattern(len: usize, pattern: impl Fn(usize) -> u8) -> Self {
        let mut buffer = Self::zeroed(len);
        for (i, byte) in buffer.iter_mut().enumerate() {
            *byte = pattern(i);
        }
        buffer
    }

    /// Give up ownership for buffers handed to asynchronous requests
    pub fn leak(self) -> &'static mut [u8] {
        let this = core::mem::ManuallyDrop::new(self);
        // SAFETY: the allocation is never freed from here on
        unsafe { core::slice::from_raw_parts_mut(this.ptr.as_ptr(), this.len) }
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `len` initialised bytes owned by self
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: `len` initialised bytes owned by self
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this layout
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_addresses_differ_from_host_but_keep_page_offset() {
        let sim = SimController::new();
        let buffer = AlignedBuffer::zeroed(8192);
        let host = VirtAddr::from_ptr(buffer[0x10..].as_ptr());
        let mapping = sim.map(DmaDirection::DeviceWrite, host, 100).unwrap();
        assert_ne!(mapping.phys().as_u64(), host.as_u64());
        assert_eq!(mapping.phys().as_u64() & PAGE_MASK, 0x10);
        assert_eq!(sim.live_mappings(), 1);
        sim.unmap(mapping);
        assert_eq!(sim.live_mappings(), 0);
        assert_eq!(sim.unmatched_releases(), 0);
    }

    #[test]
    fn allocations_are_zeroed_and_counted() {
        let sim = SimController::new();
        let pages = sim.allocate(2).unwrap();
        assert_eq!(pages.read_u64(1023), Ok(0));
        assert_eq!(sim.live_allocations(), 1);
        sim.free(pages);
        assert_eq!(sim.live_allocations(), 0);
    }

    #[test]
    fn enable_sets_ready_unless_told_otherwise() {
        let sim = SimController::new();
        sim.write(1, offsets::CC, Width::Dword, 1).unwrap();
        assert_eq!(sim.read(1, offsets::CSTS, Width::Dword), Ok(1));
        sim.write(1, offsets::CC, Width::Dword, 0).unwrap();
        assert_eq!(sim.read(1, offsets::CSTS, Width::Dword), Ok(0));

        sim.set_never_ready(true);
        sim.write(1, offsets::CC, Width::Dword, 1).unwrap();
        assert_eq!(sim.read(1, offsets::CSTS, Width::Dword), Ok(0));
        assert_eq!(sim.read(0, offsets::CSTS, Width::Dword), Err(NvmeError::InvalidParameter));
    }

    #[test]
    fn capabilities_reflect_config() {
        let sim = SimController::with_config(SimConfig { mqes: 3, nvm_command_set: false, ..Default::default() });
        let cap = sim.read(1, offsets::CAP, Width::Qword).unwrap();
        assert_eq!(cap & 0xFFFF, 3);
        assert_eq!(cap & cap_bits::CSS_NVM, 0);
    }

    #[test]
    fn prp_walk_follows_chained_lists() {
        let sim = SimController::new();
        let buffer = AlignedBuffer::zeroed(1024 * PAGE_SIZE);
        let mapping = sim.map(DmaDirection::DeviceRead, VirtAddr::from_ptr(buffer.as_ptr()), buffer.len()).unwrap();
        let prp = crate::prp::PrpEntries::for_transfer(&sim, mapping.phys(), buffer.len()).unwrap();

        let state = sim.state.lock();
        let segments = state.prp_segments(prp.prp1, prp.prp2, buffer.len()).unwrap();
        assert_eq!(segments.len(), 1024);
        for (i, (phys, len)) in segments.iter().enumerate() {
            assert_eq!(*phys, mapping.phys().as_u64() + (i * PAGE_SIZE) as u64);
            assert_eq!(*len, PAGE_SIZE);
        }
        drop(state);

        if let Some(list) = prp.list {
            list.release(&sim);
        }
        sim.unmap(mapping);
    }
}
