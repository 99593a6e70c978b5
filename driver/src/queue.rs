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

//! Queue pair management
//!
//! The driver runs three queue pairs out of one scratch region: the admin
//! queue, a one-deep synchronous I/O queue and a ring-buffered asynchronous
//! I/O queue.

use core::mem::size_of;
use x86_64::{PhysAddr, VirtAddr};

use super::{
    commands::{NvmeCommand, NvmeCompletion},
    error::NvmeError,
};

pub const ADMIN_QUEUE_ID: u16 = 0;
pub const SYNC_IO_QUEUE_ID: u16 = 1;
pub const ASYNC_IO_QUEUE_ID: u16 = 2;
pub const QUEUE_COUNT: usize = 3;

/// Admin and synchronous I/O queues hold a single command in flight
pub const SYNC_QUEUE_ENTRIES: u16 = 2;
/// Upper bound on the async queue; 64 submission entries fill one page
pub const MAX_ASYNC_QUEUE_ENTRIES: u16 = 64;

pub const SQ_ENTRY_SIZE: usize = size_of::<NvmeCommand>();
pub const CQ_ENTRY_SIZE: usize = size_of::<NvmeCompletion>();

/// Queue class requested by a command packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueType {
    Admin = 0,
    Io = 1,
}

impl TryFrom<u8> for QueueType {
    type Error = NvmeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QueueType::Admin),
            1 => Ok(QueueType::Io),
            _ => Err(NvmeError::InvalidParameter),
        }
    }
}

/// Pick the queue a command goes to. Admin commands always use queue 0; I/O
/// commands use the async queue only when the caller will not block.
pub fn select_queue(queue_type: QueueType, nonblocking: bool) -> u16 {
    match queue_type {
        QueueType::Admin => ADMIN_QUEUE_ID,
        QueueType::Io if nonblocking => ASYNC_IO_QUEUE_ID,
        QueueType::Io => SYNC_IO_QUEUE_ID,
    }
}

/// How the ring indexes advance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indexing {
    /// Two-entry queue whose indexes alternate via XOR
    Toggle,
    /// Ring of `size` entries, indexes wrap modulo `size`
    Ring,
}

/// One submission/completion queue pair
#[derive(Debug)]
pub struct QueuePair {
    id: u16,
    sq: VirtAddr,
    sq_phys: PhysAddr,
    cq: VirtAddr,
    cq_phys: PhysAddr,
    size: u16,
    indexing: Indexing,
    /// Submission queue tail (next slot to fill)
    sq_tail: u16,
    /// Consumer head of the submission queue, as reported in completions
    sq_head: u16,
    /// Completion queue head
    cq_head: u16,
    /// Phase tag expected on the next new completion
    cq_phase: bool,
    next_command_id: u16,
    /// Command that timed out on a one-deep queue and still owns its slot
    abandoned: Option<u16>,
}

impl QueuePair {
    /// # Safety
    /// `sq` must point to `size` writable submission entries and `cq` to
    /// `size` readable completion entries, both valid and device-visible at
    /// `sq_phys`/`cq_phys` for as long as the queue pair is used.
    pub unsafe fn new(
        id: u16,
        size: u16,
        indexing: Indexing,
        sq: VirtAddr,
        sq_phys: PhysAddr,
        cq: VirtAddr,
        cq_phys: PhysAddr,
    ) -> Self {
        debug_assert!(size >= 2);
        debug_assert!(indexing == Indexing::Ring || size == 2);
        Self {
            id,
            sq,
            sq_phys,
            cq,
            cq_phys,
            size,
            indexing,
            sq_tail: 0,
            sq_head: 0,
            cq_head: 0,
            cq_phase: true,
            next_command_id: 0,
            abandoned: None,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn sq_phys(&self) -> PhysAddr {
        self.sq_phys
    }

    pub fn cq_phys(&self) -> PhysAddr {
        self.cq_phys
    }

    pub fn sq_tail(&self) -> u16 {
        self.sq_tail
    }

    pub fn sq_head(&self) -> u16 {
        self.sq_head
    }

    pub fn cq_head(&self) -> u16 {
        self.cq_head
    }

    pub fn expected_phase(&self) -> bool {
        self.cq_phase
    }

    /// Return indexes, phase and command ids to their power-on state
    pub fn reset(&mut self) {
        self.sq_tail = 0;
        self.sq_head = 0;
        self.cq_head = 0;
        self.cq_phase = true;
        self.next_command_id = 0;
        self.abandoned = None;
    }

    /// Clear both rings
    pub fn zero(&mut self) {
        // SAFETY: both rings are owned for `size` entries (see `new`)
        unsafe {
            core::ptr::write_bytes(self.sq.as_mut_ptr::<u8>(), 0, self.size as usize * SQ_ENTRY_SIZE);
            core::ptr::write_bytes(self.cq.as_mut_ptr::<u8>(), 0, self.size as usize * CQ_ENTRY_SIZE);
        }
    }

    fn next_index(&self, index: u16) -> u16 {
        match self.indexing {
            Indexing::Toggle => index ^ 1,
            Indexing::Ring => (index + 1) % self.size,
        }
    }

    /// Whether advancing the tail would run into the consumer head. Only the
    /// ring-indexed queue is ever more than one command deep.
    pub fn is_full(&self) -> bool {
        self.indexing == Indexing::Ring && self.next_index(self.sq_tail) == self.sq_head
    }

    /// Command id given up on while its completion was still outstanding
    pub fn abandoned(&self) -> Option<u16> {
        self.abandoned
    }

    pub fn set_abandoned(&mut self, cid: Option<u16>) {
        self.abandoned = cid;
    }

    /// Allocate the next command identifier for this queue
    pub fn allocate_command_id(&mut self) -> u16 {
        let cid = self.next_command_id;
        self.next_command_id = self.next_command_id.wrapping_add(1);
        cid
    }

    /// Write `cmd` into the slot at the current tail and advance the tail.
    /// Returns the new tail for the doorbell.
    pub fn push(&mut self, cmd: &NvmeCommand) -> Result<u16, NvmeError> {
        if self.is_full() {
            return Err(NvmeError::NotReady);
        }
        // SAFETY: sq_tail < size, ring memory is valid (see `new`)
        unsafe {
            let entry_ptr = self.sq.as_mut_ptr::<NvmeCommand>().add(self.sq_tail as usize);
            core::ptr::write_volatile(entry_ptr, *cmd);
        }
        self.sq_tail = self.next_index(self.sq_tail);
        Ok(self.sq_tail)
    }

    /// Completion at the head if its phase tag marks it as new
    pub fn peek_completion(&self) -> Option<NvmeCompletion> {
        // SAFETY: cq_head < size, ring memory is valid (see `new`)
        let completion = unsafe {
            core::ptr::read_volatile(self.cq.as_ptr::<NvmeCompletion>().add(self.cq_head as usize))
        };
        completion.is_valid(self.cq_phase).then_some(completion)
    }

    /// Consume the completion at the head. The expected phase flips when
    /// the head wraps to zero. Returns the new head for the doorbell.
    pub fn advance_head(&mut self, completion: &NvmeCompletion) -> u16 {
        self.cq_head = self.next_index(self.cq_head);
        if self.cq_head == 0 {
            self.cq_phase = !self.cq_phase;
        }
        self.sq_head = completion.sq_head % self.size;
        self.cq_head
    }

    /// Take the next new completion, if any
    pub fn pop_completion(&mut self) -> Option<NvmeCompletion> {
        let completion = self.peek_completion()?;
        self.advance_head(&completion);
        Some(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::{boxed::Box, vec::Vec};
    use proptest::prelude::*;

    #[repr(C, align(4096))]
    struct Rings {
        sq: [u8; 4096],
        cq: [u8; 4096],
    }

    fn rings() -> Box<Rings> {
        Box::new(Rings { sq: [0; 4096], cq: [0; 4096] })
    }

    fn queue(rings: &mut Rings, size: u16, indexing: Indexing) -> QueuePair {
        let sq = VirtAddr::from_ptr(rings.sq.as_mut_ptr());
        let cq = VirtAddr::from_ptr(rings.cq.as_mut_ptr());
        unsafe { QueuePair::new(2, size, indexing, sq, PhysAddr::new(0x1000), cq, PhysAddr::new(0x2000)) }
    }

    /// Device side of a completion ring: posts entries with its own phase
    struct DeviceCq {
        tail: u16,
        phase: bool,
        size: u16,
    }

    impl DeviceCq {
        fn post(&mut self, rings: &mut Rings, cid: u16, sq_head: u16) {
            let entry = NvmeCompletion {
                cid,
                sq_head,
                status: self.phase as u16,
                ..Default::default()
            };
            unsafe {
                let ptr = (rings.cq.as_mut_ptr() as *mut NvmeCompletion).add(self.tail as usize);
                core::ptr::write_volatile(ptr, entry);
            }
            self.tail = (self.tail + 1) % self.size;
            if self.tail == 0 {
                self.phase = !self.phase;
            }
        }
    }

    #[test]
    fn queue_selection() {
        assert_eq!(select_queue(QueueType::Admin, true), ADMIN_QUEUE_ID);
        assert_eq!(select_queue(QueueType::Io, false), SYNC_IO_QUEUE_ID);
        assert_eq!(select_queue(QueueType::Io, true), ASYNC_IO_QUEUE_ID);
        assert_eq!(QueueType::try_from(2), Err(NvmeError::InvalidParameter));
    }

    #[test]
    fn toggle_queue_alternates() {
        let mut rings = rings();
        let mut q = queue(&mut rings, 2, Indexing::Toggle);
        let cmd = NvmeCommand::new();
        assert_eq!(q.push(&cmd), Ok(1));
        assert_eq!(q.push(&cmd), Ok(0));
        assert_eq!(q.push(&cmd), Ok(1));
        assert!(!q.is_full());
    }

    #[test]
    fn full_ring_refuses_without_mutation() {
        let mut rings = rings();
        let mut q = queue(&mut rings, 4, Indexing::Ring);
        let mut cmd = NvmeCommand::new();
        for cid in 0..3 {
            cmd.set_command_id(cid);
            q.push(&cmd).unwrap();
        }
        assert!(q.is_full());
        let before = rings_snapshot(&q);
        assert_eq!(q.push(&cmd), Err(NvmeError::NotReady));
        assert_eq!(rings_snapshot(&q), before);
    }

    fn rings_snapshot(q: &QueuePair) -> (u16, u16, u16, bool) {
        (q.sq_tail(), q.sq_head(), q.cq_head(), q.expected_phase())
    }

    #[test]
    fn stale_entries_are_not_completions() {
        let mut rings = rings();
        let q = queue(&mut rings, 4, Indexing::Ring);
        assert!(q.peek_completion().is_none());
    }

    proptest! {
        #[test]
        fn phase_flips_once_per_traversal(size in 2u16..=64) {
            let mut rings = rings();
            let mut q = queue(&mut rings, size, Indexing::Ring);
            let mut device = DeviceCq { tail: 0, phase: true, size };
            let mut flips = Vec::new();
            let mut phase = q.expected_phase();

            for n in 0..(3 * size as u32) {
                device.post(&mut rings, n as u16, 0);
                let completion = q.pop_completion().expect("posted entry must be seen");
                prop_assert_eq!(completion.cid, n as u16);
                prop_assert!(q.cq_head() < size);
                prop_assert!(q.peek_completion().is_none());
                if q.expected_phase() != phase {
                    flips.push(n);
                    phase = q.expected_phase();
                }
            }

            let expected: Vec<u32> = (1..=3).map(|t| t * size as u32 - 1).collect();
            prop_assert_eq!(flips, expected);
        }

        #[test]
        fn tail_stays_in_range(size in 2u16..=64, pushes in 0usize..200) {
            let mut rings = rings();
            let mut q = queue(&mut rings, size, Indexing::Ring);
            let mut device = DeviceCq { tail: 0, phase: true, size };
            let cmd = NvmeCommand::new();
            for _ in 0..pushes {
                match q.push(&cmd) {
                    Ok(tail) => prop_assert!(tail < size),
                    Err(NvmeError::NotReady) => {
                        // consumer catches up to the tail
                        device.post(&mut rings, 0, q.sq_tail());
                        q.pop_completion().expect("posted entry must be seen");
                        prop_assert!(!q.is_full());
                    }
                    Err(other) => prop_assert!(false, "unexpected {:?}", other),
                }
            }
        }
    }
}
