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

//! End-to-end scenarios against the software controller

use alloc::{boxed::Box, rc::Rc, vec, vec::Vec};
use core::cell::RefCell;

use crate::{
    commands::{Command, NvmeCompletion},
    config::DriverConfig,
    controller::Controller,
    error::{CompletionStatus, NvmeError, generic_status},
    passthru::{CommandPacket, Notifier, TransferBuffer},
    queue::{ASYNC_IO_QUEUE_ID, QueueType},
    registers::opcodes,
    sim::{AlignedBuffer, SimConfig, SimController, SimNamespace},
};

const BASE: u64 = 0xFEB0_0000;

fn attach(sim: &SimController) -> Controller<SimController> {
    let mut ctrl = Controller::new(sim.clone(), BASE, DriverConfig::default()).unwrap();
    ctrl.discover_namespaces();
    ctrl
}

type Seen = Rc<RefCell<Vec<Result<NvmeCompletion, NvmeError>>>>;

fn recorder() -> (Seen, Notifier) {
    let seen: Seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    (seen, Box::new(move |result| sink.borrow_mut().push(result)))
}

#[test]
fn round_trip_across_chunk_boundary() {
    let sim = SimController::new();
    let mut ctrl = attach(&sim);
    let max_blocks = ctrl.max_transfer_blocks(512) as usize;
    assert_eq!(max_blocks, 256);

    for (lba, blocks) in [(0u64, 1usize), (7, max_blocks), (900, max_blocks + 1)] {
        sim.clear_commands();
        let data = AlignedBuffer::with_pattern(blocks * 512, |i| (i as u64 * 31 + lba) as u8);
        ctrl.write_blocks(1, lba, &data).unwrap();

        let mut back = AlignedBuffer::zeroed(blocks * 512);
        ctrl.read_blocks(1, lba, &mut back).unwrap();
        assert_eq!(&back[..], &data[..], "{blocks} blocks at LBA {lba}");

        let expected = blocks.div_ceil(max_blocks);
        assert_eq!(sim.io_commands(opcodes::NVM_WRITE).len(), expected);
        assert_eq!(sim.io_commands(opcodes::NVM_READ).len(), expected);
    }
}

#[test]
fn split_request_issues_distinct_commands() {
    let sim = SimController::new();
    let mut ctrl = attach(&sim);
    sim.clear_commands();

    let mut buffer = AlignedBuffer::zeroed(300 * 512);
    ctrl.read_blocks(1, 100, &mut buffer).unwrap();

    let reads = sim.io_commands(opcodes::NVM_READ);
    assert_eq!(reads.len(), 2);
    assert_eq!((reads[0].lba(), reads[0].blocks()), (100, 256));
    assert_eq!((reads[1].lba(), reads[1].blocks()), (356, 44));
    assert_ne!(reads[0].cid, reads[1].cid);
    // second chunk starts 128 KiB further into the buffer
    assert_ne!(reads[0].prp1, reads[1].prp1);
}

#[test]
fn every_mapping_is_released() {
    let sim = SimController::new();
    let mut ctrl = attach(&sim);
    let mut buffer = AlignedBuffer::zeroed(64 * 1024);

    // success
    ctrl.read_blocks(1, 0, &mut buffer).unwrap();
    // device error
    sim.fail_next(false, opcodes::NVM_WRITE, CompletionStatus::generic(generic_status::INTERNAL_ERROR));
    assert!(ctrl.write_blocks(1, 0, &buffer).is_err());
    // PRP list allocation failure after the buffer was mapped
    sim.fail_allocations(true);
    assert_eq!(ctrl.read_blocks(1, 0, &mut buffer), Err(NvmeError::OutOfResources));
    sim.fail_allocations(false);
    // timeout
    sim.hold_queue(1);
    let mut packet = CommandPacket::new(Command::read(1, 0, 1), QueueType::Io)
        .with_transfer(TransferBuffer::Writable(&mut buffer[..512]))
        .with_timeout(128);
    assert_eq!(ctrl.pass_thru(1, &mut packet), Err(NvmeError::Timeout));

    assert!(sim.maps_created() >= 4);
    assert_eq!(sim.live_mappings(), 0);
    assert_eq!(sim.unmatched_releases(), 0);
    // scratch region only
    assert_eq!(sim.live_allocations(), 1);
}

#[test]
fn device_addresses_differ_from_host_addresses() {
    let sim = SimController::new();
    let mut ctrl = attach(&sim);
    sim.clear_commands();

    let mut buffer = AlignedBuffer::zeroed(512);
    let host = buffer.as_ptr() as u64;
    ctrl.read_blocks(1, 0, &mut buffer).unwrap();
    let read = sim.io_commands(opcodes::NVM_READ)[0];
    assert_ne!(read.prp1, host);
    assert_eq!(read.prp2, 0);
}

#[test]
fn full_async_queue_pushes_back_without_mutation() {
    let sim = SimController::with_config(SimConfig { mqes: 3, ..Default::default() });
    let mut ctrl = attach(&sim);
    sim.hold_queue(2);

    let mut notified = Vec::new();
    for _ in 0..3 {
        let (seen, notifier) = recorder();
        ctrl.pass_thru_async(1, CommandPacket::new(Command::flush(1), QueueType::Io), notifier)
            .unwrap();
        notified.push(seen);
    }

    let tail = ctrl.queue(ASYNC_IO_QUEUE_ID).map(|q| q.sq_tail());
    let (rejected, notifier) = recorder();
    let result = ctrl.pass_thru_async(1, CommandPacket::new(Command::flush(1), QueueType::Io), notifier);
    assert_eq!(result, Err(NvmeError::NotReady));
    assert_eq!(ctrl.queue(ASYNC_IO_QUEUE_ID).map(|q| q.sq_tail()), tail);
    assert!(rejected.borrow().is_empty());
    assert_eq!(sim.pending_submissions(2), 3);

    sim.release_queue(2);
    ctrl.process_async_tasks();
    for seen in &notified {
        assert_eq!(seen.borrow().len(), 1);
        assert!(seen.borrow()[0].is_ok());
    }
    assert_eq!(ctrl.async_in_flight(), 0);
}

#[test]
fn phase_flips_once_per_ring_traversal() {
    let sim = SimController::with_config(SimConfig { mqes: 3, ..Default::default() });
    let mut ctrl = attach(&sim);
    let size = ctrl.queue(ASYNC_IO_QUEUE_ID).map_or(0, |q| q.size());
    assert_eq!(size, 4);

    let mut phases = Vec::new();
    for _ in 0..3 * size {
        let (seen, notifier) = recorder();
        ctrl.pass_thru_async(1, CommandPacket::new(Command::flush(1), QueueType::Io), notifier)
            .unwrap();
        ctrl.process_async_tasks();
        assert_eq!(seen.borrow().len(), 1);

        let queue = ctrl.queue(ASYNC_IO_QUEUE_ID).unwrap();
        assert!(queue.sq_tail() < size && queue.cq_head() < size);
        phases.push(queue.expected_phase());
    }

    let flips = phases.windows(2).filter(|w| w[0] != w[1]).count();
    // starts expecting phase 1, flips after completions 4, 8 and 12
    assert_eq!(flips, 3);
    assert!(!phases[3] && phases[7] && !phases[11]);
}

#[test]
fn async_completion_carries_device_status() {
    let sim = SimController::new();
    let mut ctrl = attach(&sim);
    let status = CompletionStatus::generic(generic_status::LBA_OUT_OF_RANGE);
    sim.fail_next(false, opcodes::NVM_READ, status);

    let buffer = AlignedBuffer::zeroed(512).leak();
    let packet = CommandPacket::new(Command::read(1, 0, 1), QueueType::Io)
        .with_transfer(TransferBuffer::Writable(buffer));
    let (seen, notifier) = recorder();
    ctrl.pass_thru_async(1, packet, notifier).unwrap();
    assert_eq!(sim.live_mappings(), 1);

    ctrl.process_async_tasks();
    assert_eq!(*seen.borrow(), [Err(NvmeError::DeviceError(status))]);
    assert_eq!(sim.live_mappings(), 0);
}

#[test]
fn async_admin_command_completes_before_returning() {
    let sim = SimController::new();
    let mut ctrl = attach(&sim);
    let buffer = AlignedBuffer::zeroed(4096).leak();
    let packet = CommandPacket::new(Command::identify_namespace(1), QueueType::Admin)
        .with_transfer(TransferBuffer::Writable(buffer));
    let (seen, notifier) = recorder();

    ctrl.pass_thru_async(1, packet, notifier).unwrap();
    assert_eq!(seen.borrow().len(), 1);
    assert!(seen.borrow()[0].is_ok());
    assert_eq!(ctrl.async_in_flight(), 0);
}

#[test]
fn shutdown_aborts_async_pass_thru() {
    let sim = SimController::new();
    let mut ctrl = attach(&sim);
    sim.hold_queue(2);

    let (seen, notifier) = recorder();
    ctrl.pass_thru_async(1, CommandPacket::new(Command::flush(1), QueueType::Io), notifier)
        .unwrap();
    drop(ctrl);
    assert_eq!(*seen.borrow(), [Err(NvmeError::DeviceNotReady)]);
    assert!(!sim.is_enabled());
    assert_eq!(sim.live_allocations(), 0);
}

#[test]
fn large_block_size_namespace() {
    let sim = SimController::with_config(SimConfig {
        namespaces: vec![SimNamespace::new(1, 256, 12)],
        ..Default::default()
    });
    let mut ctrl = attach(&sim);
    assert_eq!(ctrl.max_transfer_blocks(4096), 32);

    let data = AlignedBuffer::with_pattern(40 * 4096, |i| (i / 4096) as u8);
    ctrl.write_blocks(1, 200, &data).unwrap();
    let mut back = AlignedBuffer::zeroed(40 * 4096);
    ctrl.read_blocks(1, 200, &mut back).unwrap();
    assert_eq!(&back[..], &data[..]);
    ctrl.flush_blocks(1).unwrap();
}

#[test]
fn mdts_limit_applies_to_raw_pass_thru() {
    let sim = SimController::with_config(SimConfig { mdts: 1, ..Default::default() });
    let mut ctrl = attach(&sim);
    let mut buffer = AlignedBuffer::zeroed(32 * 512);
    let mut packet = CommandPacket::new(Command::read(1, 0, 32), QueueType::Io)
        .with_transfer(TransferBuffer::Writable(&mut buffer));
    assert_eq!(ctrl.pass_thru(1, &mut packet), Err(NvmeError::BufferTooSmall { max_transfer: 8192 }));

    // block I/O splits the same request instead
    sim.clear_commands();
    let mut buffer = AlignedBuffer::zeroed(32 * 512);
    ctrl.read_blocks(1, 0, &mut buffer).unwrap();
    assert_eq!(sim.io_commands(opcodes::NVM_READ).len(), 2);
}

#[test]
fn reinit_aborts_outstanding_async_work() {
    let sim = SimController::new();
    let mut ctrl = attach(&sim);

    // completed by the device, not yet reaped
    let (first, notifier) = recorder();
    ctrl.pass_thru_async(1, CommandPacket::new(Command::flush(1), QueueType::Io), notifier)
        .unwrap();
    assert_eq!(sim.pending_submissions(2), 0);

    ctrl.init().unwrap();
    assert_eq!(*first.borrow(), [Err(NvmeError::DeviceNotReady)]);
    assert_eq!(ctrl.async_in_flight(), 0);
    assert!(ctrl.namespaces().is_empty());
    assert_eq!(sim.live_mappings(), 0);

    assert_eq!(ctrl.discover_namespaces(), 1);
    let (second, notifier) = recorder();
    ctrl.pass_thru_async(1, CommandPacket::new(Command::flush(1), QueueType::Io), notifier)
        .unwrap();
    ctrl.process_async_tasks();
    assert_eq!(first.borrow().len(), 1);
    assert_eq!(second.borrow().len(), 1);
    assert!(second.borrow()[0].is_ok());
    assert_eq!(ctrl.async_in_flight(), 0);
}

#[test]
fn reinit_fails_queued_block_requests() {
    let sim = SimController::new();
    let mut ctrl = attach(&sim);
    sim.hold_queue(2);

    let buffer = AlignedBuffer::zeroed(4 * 512).leak();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    ctrl.read_blocks_async(1, 0, buffer, Box::new(move |result| sink.borrow_mut().push(result)))
        .unwrap();
    assert_eq!(ctrl.block_requests_pending(), 1);

    ctrl.init().unwrap();
    assert_eq!(*seen.borrow(), [Err(NvmeError::DeviceNotReady)]);
    assert_eq!(ctrl.block_requests_pending(), 0);
    assert!(!ctrl.namespace_busy(1));
    assert_eq!(sim.live_mappings(), 0);
}
