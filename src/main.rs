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

//! Host-side runner: attaches the driver to the software controller and runs
//! the block and security self tests.

use std::{cell::Cell, process::ExitCode, rc::Rc, thread, time::Duration};

use log::{LevelFilter, Log, Metadata, Record, error, info, warn};
use nvme_driver::{
    BlockDevice, DriverConfig, NvmeBootDevice, NvmeError,
    config::ASYNC_POLL_INTERVAL_US,
    error::{CompletionStatus, generic_status},
    sim::{AlignedBuffer, SimController},
};

/// Register window the software controller answers on
const SIM_MMIO_BASE: u64 = 0xFEB0_0000;

/// Async ticks to wait for the async read before giving up
const ASYNC_TICK_LIMIT: u32 = 1000;

/// TCG security protocol 1, level 0 discovery
const SECURITY_PROTOCOL: u8 = 0x01;
const SECURITY_COM_ID: u16 = 0x0001;

struct StdoutLogger;

impl Log for StdoutLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let prefix = match record.level() {
            log::Level::Error => "\x1B[31mERROR:\x1B[0m",
            log::Level::Warn => "\x1B[33mWARN:\x1B[0m",
            log::Level::Info => "\x1B[32mINFO:\x1B[0m",
            log::Level::Debug => "\x1B[32mDEBUG:\x1B[0m",
            log::Level::Trace => "\x1B[36mTRACE:\x1B[0m",
        };
        println!("{} {}", prefix, record.args());
    }

    fn flush(&self) {}
}

static LOGGER: StdoutLogger = StdoutLogger;

/// Most verbose level enabled through the `log-*` features
fn max_level() -> LevelFilter {
    if cfg!(feature = "log-trace") {
        LevelFilter::Trace
    } else if cfg!(feature = "log-debug") {
        LevelFilter::Debug
    } else if cfg!(feature = "log-info") {
        LevelFilter::Info
    } else if cfg!(feature = "log-warn") {
        LevelFilter::Warn
    } else if cfg!(feature = "log-error") {
        LevelFilter::Error
    } else {
        LevelFilter::Off
    }
}

fn main() -> ExitCode {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(max_level());
    }

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("NVMe self test failed: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), NvmeError> {
    let sim = SimController::new();
    sim.set_security_response(b"nvmeboot level 0 discovery");

    let mut device = NvmeBootDevice::new();
    device.initialize(sim, SIM_MMIO_BASE, DriverConfig::default())?;
    if device.device_count() == 0 {
        warn!("No NVMe namespaces available for testing");
        return Err(NvmeError::NotFound);
    }

    let result = test_nvme_io(&mut device).and_then(|()| test_async_read(&mut device))
        .and_then(|()| test_security(&mut device));
    device.deinitialize();
    result
}

fn test_nvme_io(device: &mut NvmeBootDevice<SimController>) -> Result<(), NvmeError> {
    info!("Starting NVMe I/O test");

    let media = device.media_info(0)?;
    info!(
        "Testing with device 0, {} blocks of {} bytes",
        media.block_count(),
        media.block_size
    );
    let block_size = media.block_size as usize;

    info!("Test 1: Reading from LBA 0");
    let mut read_buffer = AlignedBuffer::zeroed(block_size);
    device.read_blocks(0, 0, &mut read_buffer)?;
    info!("Successfully read {} bytes from LBA 0", block_size);

    info!("First 64 bytes of LBA 0:");
    for (row, bytes) in read_buffer[..64.min(block_size)].chunks(16).enumerate() {
        let hex: String = bytes.iter().map(|b| format!("{:02x} ", b)).collect();
        info!("  {:04x}: {}", row * 16, hex);
    }

    info!("Test 2: Writing test pattern to LBA 1");
    let write_buffer = AlignedBuffer::with_pattern(block_size, |i| (i % 256) as u8);
    device.write_blocks(0, 1, &write_buffer)?;
    info!("Successfully wrote {} bytes to LBA 1", block_size);

    info!("Test 3: Reading back LBA 1 to verify");
    let mut verify_buffer = AlignedBuffer::zeroed(block_size);
    device.read_blocks(0, 1, &mut verify_buffer)?;

    let mut mismatches = 0;
    for (offset, (wrote, read)) in write_buffer.iter().zip(verify_buffer.iter()).enumerate() {
        if wrote != read {
            mismatches += 1;
            if mismatches <= 10 {
                warn!("Mismatch at offset {}: wrote {:02x}, read {:02x}", offset, wrote, read);
            }
        }
    }

    if mismatches == 0 {
        info!("Verification successful! All {} bytes match", block_size);
    } else {
        warn!("Verification failed! {} mismatches found", mismatches);
        return Err(NvmeError::DeviceError(CompletionStatus::generic(generic_status::DATA_TRANSFER_ERROR)));
    }

    if let Some(controller) = device.controller_mut() {
        if let Some(nsid) = controller.namespaces().first().map(|ns| ns.nsid) {
            controller.flush_blocks(nsid)?;
        }
    }
    info!("NVMe I/O test completed successfully");
    Ok(())
}

fn test_async_read(device: &mut NvmeBootDevice<SimController>) -> Result<(), NvmeError> {
    let controller = device.controller_mut().ok_or(NvmeError::DeviceNotReady)?;
    let (nsid, media) = controller
        .namespaces()
        .first()
        .map(|ns| (ns.nsid, ns.media))
        .ok_or(NvmeError::NotFound)?;

    let blocks = (controller.max_transfer_blocks(media.block_size) as u64 + 1).min(media.block_count());
    let len = blocks as usize * media.block_size as usize;
    info!("Test 4: Async read of {} blocks from LBA 0", blocks);

    let done: Rc<Cell<Option<Result<(), NvmeError>>>> = Rc::new(Cell::new(None));
    let sink = done.clone();
    let buffer = AlignedBuffer::zeroed(len).leak();
    controller.read_blocks_async(nsid, 0, buffer, Box::new(move |result| sink.set(Some(result))))?;

    for _ in 0..ASYNC_TICK_LIMIT {
        if let Some(result) = done.take() {
            result?;
            info!("Async read completed");
            return Ok(());
        }
        thread::sleep(Duration::from_micros(ASYNC_POLL_INTERVAL_US));
        controller.process_async_tasks();
    }

    warn!("Async read did not complete after {} ticks", ASYNC_TICK_LIMIT);
    Err(NvmeError::Timeout)
}

fn test_security(device: &mut NvmeBootDevice<SimController>) -> Result<(), NvmeError> {
    let controller = device.controller_mut().ok_or(NvmeError::DeviceNotReady)?;
    let nsid = controller.namespaces().first().map(|ns| ns.nsid).ok_or(NvmeError::NotFound)?;

    let mut buffer = AlignedBuffer::zeroed(512);
    let received = controller
        .namespace_io(nsid)?
        .receive_data(0, SECURITY_PROTOCOL, SECURITY_COM_ID, &mut buffer)?;
    let text = buffer.split(|&b| b == 0).next().unwrap_or_default();
    info!(
        "Security receive: {} bytes, payload \"{}\"",
        received,
        String::from_utf8_lossy(text)
    );
    Ok(())
}
