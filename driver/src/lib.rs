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

//! NVM Express block driver for pre-boot firmware
//!
//! Brings an NVMe controller out of reset, runs an admin queue and two I/O
//! queues (one synchronous, one asynchronous), attaches namespaces and
//! exposes block I/O and security commands on top of them. Everything the
//! driver needs from the platform (register access, DMA, delays) comes in
//! through [`Platform`].

#![cfg_attr(not(test), no_std)]

pub mod block;
pub mod commands;
pub mod config;
pub mod controller;
pub mod device;
pub mod dma;
pub mod error;
pub mod mmio;
pub mod namespace;
pub mod passthru;
pub mod prp;
pub mod queue;
pub mod registers;
pub mod security;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod wait;

#[cfg(test)]
mod tests;

extern crate alloc;

pub use block::{BlockNotifier, MediaInfo};
pub use config::DriverConfig;
pub use controller::{Controller, Platform};
pub use device::{BlockDevice, NvmeBootDevice};
pub use error::{CompletionStatus, NvmeError};
pub use namespace::{Namespace, NamespaceIo};
pub use passthru::{BROADCAST_NAMESPACE, CommandPacket, Notifier, PassThruMode, TransferBuffer};
pub use queue::QueueType;
