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

//! Namespace discovery
//!
//! Walks the namespace ids the controller reports, identifies each one and
//! records the active ones with their block geometry.

use alloc::{boxed::Box, format, string::String};
use log::{debug, info, warn};

use super::{
    block::MediaInfo,
    commands::{Command, IdentifyNamespace, as_bytes_mut, zeroed_box},
    controller::{Controller, Platform},
    error::{CompletionStatus, NvmeError, generic_status},
    passthru::{BROADCAST_NAMESPACE, CommandPacket, TransferBuffer},
    queue::QueueType,
};

/// Supported block size exponents (512 B to 64 KiB)
const LBADS_RANGE: core::ops::RangeInclusive<u8> = 9..=16;

/// An active namespace attached to a controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub nsid: u32,
    pub eui64: u64,
    pub block_size: u32,
    pub last_lba: u64,
    pub io_align: u32,
    /// `<serial>-<model>-<eui64>`
    pub name: String,
    pub media: MediaInfo,
}

impl<P: Platform> Controller<P> {
    /// Run Identify Namespace for `nsid`
    pub fn identify_namespace(&mut self, nsid: u32) -> Result<Box<IdentifyNamespace>, NvmeError> {
        let mut data = zeroed_box::<IdentifyNamespace>();
        let mut packet = CommandPacket::new(Command::identify_namespace(nsid), QueueType::Admin)
            .with_transfer(TransferBuffer::Writable(as_bytes_mut(&mut *data)));
        self.pass_thru(nsid, &mut packet)?;
        Ok(data)
    }

    /// Namespace id following `nsid`.
    ///
    /// [`BROADCAST_NAMESPACE`] starts the walk at namespace 1.
    /// [`NvmeError::NotFound`] marks the end of the walk.
    pub fn get_next_namespace(&mut self, nsid: u32) -> Result<u32, NvmeError> {
        self.ensure_active()?;
        let count = self.namespace_count();

        if nsid == BROADCAST_NAMESPACE {
            if count == 0 {
                return Err(NvmeError::NotFound);
            }
            return match self.identify_namespace(1) {
                Ok(_) => Ok(1),
                Err(err) => {
                    debug!("Identify of namespace 1 failed: {}", err);
                    Err(NvmeError::NotFound)
                }
            };
        }

        if nsid == 0 || nsid > count {
            return Err(NvmeError::InvalidParameter);
        }
        if nsid == count {
            return Err(NvmeError::NotFound);
        }
        self.identify_namespace(nsid + 1)?;
        Ok(nsid + 1)
    }

    /// Identify `nsid` and attach it
    pub fn enumerate_namespace(&mut self, nsid: u32) -> Result<&Namespace, NvmeError> {
        let data = self.identify_namespace(nsid)?;
        if data.ncap == 0 {
            debug!("Namespace {} is inactive", nsid);
            return Err(NvmeError::DeviceError(CompletionStatus::generic(generic_status::INVALID_NAMESPACE)));
        }

        let lbads = data.current_format().lbads;
        if !LBADS_RANGE.contains(&lbads) {
            warn!("Namespace {} uses unsupported block size 2^{}", nsid, lbads);
            return Err(NvmeError::Unsupported);
        }

        let block_size = data.lba_size();
        let last_lba = data.nsze.saturating_sub(1);
        let io_align = self.mode.io_align;
        let eui64 = data.eui64();
        let name = match self.identify_data() {
            Some(ctrl) => format!("{}-{}-{:x}", ctrl.serial_number(), ctrl.model_number(), eui64),
            None => format!("{:x}", eui64),
        };

        let namespace = Namespace {
            nsid,
            eui64,
            block_size,
            last_lba,
            io_align,
            name,
            media: MediaInfo {
                media_id: 0,
                block_size,
                last_block: last_lba,
                io_align,
                media_present: true,
                read_only: false,
                logical_partition: false,
                write_caching: false,
                removable: false,
            },
        };

        let index = match self.namespaces.iter().position(|ns| ns.nsid == nsid) {
            Some(index) => {
                self.namespaces[index] = namespace;
                index
            }
            None => {
                if self.namespaces.len() >= self.config.namespace_limit() {
                    warn!("Namespace table full, not attaching namespace {}", nsid);
                    return Err(NvmeError::OutOfResources);
                }
                self.namespaces.push(namespace).map_err(|_| NvmeError::OutOfResources)?;
                self.namespaces.len() - 1
            }
        };

        let attached = &self.namespaces[index];
        info!(
            "Namespace {}: {} blocks of {} bytes ({})",
            nsid,
            attached.media.block_count(),
            block_size,
            attached.name
        );
        Ok(attached)
    }

    /// Attach every active namespace, skipping the ones that fail to
    /// enumerate. Returns the number attached.
    pub fn discover_namespaces(&mut self) -> usize {
        let mut nsid = BROADCAST_NAMESPACE;
        loop {
            nsid = match self.get_next_namespace(nsid) {
                Ok(next) => next,
                Err(NvmeError::NotFound) => break,
                Err(err) => {
                    warn!("Namespace walk stopped after {}: {}", nsid, err);
                    break;
                }
            };
            if let Err(err) = self.enumerate_namespace(nsid) {
                warn!("Namespace {} not attached: {}", nsid, err);
            }
        }
        info!("{} namespace(s) attached", self.namespaces.len());
        self.namespaces.len()
    }

    pub fn namespaces(&self) -> &[Namespace] {
        &self.namespaces
    }

    pub fn namespace(&self, nsid: u32) -> Option<&Namespace> {
        self.namespaces.iter().find(|ns| ns.nsid == nsid)
    }

    /// Block and security access to one attached namespace
    pub fn namespace_io(&mut self, nsid: u32) -> Result<NamespaceIo<'_, P>, NvmeError> {
        self.ensure_active()?;
        if self.namespace(nsid).is_none() {
            return Err(NvmeError::NoMedia);
        }
        Ok(NamespaceIo { controller: self, nsid })
    }
}

/// Handle bound to one namespace of a controller
pub struct NamespaceIo<'a, P: Platform> {
    controller: &'a mut Controller<P>,
    nsid: u32,
}

impl<P: Platform> NamespaceIo<'_, P> {
    pub fn nsid(&self) -> u32 {
        self.nsid
    }

    pub fn media(&self) -> MediaInfo {
        self.controller.namespace(self.nsid).map(|ns| ns.media).unwrap_or_default()
    }

    pub fn read_blocks(&mut self, lba: u64, buffer: &mut [u8]) -> Result<(), NvmeError> {
        self.controller.read_blocks(self.nsid, lba, buffer)
    }

    pub fn write_blocks(&mut self, lba: u64, buffer: &[u8]) -> Result<(), NvmeError> {
        self.controller.write_blocks(self.nsid, lba, buffer)
    }

    pub fn flush_blocks(&mut self) -> Result<(), NvmeError> {
        self.controller.flush_blocks(self.nsid)
    }

    pub fn receive_data(
        &mut self,
        timeout: u64,
        protocol_id: u8,
        protocol_specific: u16,
        buffer: &mut [u8],
    ) -> Result<usize, NvmeError> {
        self.controller.receive_data(self.nsid, timeout, protocol_id, protocol_specific, buffer)
    }

    pub fn send_data(
        &mut self,
        timeout: u64,
        protocol_id: u8,
        protocol_specific: u16,
        buffer: &[u8],
    ) -> Result<(), NvmeError> {
        self.controller.send_data(self.nsid, timeout, protocol_id, protocol_specific, buffer)
    }
}
