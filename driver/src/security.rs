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

//! Security Send / Security Receive
//!
//! Tunnels security protocol payloads (TCG, IEEE 1667, ...) to a namespace
//! through the admin queue.

use log::debug;

use super::{
    commands::Command,
    controller::{Controller, Platform},
    error::NvmeError,
    passthru::{CommandPacket, TransferBuffer},
    queue::QueueType,
};

impl<P: Platform> Controller<P> {
    /// Issue Security Send (`send`) or Security Receive for `nsid`.
    ///
    /// The protocol specific field goes out big-endian. Returns the number
    /// of bytes moved, which for a receive is the whole buffer.
    pub fn trust_transfer(
        &mut self,
        nsid: u32,
        send: bool,
        protocol_id: u8,
        protocol_specific: u16,
        transfer: TransferBuffer<'_>,
        timeout: u64,
    ) -> Result<usize, NvmeError> {
        let len = transfer.len();
        let length = u32::try_from(len).map_err(|_| NvmeError::InvalidParameter)?;
        let command = Command::security(send, nsid, protocol_id, protocol_specific, length);
        let mut packet = CommandPacket::new(command, QueueType::Admin)
            .with_transfer(transfer)
            .with_timeout(timeout);

        self.pass_thru(nsid, &mut packet)?;
        debug!(
            "Security {} protocol {:#04x}/{:#06x}: {} bytes",
            if send { "send" } else { "receive" },
            protocol_id,
            protocol_specific,
            len
        );
        Ok(len)
    }

    /// Receive a security protocol payload from namespace `nsid` into
    /// `buffer`; returns the transferred length
    pub fn receive_data(
        &mut self,
        nsid: u32,
        timeout: u64,
        protocol_id: u8,
        protocol_specific: u16,
        buffer: &mut [u8],
    ) -> Result<usize, NvmeError> {
        self.check_security_target(nsid)?;
        self.trust_transfer(nsid, false, protocol_id, protocol_specific, TransferBuffer::Writable(buffer), timeout)
    }

    /// Send a security protocol payload to namespace `nsid`
    pub fn send_data(
        &mut self,
        nsid: u32,
        timeout: u64,
        protocol_id: u8,
        protocol_specific: u16,
        buffer: &[u8],
    ) -> Result<(), NvmeError> {
        self.check_security_target(nsid)?;
        self.trust_transfer(nsid, true, protocol_id, protocol_specific, TransferBuffer::Readable(buffer), timeout)
            .map(|_| ())
    }

    fn check_security_target(&self, nsid: u32) -> Result<(), NvmeError> {
        self.ensure_active()?;
        match self.namespace(nsid) {
            Some(ns) if ns.media.media_present => Ok(()),
            _ => Err(NvmeError::NoMedia),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::DriverConfig,
        controller::Controller,
        error::NvmeError,
        passthru::TransferBuffer,
        registers::opcodes,
        sim::{AlignedBuffer, SimController},
    };

    fn attach(sim: &SimController) -> Controller<SimController> {
        let mut ctrl = Controller::new(sim.clone(), 0xFEB0_0000, DriverConfig::default()).unwrap();
        ctrl.discover_namespaces();
        ctrl
    }

    #[test]
    fn receive_fills_buffer_and_reports_length() {
        let sim = SimController::new();
        sim.set_security_response(b"TCG level 0 discovery");
        let mut ctrl = attach(&sim);
        sim.clear_commands();

        let mut buffer = AlignedBuffer::zeroed(512);
        assert_eq!(ctrl.receive_data(1, 0, 0x01, 0x0001, &mut buffer), Ok(512));
        assert_eq!(&buffer[..21], b"TCG level 0 discovery");

        let command = sim.commands()[0];
        assert_eq!(command.queue_id, 0);
        assert_eq!(command.opcode, opcodes::ADMIN_SECURITY_RECEIVE);
        assert_eq!(command.cdw10, 0x0101_0000);
        assert_eq!(command.cdw11, 512);
        assert_eq!(sim.live_mappings(), 0);
    }

    #[test]
    fn send_transfers_payload() {
        let sim = SimController::new();
        let mut ctrl = attach(&sim);
        let payload = AlignedBuffer::with_pattern(64, |i| i as u8);
        ctrl.send_data(1, 0, 0xEE, 0x1234, &payload).unwrap();
        assert_eq!(sim.security_sent(), &payload[..]);
        assert_eq!(sim.commands().last().map(|c| c.cdw10), Some(0xEE34_1200));
    }

    #[test]
    fn receive_into_readonly_buffer_is_rejected() {
        let sim = SimController::new();
        let mut ctrl = attach(&sim);
        let buffer = AlignedBuffer::zeroed(512);
        let result = ctrl.trust_transfer(1, false, 1, 0, TransferBuffer::Readable(&buffer), 0);
        assert_eq!(result, Err(NvmeError::InvalidParameter));
    }

    #[test]
    fn absent_namespace_has_no_media() {
        let sim = SimController::new();
        let mut ctrl = attach(&sim);
        let mut buffer = AlignedBuffer::zeroed(512);
        assert_eq!(ctrl.receive_data(2, 0, 1, 0, &mut buffer), Err(NvmeError::NoMedia));
    }
}
