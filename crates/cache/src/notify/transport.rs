// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use crate::error::Error;
use crate::notify::{ChangeEvent, Inbound, NotificationManager};
use tracing::warn;

/// Outbound sink for change events. Delivery to other processes ends in their
/// `NotificationManager::on_receive`.
pub trait NotificationTransport: Send + Sync {
    fn publish(&self, event: &ChangeEvent) -> Result<(), Error>;
}

/// Single-process deployments.
pub struct NullTransport;

impl NotificationTransport for NullTransport {
    fn publish(&self, _event: &ChangeEvent) -> Result<(), Error> {
        Ok(())
    }
}

/// Encodes events onto a channel, for wiring engines together in one process.
pub struct ChannelTransport {
    sender: flume::Sender<Vec<u8>>,
}

impl ChannelTransport {
    pub fn pair() -> (Self, flume::Receiver<Vec<u8>>) {
        let (sender, receiver) = flume::unbounded();
        (Self { sender }, receiver)
    }
}

impl NotificationTransport for ChannelTransport {
    fn publish(&self, event: &ChangeEvent) -> Result<(), Error> {
        self.sender
            .send(event.encode()?)
            .map_err(|_| Error::Shutdown)
    }
}

/// Hand every event already waiting on `inbound` to `manager`. Returns how many were applied.
/// Undecodable or unappliable events are logged and skipped.
pub fn drain_into(inbound: &flume::Receiver<Vec<u8>>, manager: &NotificationManager) -> usize {
    let mut applied = 0;
    for bytes in inbound.try_iter() {
        let event = match ChangeEvent::decode(&bytes) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable event");
                continue;
            }
        };
        match manager.on_receive(event) {
            Ok(Inbound::Applied { .. }) => applied += 1,
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to apply inbound event"),
        }
    }
    applied
}
