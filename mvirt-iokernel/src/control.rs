//! Control channel between the control plane and the dataplane
//!
//! Two lrpc channels connect the threads: control plane to dataplane carries
//! `ADD_CLIENT` / `REMOVE_CLIENT`, dataplane to control plane carries
//! `CLIENT_REMOVED`. The payload word is a strong `Arc<Client>` reference
//! converted to a raw pointer; the typed wrappers here are the only code that
//! converts in either direction, so every reference put on the wire is taken
//! back off exactly once.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::lrpc::{self, LrpcError, LrpcReceiver, LrpcSender};

/// Control plane → dataplane: register a client
pub const DATAPLANE_ADD_CLIENT: u64 = 0;
/// Control plane → dataplane: unregister a client
pub const DATAPLANE_REMOVE_CLIENT: u64 = 1;
/// Dataplane → control plane: the client is no longer referenced
pub const CONTROL_PLANE_CLIENT_REMOVED: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    AddClient,
    RemoveClient,
    ClientRemoved,
    Unknown(u64),
}

impl From<u64> for ControlCommand {
    fn from(cmd: u64) -> Self {
        match cmd {
            DATAPLANE_ADD_CLIENT => ControlCommand::AddClient,
            DATAPLANE_REMOVE_CLIENT => ControlCommand::RemoveClient,
            CONTROL_PLANE_CLIENT_REMOVED => ControlCommand::ClientRemoved,
            other => ControlCommand::Unknown(other),
        }
    }
}

impl From<ControlCommand> for u64 {
    fn from(cmd: ControlCommand) -> u64 {
        match cmd {
            ControlCommand::AddClient => DATAPLANE_ADD_CLIENT,
            ControlCommand::RemoveClient => DATAPLANE_REMOVE_CLIENT,
            ControlCommand::ClientRemoved => CONTROL_PLANE_CLIENT_REMOVED,
            ControlCommand::Unknown(other) => other,
        }
    }
}

/// A decoded control message owning its client reference.
#[derive(Debug)]
pub enum ControlMsg {
    AddClient(Arc<Client>),
    RemoveClient(Arc<Client>),
    ClientRemoved(Arc<Client>),
    /// A command word this build does not understand
    Unknown { cmd: u64, payload: u64 },
}

impl ControlMsg {
    pub fn command(&self) -> ControlCommand {
        match self {
            ControlMsg::AddClient(_) => ControlCommand::AddClient,
            ControlMsg::RemoveClient(_) => ControlCommand::RemoveClient,
            ControlMsg::ClientRemoved(_) => ControlCommand::ClientRemoved,
            ControlMsg::Unknown { cmd, .. } => ControlCommand::Unknown(*cmd),
        }
    }

    fn into_wire(self) -> (u64, u64) {
        let cmd = self.command().into();
        let payload = match self {
            ControlMsg::AddClient(c) | ControlMsg::RemoveClient(c) | ControlMsg::ClientRemoved(c) => {
                Arc::into_raw(c) as u64
            }
            ControlMsg::Unknown { payload, .. } => payload,
        };
        (cmd, payload)
    }

    /// # Safety
    ///
    /// For known commands, `payload` must come from `into_wire` and must not
    /// be decoded twice.
    unsafe fn from_wire(cmd: u64, payload: u64) -> Self {
        let client = || unsafe { Arc::from_raw(payload as *const Client) };
        match ControlCommand::from(cmd) {
            ControlCommand::AddClient => ControlMsg::AddClient(client()),
            ControlCommand::RemoveClient => ControlMsg::RemoveClient(client()),
            ControlCommand::ClientRemoved => ControlMsg::ClientRemoved(client()),
            ControlCommand::Unknown(cmd) => ControlMsg::Unknown { cmd, payload },
        }
    }
}

/// Producer half of a control channel
pub struct ControlSender {
    inner: LrpcSender,
}

impl ControlSender {
    /// Send `msg`, handing it back when the channel is full.
    ///
    /// An `Unknown` message whose command word collides with a known command
    /// is refused, since its payload is not a client reference.
    pub fn send(&self, msg: ControlMsg) -> Result<(), ControlMsg> {
        if let ControlMsg::Unknown { cmd, .. } = msg
            && !matches!(ControlCommand::from(cmd), ControlCommand::Unknown(_))
        {
            return Err(msg);
        }
        let (cmd, payload) = msg.into_wire();
        if self.inner.send(cmd, payload) {
            Ok(())
        } else {
            // SAFETY: the words were produced by into_wire and never enqueued
            Err(unsafe { ControlMsg::from_wire(cmd, payload) })
        }
    }

    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }
}

/// Consumer half of a control channel
pub struct ControlReceiver {
    inner: LrpcReceiver,
}

impl ControlReceiver {
    /// Next message, if any.
    pub fn recv(&self) -> Option<ControlMsg> {
        let msg = self.inner.recv()?;
        // SAFETY: only ControlSender::send enqueues on this channel
        Some(unsafe { ControlMsg::from_wire(msg.cmd, msg.payload) })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Drop for ControlReceiver {
    fn drop(&mut self) {
        // Release client references still in flight
        while self.recv().is_some() {}
    }
}

/// Create a typed control channel of `capacity` messages.
pub fn channel(capacity: usize) -> Result<(ControlSender, ControlReceiver), LrpcError> {
    let (tx, rx) = lrpc::channel(capacity)?;
    Ok((ControlSender { inner: tx }, ControlReceiver { inner: rx }))
}

/// Dataplane end of the control channel pair
pub struct DataplaneLink {
    /// Add/remove requests from the control plane
    pub commands: ControlReceiver,
    /// Removal acknowledgements to the control plane
    pub notifications: ControlSender,
}

/// Create both directions and return the two ends.
pub fn control_channels(
    capacity: usize,
    max_clients: usize,
) -> Result<(ControlPlane, DataplaneLink), LrpcError> {
    let (cmd_tx, cmd_rx) = channel(capacity)?;
    let (note_tx, note_rx) = channel(capacity)?;
    let control = ControlPlane {
        commands: cmd_tx,
        notifications: note_rx,
        clients: Vec::new(),
        max_clients,
    };
    let link = DataplaneLink {
        commands: cmd_rx,
        notifications: note_tx,
    };
    Ok((control, link))
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("client limit of {0} reached")]
    ClientLimit(usize),

    #[error("control channel full")]
    ChannelFull,

    #[error("client {0} is not registered with the control plane")]
    NotFound(u32),

    #[error("removal of client {0} already requested")]
    AlreadyRemoving(u32),
}

/// Control plane end of the control channel pair.
///
/// Keeps its own reference to every client it registered. A client's
/// structures may only be torn down after the dataplane acknowledged its
/// removal, which [`poll_removals`](Self::poll_removals) observes.
pub struct ControlPlane {
    commands: ControlSender,
    notifications: ControlReceiver,
    clients: Vec<Arc<Client>>,
    max_clients: usize,
}

impl ControlPlane {
    /// Register `client` with the dataplane.
    pub fn add_client(&mut self, client: Arc<Client>) -> Result<(), ControlError> {
        if self.clients.len() >= self.max_clients {
            return Err(ControlError::ClientLimit(self.max_clients));
        }
        if self
            .commands
            .send(ControlMsg::AddClient(Arc::clone(&client)))
            .is_err()
        {
            error!(pid = client.pid(), "Failed to send ADD_CLIENT, control channel full");
            return Err(ControlError::ChannelFull);
        }
        info!(pid = client.pid(), mac = %client.mac(), threads = client.thread_count(), "Client registered");
        self.clients.push(client);
        Ok(())
    }

    /// Mark `client` removed and ask the dataplane to drop it.
    pub fn request_removal(&mut self, client: &Arc<Client>) -> Result<(), ControlError> {
        if !self.clients.iter().any(|c| Arc::ptr_eq(c, client)) {
            return Err(ControlError::NotFound(client.pid()));
        }
        if client.is_removed() {
            return Err(ControlError::AlreadyRemoving(client.pid()));
        }
        if self
            .commands
            .send(ControlMsg::RemoveClient(Arc::clone(client)))
            .is_err()
        {
            error!(pid = client.pid(), "Failed to send REMOVE_CLIENT, control channel full");
            return Err(ControlError::ChannelFull);
        }
        client.mark_removed();
        debug!(pid = client.pid(), "Client removal requested");
        Ok(())
    }

    /// Process removal acknowledgements from the dataplane.
    ///
    /// Returns the clients that are now released by both threads.
    pub fn poll_removals(&mut self) -> Vec<Arc<Client>> {
        let mut released = Vec::new();
        while let Some(msg) = self.notifications.recv() {
            match msg {
                ControlMsg::ClientRemoved(client) => {
                    if let Some(pos) = self.clients.iter().position(|c| Arc::ptr_eq(c, &client)) {
                        self.clients.swap_remove(pos);
                    } else {
                        warn!(pid = client.pid(), "Removal acknowledged for unknown client");
                    }
                    info!(pid = client.pid(), "Client removed");
                    released.push(client);
                }
                other => {
                    warn!(cmd = ?other.command(), "Unexpected message on notification channel");
                }
            }
        }
        released
    }

    /// Send an unrecognised command word to the dataplane.
    pub fn send_raw(&self, cmd: u64, payload: u64) -> Result<(), ControlError> {
        self.commands
            .send(ControlMsg::Unknown { cmd, payload })
            .map_err(|_| ControlError::ChannelFull)
    }

    pub fn clients(&self) -> &[Arc<Client>] {
        &self.clients
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::wire::EthernetAddress;

    fn client(pid: u32) -> Arc<Client> {
        let mac = EthernetAddress([0x02, 0, 0, 0, 0, pid as u8]);
        Arc::new(Client::new(pid, mac, 1, 4).unwrap().0)
    }

    #[test]
    fn test_command_codes() {
        for cmd in 0..4u64 {
            assert_eq!(u64::from(ControlCommand::from(cmd)), cmd);
        }
        assert_eq!(ControlCommand::from(2), ControlCommand::ClientRemoved);
        assert_eq!(ControlCommand::from(99), ControlCommand::Unknown(99));
    }

    #[test]
    fn test_reference_crosses_channel() {
        let (tx, rx) = channel(4).unwrap();
        let c = client(1);
        tx.send(ControlMsg::AddClient(Arc::clone(&c))).unwrap();
        assert_eq!(Arc::strong_count(&c), 2);

        match rx.recv() {
            Some(ControlMsg::AddClient(got)) => assert!(Arc::ptr_eq(&got, &c)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(Arc::strong_count(&c), 1);
    }

    #[test]
    fn test_full_channel_returns_message() {
        let (tx, _rx) = channel(1).unwrap();
        let c = client(1);
        tx.send(ControlMsg::RemoveClient(Arc::clone(&c))).unwrap();

        match tx.send(ControlMsg::RemoveClient(Arc::clone(&c))) {
            Err(ControlMsg::RemoveClient(back)) => assert!(Arc::ptr_eq(&back, &c)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(Arc::strong_count(&c), 2);
    }

    #[test]
    fn test_receiver_drop_releases_references() {
        let (tx, rx) = channel(4).unwrap();
        let c = client(1);
        tx.send(ControlMsg::AddClient(Arc::clone(&c))).unwrap();
        tx.send(ControlMsg::ClientRemoved(Arc::clone(&c))).unwrap();
        assert_eq!(Arc::strong_count(&c), 3);
        drop(rx);
        assert_eq!(Arc::strong_count(&c), 1);
    }

    #[test]
    fn test_unknown_cannot_forge_reference() {
        let (tx, rx) = channel(4).unwrap();
        assert!(
            tx.send(ControlMsg::Unknown {
                cmd: DATAPLANE_ADD_CLIENT,
                payload: 0xdead
            })
            .is_err()
        );
        tx.send(ControlMsg::Unknown { cmd: 77, payload: 1 }).unwrap();
        assert!(matches!(rx.recv(), Some(ControlMsg::Unknown { cmd: 77, payload: 1 })));
    }

    #[test]
    fn test_control_plane_limits() {
        let (mut control, _link) = control_channels(8, 2).unwrap();
        control.add_client(client(1)).unwrap();
        control.add_client(client(2)).unwrap();
        assert!(matches!(control.add_client(client(3)), Err(ControlError::ClientLimit(2))));
        assert_eq!(control.clients().len(), 2);
    }

    #[test]
    fn test_control_plane_channel_full() {
        let (mut control, _link) = control_channels(1, 8).unwrap();
        control.add_client(client(1)).unwrap();
        assert!(matches!(control.add_client(client(2)), Err(ControlError::ChannelFull)));
        assert_eq!(control.clients().len(), 1);
    }

    #[test]
    fn test_request_removal_marks_client() {
        let (mut control, link) = control_channels(8, 8).unwrap();
        let c = client(1);
        control.add_client(Arc::clone(&c)).unwrap();
        assert!(matches!(link.commands.recv(), Some(ControlMsg::AddClient(_))));

        control.request_removal(&c).unwrap();
        assert!(c.is_removed());
        assert!(matches!(
            control.request_removal(&c),
            Err(ControlError::AlreadyRemoving(1))
        ));
        assert!(matches!(link.commands.recv(), Some(ControlMsg::RemoveClient(_))));

        let stranger = client(9);
        assert!(matches!(
            control.request_removal(&stranger),
            Err(ControlError::NotFound(9))
        ));
    }

    #[test]
    fn test_poll_removals_releases_client() {
        let (mut control, link) = control_channels(8, 8).unwrap();
        let c = client(1);
        control.add_client(Arc::clone(&c)).unwrap();
        drop(link.commands.recv());

        link.notifications
            .send(ControlMsg::ClientRemoved(Arc::clone(&c)))
            .unwrap();
        let released = control.poll_removals();
        assert_eq!(released.len(), 1);
        assert!(control.clients().is_empty());
        drop(released);
        assert_eq!(Arc::strong_count(&c), 1);
    }
}
