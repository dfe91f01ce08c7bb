use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::simulation::error::CommunicationError;
use crate::simulation::messaging::messages::{ControlCommand, Message};

/// Participant of a simulation environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Address {
    Server,
    Worker(u32),
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Server => write!(f, "server"),
            Address::Worker(rank) => write!(f, "worker-{rank}"),
        }
    }
}

/// Point to point messaging between the participants. Receiving returns messages in the order
/// they were sent by one sender; there is no order between different senders.
pub trait SimCommunicator: Send {
    fn send(&self, to: Address, message: &Message) -> Result<(), CommunicationError>;

    /// Blocks until the next message arrives.
    fn receive(&self) -> Result<Message, CommunicationError>;

    /// Waits at most `timeout` for the next message.
    fn receive_timeout(&self, timeout: Duration) -> Result<Option<Message>, CommunicationError>;

    fn address(&self) -> Address;
}

/// In process communicator for participants running on threads. Messages are encoded, so the
/// receiver never shares memory with the sender.
pub struct ChannelSimCommunicator {
    address: Address,
    receiver: Receiver<Vec<u8>>,
    senders: HashMap<Address, Sender<Vec<u8>>>,
}

impl ChannelSimCommunicator {
    /// Creates a fully connected set of communicators for a server and `num_workers` workers.
    pub fn create_n_2_n(num_workers: u32) -> (ChannelSimCommunicator, Vec<ChannelSimCommunicator>) {
        let addresses: Vec<Address> = std::iter::once(Address::Server)
            .chain((0..num_workers).map(Address::Worker))
            .collect();

        let mut senders = HashMap::new();
        let mut receivers = Vec::new();
        for address in &addresses {
            let (sender, receiver) = channel();
            senders.insert(*address, sender);
            receivers.push((*address, receiver));
        }

        let mut comms: Vec<ChannelSimCommunicator> = receivers
            .into_iter()
            .map(|(address, receiver)| ChannelSimCommunicator {
                address,
                receiver,
                senders: senders.clone(),
            })
            .collect();
        let server = comms.remove(0);
        (server, comms)
    }

    /// Handle to send control commands to the server from outside the environment.
    pub fn control_handle(&self) -> Result<ControlHandle, CommunicationError> {
        let sender = self
            .senders
            .get(&Address::Server)
            .ok_or(CommunicationError::UnknownAddress(Address::Server))?;
        Ok(ControlHandle {
            sender: sender.clone(),
        })
    }
}

impl SimCommunicator for ChannelSimCommunicator {
    fn send(&self, to: Address, message: &Message) -> Result<(), CommunicationError> {
        let sender = self
            .senders
            .get(&to)
            .ok_or(CommunicationError::UnknownAddress(to))?;
        let bytes = message.serialize()?;
        trace!("{} sends {} bytes to {to}", self.address, bytes.len());
        sender
            .send(bytes)
            .map_err(|_| CommunicationError::Disconnected(to))
    }

    fn receive(&self) -> Result<Message, CommunicationError> {
        let bytes = self
            .receiver
            .recv()
            .map_err(|_| CommunicationError::Disconnected(self.address))?;
        Message::deserialize(&bytes)
    }

    fn receive_timeout(&self, timeout: Duration) -> Result<Option<Message>, CommunicationError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(bytes) => Message::deserialize(&bytes).map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(CommunicationError::Disconnected(self.address))
            }
        }
    }

    fn address(&self) -> Address {
        self.address
    }
}

/// Sends control commands to the server of a running environment.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    sender: Sender<Vec<u8>>,
}

impl ControlHandle {
    pub fn send(&self, command: ControlCommand) -> Result<(), CommunicationError> {
        self.send_message(&Message::Control(command))
    }

    /// Terminates the environment, even while a run is in progress.
    pub fn kill(&self) -> Result<(), CommunicationError> {
        self.send_message(&Message::Kill)
    }

    fn send_message(&self, message: &Message) -> Result<(), CommunicationError> {
        self.sender
            .send(message.serialize()?)
            .map_err(|_| CommunicationError::Disconnected(Address::Server))
    }
}
