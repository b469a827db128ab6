//! Keeps track of the authentication keys handed to clients over the TCP
//! side channel. The fabric connection validates every application message
//! against this registry when client auth checking is enabled.

use crate::logging::{self, Logger};
use hashbrown::HashMap;
use std::sync::Mutex;

/// Map joining TCP client ids and auth keys. Accessed by the TCP thread
/// (register, disconnect) and the network thread (check), hence the mutex.
pub struct ClientRegistry {
    clients: Mutex<HashMap<u64, u64>>,
    log: Logger,
}

impl ClientRegistry {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> ClientRegistry {
        ClientRegistry {
            clients: Mutex::new(HashMap::new()),
            log: logging::child(log),
        }
    }

    /// Register a client and the key attached to its id.
    pub fn register_client(&self, id: u64, key: u64) {
        let mut clients = self.clients.lock().expect("Client registry lock poisoned");
        let previous = clients.insert(id, key);
        assert!(previous.is_none(), "Client id {} registered twice", id);
        logging::debug!(self.log, "registered client"; "id" => id);
    }

    /// Remove a client on disconnection.
    pub fn disconnect_client(&self, id: u64) {
        let mut clients = self.clients.lock().expect("Client registry lock poisoned");
        let removed = clients.remove(&id);
        assert!(removed.is_some(), "Disconnecting unknown client id {}", id);
        logging::debug!(self.log, "removed client"; "id" => id);
    }

    /// Check the identification pair attached to an incoming message.
    pub fn check_identification(&self, id: u64, key: u64) -> bool {
        let clients = self.clients.lock().expect("Client registry lock poisoned");
        clients.get(&id) == Some(&key)
    }
}
