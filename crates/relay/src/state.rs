use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub conn_id: String,
    pub tx: mpsc::UnboundedSender<Message>,
}

/// Connected clients, keyed by connection id.
#[derive(Debug, Default)]
pub struct RelayState {
    clients: HashMap<String, ClientHandle>,
}

impl RelayState {
    pub fn add_client(&mut self, handle: ClientHandle) {
        self.clients.insert(handle.conn_id.clone(), handle);
    }

    pub fn remove_client(&mut self, conn_id: &str) -> Option<ClientHandle> {
        self.clients.remove(conn_id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Queue `text` for every connected client. Returns how many queues accepted it;
    /// a closed queue belongs to a connection that is already shutting down.
    pub fn broadcast(&self, text: &str) -> usize {
        self.clients
            .values()
            .filter(|handle| handle.tx.send(Message::Text(text.to_string())).is_ok())
            .count()
    }
}
