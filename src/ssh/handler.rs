use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use russh::client::{self, Msg, Session};
use russh::keys::PublicKey;
use russh::Channel;
use tokio::sync::mpsc;
use tracing::debug;

use crate::tunnel::TransportStream;

/// Routes peer-accepted connections to the remote tunnel that requested
/// the listening port.
pub type ForwardRoutes = Arc<Mutex<HashMap<u32, mpsc::Sender<TransportStream>>>>;

pub struct ClientHandler {
    routes: ForwardRoutes,
}

impl ClientHandler {
    pub fn new(routes: ForwardRoutes) -> Self {
        Self { routes }
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        // Accept all keys, like `ssh -o StrictHostKeyChecking=no`.
        // TODO: verify against known_hosts.
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            from = %format!("{}:{}", originator_address, originator_port),
            to = %format!("{}:{}", connected_address, connected_port),
            "forwarded connection"
        );

        let tx = self.routes.lock().unwrap().get(&connected_port).cloned();
        match tx {
            Some(tx) => {
                let stream: TransportStream = Box::new(channel.into_stream());
                if tx.try_send(stream).is_err() {
                    debug!(port = connected_port, "forward queue full or closed, dropping connection");
                }
            }
            None => {
                debug!(port = connected_port, "no tunnel registered for forwarded port");
            }
        }

        Ok(())
    }
}
