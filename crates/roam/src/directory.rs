//! Directory-server client extension.
//!
//! The directory server itself is an external collaborator; this client
//! keeps a base registered with it and republishes a local table of the
//! peers the directory knows about. It doubles as the worked example of
//! the kind-handler extension point.

use crate::base::{Base, EnvelopeHandler};
use async_trait::async_trait;
use bytes::Bytes;
use roam_proto::{kind, Address, Envelope};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Maintains a local peer table from BASES envelopes and periodically
/// refreshes this base's registration with the directory server.
#[derive(Default)]
pub struct DirectoryClient {
    peers: Mutex<HashMap<String, Address>>,
}

impl DirectoryClient {
    /// Create a client with an empty peer table
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The peers last published by the directory server
    pub fn peers(&self) -> Vec<Address> {
        self.peers
            .lock()
            .expect("peer table lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Register the BASES handler on `base` and start the poller task.
    ///
    /// Every `interval` the poller re-announces BASE_ONLINE and requests
    /// GET_BASES from the configured directory server. The task ends when
    /// the base is dropped or no directory server is configured.
    pub async fn install(self: &Arc<Self>, base: &Arc<Base>, interval: Duration) -> JoinHandle<()> {
        base.add_kind_handler(kind::BASES, Arc::clone(self) as Arc<dyn EnvelopeHandler>)
            .await;

        let weak: Weak<Base> = Arc::downgrade(base);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let Some(base) = weak.upgrade() else { break };
                let Some(directory) = base.config().directory.clone() else {
                    break;
                };
                if !base.is_online().await {
                    continue;
                }
                let Some(address) = base.address().await else {
                    continue;
                };

                base.post(Envelope::new(
                    address.clone(),
                    directory.clone(),
                    kind::BASE_ONLINE,
                    "",
                    Bytes::new(),
                ));
                base.post(Envelope::new(
                    address,
                    directory,
                    kind::GET_BASES,
                    "",
                    Bytes::new(),
                ));
            }
        })
    }
}

#[async_trait]
impl EnvelopeHandler for DirectoryClient {
    async fn on_envelope(&self, envelope: &Envelope) {
        if !envelope.is_kind(kind::BASES) {
            return;
        }
        match rmp_serde::from_slice::<Vec<Address>>(&envelope.payload) {
            Ok(list) => {
                let mut peers = self.peers.lock().expect("peer table lock poisoned");
                peers.clear();
                for address in list {
                    peers.insert(address.to_string(), address);
                }
                debug!(count = peers.len(), "peer table updated");
            }
            Err(e) => warn!("malformed BASES payload: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn base_addr(port: u16) -> Address {
        Address::base(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[tokio::test]
    async fn test_bases_envelope_replaces_peer_table() {
        let client = DirectoryClient::new();
        assert!(client.peers().is_empty());

        let table = vec![base_addr(9000), base_addr(9001)];
        let payload = rmp_serde::to_vec(&table).unwrap();
        let envelope = Envelope::new(
            base_addr(7000),
            base_addr(9002),
            kind::BASES,
            "",
            Bytes::from(payload),
        );
        client.on_envelope(&envelope).await;
        assert_eq!(client.peers().len(), 2);

        let table = vec![base_addr(9000)];
        let payload = rmp_serde::to_vec(&table).unwrap();
        let envelope = Envelope::new(
            base_addr(7000),
            base_addr(9002),
            kind::BASES,
            "",
            Bytes::from(payload),
        );
        client.on_envelope(&envelope).await;
        assert_eq!(client.peers().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_ignored() {
        let client = DirectoryClient::new();
        let envelope = Envelope::new(
            base_addr(7000),
            base_addr(9002),
            kind::BASES,
            "",
            Bytes::from_static(&[0xC1]),
        );
        client.on_envelope(&envelope).await;
        assert!(client.peers().is_empty());
    }

    #[tokio::test]
    async fn test_other_kinds_are_ignored() {
        let client = DirectoryClient::new();
        let envelope = Envelope::new(
            base_addr(7000),
            base_addr(9002),
            kind::MESSAGE,
            "hello",
            Bytes::new(),
        );
        client.on_envelope(&envelope).await;
        assert!(client.peers().is_empty());
    }
}
