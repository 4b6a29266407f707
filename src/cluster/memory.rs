//! Process-local fabric.
//!
//! A loopback implementation of [`Fabric`] for single-process clusters and
//! tests: every publication is delivered to every subscriber in the same
//! process, the publisher included, which mirrors how a real broker feeds
//! an instance its own publications.

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{ClusterError, Fabric, FabricEvent};

pub struct InProcessFabric {
    tx: broadcast::Sender<FabricEvent>,
}

impl InProcessFabric {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }
}

impl Default for InProcessFabric {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fabric for InProcessFabric {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), ClusterError> {
        // No subscribers is not an error; publications are fire-and-forget.
        let _ = self.tx.send(FabricEvent {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<FabricEvent> {
        self.tx.subscribe()
    }
}
