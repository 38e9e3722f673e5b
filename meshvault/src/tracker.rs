use std::net::SocketAddr;

use crate::filter::Filter;

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {
    #[error("tracker request failed: {0}")]
    Request(String),
}

pub type Result<T> = std::result::Result<T, TrackerError>;

/// Discovers other nodes worth connecting to. Deliberately just an
/// interface: the wire protocol a tracker speaks (HTTP, a DHT, a
/// rendezvous service) is out of scope here, and any implementation
/// can be plugged in as long as it can answer "who else is around".
#[async_trait::async_trait]
pub trait Tracker: Send + Sync {
    /// Returns addresses of peers worth connecting to for `filter`.
    async fn announce(&self, filter: &Filter) -> Result<Vec<SocketAddr>>;
}

/// A fixed, in-memory tracker. Useful for tests and for bring-up
/// before a real tracker integration exists.
pub struct StaticTracker {
    peers: Vec<SocketAddr>,
}

impl StaticTracker {
    pub fn new(peers: Vec<SocketAddr>) -> Self {
        Self { peers }
    }
}

#[async_trait::async_trait]
impl Tracker for StaticTracker {
    async fn announce(&self, _filter: &Filter) -> Result<Vec<SocketAddr>> {
        Ok(self.peers.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_tracker_returns_its_fixed_list() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let tracker = StaticTracker::new(vec![addr]);
        let peers = tracker.announce(&Filter::everything()).await.unwrap();
        assert_eq!(peers, vec![addr]);
    }
}
