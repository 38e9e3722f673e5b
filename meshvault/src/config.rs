use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::archive::MAX_OPEN_FILES;
use crate::piece::DEFAULT_PIECE_SIZE;
use crate::server::{MAX_ACTIVE_SERVLETS, MAX_OUTSTANDING_SERVLETS};

/// Everything a node needs to know about itself to start serving:
/// where its archive lives, what address it listens on, and the
/// capacity limits that bound how much work it takes on at once.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub archive_root: PathBuf,

    pub listen_address: SocketAddr,

    pub piece_size: u64,

    pub max_active_servlets: usize,

    pub max_outstanding_servlets: usize,

    pub max_open_files: usize,

    pub client_id: [u8; 16],
}

const DEFAULT_CLIENT_ID: [u8; 16] = *b"meshvault-node-0";

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            archive_root: PathBuf::from("archive"),
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 5881),
            piece_size: DEFAULT_PIECE_SIZE,
            max_active_servlets: MAX_ACTIVE_SERVLETS,
            max_outstanding_servlets: MAX_OUTSTANDING_SERVLETS,
            max_open_files: MAX_OPEN_FILES,
            client_id: DEFAULT_CLIENT_ID,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_caps() {
        let config = NodeConfig::default();
        assert_eq!(config.max_active_servlets, 8);
        assert_eq!(config.max_outstanding_servlets, 4);
        assert_eq!(config.max_open_files, 128);
        assert_eq!(config.piece_size, 131_072);
    }
}
