mod queues;
mod session;

pub use queues::{DataSpecQueue, NoticeQueue, PieceSlot};
pub use session::{Peer, PeerError, PeerHandle};
