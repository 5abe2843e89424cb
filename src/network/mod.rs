pub mod announcer;
pub mod connection;
pub mod control;
pub mod protocol;
pub mod registry;

pub use announcer::Announcer;
pub use connection::ControlConnection;
pub use control::{send_control_offer, ControlServer, OfferDecision, OfferHandler};
pub use protocol::{Announcement, Chunk, ControlMessage, Offer};
pub use registry::{PeerKey, PeerRecord, PeerRegistry};
