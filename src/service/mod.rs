pub mod daemon;
pub mod handler;
pub mod receiver;
pub mod sender;
pub mod session;

pub use daemon::QuickshareDaemon;
pub use handler::DirectoryHandler;
pub use receiver::{Receiver, TransferOutcome, TransferStarted};
pub use sender::{SendReport, Sender};
pub use session::{SessionState, TransferDirection, TransferSession};
