//! Flick: serverless file transfer between two devices on the same LAN.
//!
//! Devices broadcast their presence over UDP, connect directly over TCP
//! (TLS when both sides can, plain otherwise), and move one file at a
//! time through a pull-based chunk protocol where the receiver requests
//! every chunk in order.

pub mod discovery;
pub mod engine;
pub mod framer;
pub mod protocol;
pub mod session;
pub mod tls;
pub mod transport;
pub mod url;

pub use engine::{Direction, TransferDescriptor, TransferEngine};
pub use protocol::{FileMeta, Message};
pub use session::{ErrorKind, Event, Role, Session, SessionConfig};
pub use url::PeerDescriptor;
