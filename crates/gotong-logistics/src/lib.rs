//! Peer transport for the Gotong cluster.
//!
//! Nodes talk over plain TCP using length-prefixed JSON [`Frame`]s. A node
//! serves its [`MethodTable`] through an [`RpcServer`] and reaches every other
//! node through one [`PeerLink`], which reconnects on its own and publishes
//! its up/down transitions.

mod error;
mod frame;
mod link;
mod server;
mod transport;

pub use error::NetError;
pub use frame::{Frame, MAX_FRAME_LEN, read_frame, write_frame};
pub use link::{LinkOptions, LinkState, PeerLink, Remote};
pub use server::{Handler, MethodTable, RpcListener, RpcServer};
pub use transport::TokioTransport;
