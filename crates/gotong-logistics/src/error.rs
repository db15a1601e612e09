use std::time::Duration;

use gotong_core::ClusterError;
use thiserror::Error;

/// Errors raised by the peer transport.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A frame announced a payload above [`crate::MAX_FRAME_LEN`].
    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),

    /// The connection ended while a frame or a reply was outstanding.
    #[error("connection closed")]
    Closed,

    /// No traffic arrived from the peer within the liveness timeout.
    #[error("peer silent for longer than {0:?}")]
    Silent(Duration),
}

impl From<NetError> for ClusterError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Closed => ClusterError::uninitialized("peer connection closed"),
            other => ClusterError::Transport(other.to_string()),
        }
    }
}
