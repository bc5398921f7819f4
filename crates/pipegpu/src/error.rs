use thiserror::Error;

use crate::backend::{BufferId, CsId};

/// Failures reported by a [`crate::backend::DeviceBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("device out of memory while allocating {what}")]
    OutOfMemory { what: &'static str },
    #[error("device lost")]
    DeviceLost,
    #[error("unknown buffer {0:?}")]
    UnknownBuffer(BufferId),
    #[error("unknown command stream {0:?}")]
    UnknownCommandStream(CsId),
    #[error("access of {len} bytes at offset {offset} is outside buffer {buffer:?} ({size} bytes)")]
    OutOfBounds {
        buffer: BufferId,
        offset: u64,
        len: u64,
        size: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CsError {
    #[error("`{atom}` wrote {written} dwords into a reservation of {reserved}")]
    Overrun {
        atom: &'static str,
        reserved: u32,
        written: u32,
    },
    #[error("command stream write outside of a begin/end frame")]
    NotInFrame,
    #[error("frame `{open}` is still open")]
    FrameOpen { open: &'static str },
    #[error("{requested} dwords requested but only {remaining} remain in the command stream")]
    Full { requested: usize, remaining: usize },
    #[error("a packet of {count} dwords cannot be encoded")]
    PacketSize { count: usize },
    #[error("no flush handler is bound to the command stream")]
    NoFlushHandler,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("failed to create {0}")]
    Allocation(&'static str),
    #[error("invalid argument: {0}")]
    BadArgument(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("draw needs a bound {0}")]
    MissingState(&'static str),
    #[error(transparent)]
    CommandStream(#[from] CsError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, ContextError>;
