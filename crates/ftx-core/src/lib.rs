//! Engine facade for the write-ahead transaction core.
//!
//! [`Engine`] owns the logger, cachetable, transaction manager, and
//! checkpoint coordinator, and exposes the embedder surface: begin,
//! prepare, commit, abort, dictionaries with point operations, manual and
//! scheduled checkpoints, and status export. Opening an engine on a
//! directory whose log lacks a clean shutdown runs crash recovery first.

pub mod dictionary;
pub mod engine;

pub use dictionary::Dictionary;
pub use engine::{Engine, EngineOptions, EngineStatus};

pub use ftx_checkpoint::CheckpointCaller;
pub use ftx_error::{FtxError, Result};
pub use ftx_txn::Txn;
pub use ftx_types::{SnapshotType, XaXid};
