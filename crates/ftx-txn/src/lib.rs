//! Transactions: lifecycle, manager, and the rollback (undo) log store.
//!
//! The pieces here correspond to the write-ahead transaction core's
//! in-memory half: the [`manager::TxnManager`] assigns ids and keeps the
//! MVCC structures consistent, [`txn::Txn`] carries one transaction's
//! state, and the `rollback`/`rollback_apply` modules persist and replay
//! per-transaction undo chains through the page cache.

pub mod logger;
pub mod manager;
pub mod rollback;
pub mod rollback_apply;
pub mod txn;

pub use logger::{Logger, LoggerOptions};
pub use manager::{GcState, ReferencedXidTuple, TxnManager, TxnStatusSnapshot};
pub use rollback::{ROLLBACK_CACHEFILE_NAME, RollEntry, RollbackLog};
pub use rollback_apply::RollbackTarget;
pub use txn::{
    OpenDictionary, ProgressPoll, Txn, TxnInfo, TxnProgress, abort_txn_with_lsn,
    commit_txn_with_lsn, complete_txn, maybe_fsync_log, prepare_txn,
};
