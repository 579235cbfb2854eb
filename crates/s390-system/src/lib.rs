//! The shared system block.
//!
//! One `SysBlk` is created per configuration and handed to every CPU by
//! `Arc`. It owns absolute storage, the interrupt lock and its condition
//! variable, the main-storage lock for interlocked updates, the TOD clock,
//! the SIGP signaling facility and the broadcast-purge descriptors. CPUs
//! refer to each other only by ordinal — the system block is the single
//! rendezvous point, never the CPU contexts themselves.
//!
//! Lock ordering: the interrupt lock is the outermost of the short-section
//! locks and must never be requested while holding the main-storage lock
//! (a broadcast wait with the main-storage lock held deadlocks against a
//! CS on another CPU).

mod sigp;
mod sysblk;
mod tod;

pub use sigp::{
    SIGP_EMERGENCY, SIGP_EXTCALL, SIGP_IMPL, SIGP_INITRESET, SIGP_IPR, SIGP_PR, SIGP_RESET,
    SIGP_RESTART, SIGP_SENSE, SIGP_SETPREFIX, SIGP_START, SIGP_STOP, SIGP_STOPSTORE, SIGP_STORE,
    SIGP_STOREX, STATUS_CHECK_STOP, STATUS_EXTERNAL_CALL_PENDING, STATUS_INCORRECT_STATE,
    STATUS_INOPERATIVE, STATUS_INVALID_ORDER, STATUS_INVALID_PARAMETER,
    STATUS_OPERATOR_INTERVENING, STATUS_RECEIVER_CHECK, STATUS_STOPPED,
};
pub use sysblk::{BroadcastKind, CpuSignals, CpuState, IntState, SysBlk, STATUS_BLOCK_LEN};
pub use tod::{tod_from_unix, TOD_1970};
