//! SIGP order codes and status-word bits.

/// Sense.
pub const SIGP_SENSE: u8 = 0x01;
/// External call.
pub const SIGP_EXTCALL: u8 = 0x02;
/// Emergency signal.
pub const SIGP_EMERGENCY: u8 = 0x03;
/// Start.
pub const SIGP_START: u8 = 0x04;
/// Stop.
pub const SIGP_STOP: u8 = 0x05;
/// Restart.
pub const SIGP_RESTART: u8 = 0x06;
/// Initial program reset.
pub const SIGP_IPR: u8 = 0x07;
/// Program reset.
pub const SIGP_PR: u8 = 0x08;
/// Stop and store status.
pub const SIGP_STOPSTORE: u8 = 0x09;
/// Initial microprogram load.
pub const SIGP_IMPL: u8 = 0x0A;
/// Initial CPU reset.
pub const SIGP_INITRESET: u8 = 0x0B;
/// CPU reset.
pub const SIGP_RESET: u8 = 0x0C;
/// Set prefix.
pub const SIGP_SETPREFIX: u8 = 0x0D;
/// Store status at address.
pub const SIGP_STORE: u8 = 0x0E;
/// Store extended status at address.
pub const SIGP_STOREX: u8 = 0x11;

/// Status bit 22: incorrect state.
pub const STATUS_INCORRECT_STATE: u32 = 0x0000_0200;
/// Status bit 23: invalid parameter.
pub const STATUS_INVALID_PARAMETER: u32 = 0x0000_0100;
/// Status bit 24: external call pending.
pub const STATUS_EXTERNAL_CALL_PENDING: u32 = 0x0000_0080;
/// Status bit 25: stopped.
pub const STATUS_STOPPED: u32 = 0x0000_0040;
/// Status bit 26: operator intervening.
pub const STATUS_OPERATOR_INTERVENING: u32 = 0x0000_0020;
/// Status bit 27: check stop.
pub const STATUS_CHECK_STOP: u32 = 0x0000_0010;
/// Status bit 29: inoperative.
pub const STATUS_INOPERATIVE: u32 = 0x0000_0004;
/// Status bit 30: invalid order.
pub const STATUS_INVALID_ORDER: u32 = 0x0000_0002;
/// Status bit 31: receiver check.
pub const STATUS_RECEIVER_CHECK: u32 = 0x0000_0001;
