//! RFCOMM protocol constants
//!
//! Values follow TS 07.10 as profiled for Bluetooth RFCOMM.

use std::time::Duration;

// Frame types (control field with the P/F bit cleared)
pub const RFCOMM_SABM: u8 = 0x2F;
pub const RFCOMM_UA: u8 = 0x63;
pub const RFCOMM_DM: u8 = 0x0F;
pub const RFCOMM_DISC: u8 = 0x43;
pub const RFCOMM_UIH: u8 = 0xEF;

/// Poll/Final bit inside the control field
pub const RFCOMM_PF_BIT: u8 = 0x10;
/// Extended address / extended length bit
pub const RFCOMM_EA_BIT: u8 = 0x01;
/// Command/response bit inside address and MCC type octets
pub const RFCOMM_CR_BIT: u8 = 0x02;

// Multiplexer control command types (before shifting into the type octet)
pub const RFCOMM_PN: u8 = 0x20;
pub const RFCOMM_RPN: u8 = 0x24;
pub const RFCOMM_RLS: u8 = 0x14;
pub const RFCOMM_MSC: u8 = 0x38;
pub const RFCOMM_NSC: u8 = 0x04;
pub const RFCOMM_TEST: u8 = 0x08;
pub const RFCOMM_FCON: u8 = 0x28;
pub const RFCOMM_FCOFF: u8 = 0x18;

// PN convergence layer values
pub const RFCOMM_PN_CFC_REQUEST: u8 = 0xF0;
pub const RFCOMM_PN_CFC_ACCEPT: u8 = 0xE0;
pub const RFCOMM_PN_SIZE: usize = 8;
pub const RFCOMM_RPN_SIZE: usize = 8;

// RPN bit rates
pub const RFCOMM_RPN_BR_2400: u8 = 0x0;
pub const RFCOMM_RPN_BR_4800: u8 = 0x1;
pub const RFCOMM_RPN_BR_7200: u8 = 0x2;
pub const RFCOMM_RPN_BR_9600: u8 = 0x3;
pub const RFCOMM_RPN_BR_19200: u8 = 0x4;
pub const RFCOMM_RPN_BR_38400: u8 = 0x5;
pub const RFCOMM_RPN_BR_57600: u8 = 0x6;
pub const RFCOMM_RPN_BR_115200: u8 = 0x7;
pub const RFCOMM_RPN_BR_230400: u8 = 0x8;

pub const RFCOMM_RPN_DATA_8: u8 = 0x3;
pub const RFCOMM_RPN_STOP_1: u8 = 0;
pub const RFCOMM_RPN_PARITY_NONE: u8 = 0x0;
pub const RFCOMM_RPN_FLOW_NONE: u8 = 0x00;
pub const RFCOMM_RPN_XON_CHAR: u8 = 0x11;
pub const RFCOMM_RPN_XOFF_CHAR: u8 = 0x13;

/// Highest user channel number
pub const RFCOMM_MAX_CHANNEL: u8 = 30;
/// Largest payload the 15-bit length field can express
pub const RFCOMM_MAX_FRAME_PAYLOAD: usize = 0x7FFF;
/// Largest payload with a one octet length field
pub const RFCOMM_SHORT_LEN_MAX: usize = 0x7F;

pub const RFCOMM_DEFAULT_MTU: u16 = 127;
pub const RFCOMM_DEFAULT_CREDITS: u8 = 7;
pub const RFCOMM_MAX_CREDITS: u8 = 40;
/// Default cap on send credits held at once
pub const RFCOMM_MAX_TX_CREDITS: u16 = 255;
pub const RFCOMM_DEFAULT_PRIORITY: u8 = 7;
pub const RFCOMM_MAX_L2CAP_MTU: u16 = 1013;
/// Worst case header plus FCS overhead subtracted from the link MTU
pub const RFCOMM_HDR_OVERHEAD: u16 = 5;

/// Frames sent per DLC per pass when credit based flow control is off
pub const RFCOMM_NO_CFC_TX_BATCH: u16 = 5;

pub const RFCOMM_CONN_TIMEOUT: Duration = Duration::from_secs(30);
pub const RFCOMM_DISC_TIMEOUT: Duration = Duration::from_secs(20);
pub const RFCOMM_AUTH_TIMEOUT: Duration = Duration::from_secs(25);
pub const RFCOMM_IDLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default cap on bytes buffered per DLC before `send` reports backpressure
pub const RFCOMM_TX_QUEUE_LIMIT: usize = 64 * 1024;
/// Default cap on received bytes the owner has not read before the peer is paused
pub const RFCOMM_RX_QUEUE_LIMIT: usize = 64 * 1024;
pub const RFCOMM_MAX_SESSIONS: usize = 16;
