//! rfcomm - Bluetooth RFCOMM serial port emulation
//!
//! This library implements the RFCOMM protocol (a subset of TS 07.10) on
//! top of any reliable packet transport, typically an L2CAP channel:
//! - Frame and multiplexer control command codecs
//! - Session multiplexing with per channel credit based flow control
//! - Parameter, port and modem status negotiation
//! - A thread safe service API with blocking handles for each channel

pub mod bdaddr;
pub mod config;
pub mod constants;
pub mod error;
pub mod frame;
pub mod link;
pub mod mcc;
pub mod mux;
pub mod service;
pub mod types;

// Re-export common types for convenience
pub use bdaddr::BdAddr;
pub use config::RfcommConfig;
pub use error::{CloseReason, FrameError, McError, RfcommError, RfcommResult};
pub use frame::{Frame, FrameType};
pub use link::{Connector, Link, LinkNotifier};
pub use mcc::{McBody, McMessage, ModemSignals, ParamMask, PnParams, PortSettings};
pub use mux::{CreditFlow, DlcEvent, SessionRegistry};
pub use service::{AcceptFilter, DlcHandle, ListenPolicy, Listener, Rfcomm};
pub use types::{
    CfcMode, DlcId, DlcInfo, DlcOptions, DlcState, Dlci, SecurityLevel, SendStatus, SessionId,
    SessionInfo, SessionState,
};
