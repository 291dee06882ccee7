//! RFCOMM multiplexer
//!
//! This module implements the protocol engine:
//! - Session and DLC state machines
//! - Credit based flow control
//! - The session registry shared with API callers
//! - The worker that serializes every state change

pub mod credit;
pub(crate) mod dlc;
pub(crate) mod engine;
pub mod registry;
pub(crate) mod session;

pub use self::credit::CreditFlow;
pub use self::dlc::DlcEvent;
pub use self::registry::SessionRegistry;

pub(crate) use self::dlc::DlcShared;
pub(crate) use self::engine::{Mux, OpenRequest, Work};
