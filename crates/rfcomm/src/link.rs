//! Transport abstraction
//!
//! RFCOMM runs over a reliable, ordered, packet based link (an L2CAP channel
//! on PSM 3). The multiplexer only needs to write whole frames to it and to
//! be told when frames arrive, when security changes and when it goes away.

use std::io;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::bdaddr::BdAddr;
use crate::mux::Work;
use crate::types::{SecurityLevel, SessionId};

/// An established transport connection carrying one session
pub trait Link: Send + Sync {
    /// Write one complete RFCOMM frame
    fn send(&self, frame: &[u8]) -> io::Result<()>;

    /// Largest packet the link accepts
    fn mtu(&self) -> u16;

    /// Security level currently in force
    fn security_level(&self) -> SecurityLevel;

    /// Ask for the link to be raised to `level`.
    ///
    /// Returns true when the level is already satisfied. Otherwise the
    /// outcome is reported later through [`LinkNotifier::security_changed`].
    fn request_security(&self, level: SecurityLevel) -> bool;

    /// Tear the link down. Must not call back into the notifier.
    fn shutdown(&self);
}

/// Opens outbound transport connections.
///
/// `connect` may block; it is always called from a dedicated thread, never
/// from the worker.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        local: BdAddr,
        remote: BdAddr,
        notifier: LinkNotifier,
    ) -> io::Result<Arc<dyn Link>>;
}

/// Handle given to a transport for reporting events on a session.
///
/// Every method only enqueues work for the RFCOMM worker, so it may be
/// called from any thread.
#[derive(Clone)]
pub struct LinkNotifier {
    session: SessionId,
    tx: Sender<Work>,
}

impl LinkNotifier {
    pub(crate) fn new(session: SessionId, tx: Sender<Work>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// A frame was received
    pub fn data_ready(&self, frame: Vec<u8>) {
        self.post(Work::LinkData {
            session: self.session,
            data: frame,
        });
    }

    /// A security upgrade requested through [`Link::request_security`] finished
    pub fn security_changed(&self, success: bool) {
        self.post(Work::SecurityChanged {
            session: self.session,
            success,
        });
    }

    /// The link was closed by the peer or failed
    pub fn closed(&self) {
        self.post(Work::LinkClosed {
            session: self.session,
        });
    }

    pub(crate) fn post(&self, work: Work) {
        if self.tx.send(work).is_err() {
            log::debug!("{}: RFCOMM worker gone, dropping link event", self.session);
        }
    }
}
