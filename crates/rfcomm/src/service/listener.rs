//! Server channel registration

use std::fmt;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use crate::bdaddr::BdAddr;
use crate::error::{RfcommError, RfcommResult};
use crate::mux::Work;
use crate::types::SecurityLevel;

use super::handle::DlcHandle;

/// Decides whether an inbound DLC is accepted, given the peer and the channel
pub type AcceptFilter = Arc<dyn Fn(BdAddr, u8) -> bool + Send + Sync>;

/// Policy applied to inbound DLCs on a server channel
#[derive(Clone, Default)]
pub struct ListenPolicy {
    /// Minimum link security before the DLC is accepted
    pub min_security_level: SecurityLevel,
    /// Refuse the DLC with DM when this returns false
    pub filter: Option<AcceptFilter>,
}

impl fmt::Debug for ListenPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenPolicy")
            .field("min_security_level", &self.min_security_level)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

impl ListenPolicy {
    pub fn with_security(level: SecurityLevel) -> Self {
        Self {
            min_security_level: level,
            filter: None,
        }
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(BdAddr, u8) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }
}

/// A registered server channel.
///
/// Accepted DLCs are delivered once they are open. Dropping the listener
/// unregisters the channel; DLCs not yet accepted are closed.
pub struct Listener {
    local: BdAddr,
    channel: u8,
    backlog: Receiver<DlcHandle>,
    work_tx: Sender<Work>,
}

impl Listener {
    pub(crate) fn new(
        local: BdAddr,
        channel: u8,
        backlog: Receiver<DlcHandle>,
        work_tx: Sender<Work>,
    ) -> Self {
        Self {
            local,
            channel,
            backlog,
            work_tx,
        }
    }

    pub fn local(&self) -> BdAddr {
        self.local
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Block until the next inbound DLC is open
    pub fn accept(&self) -> RfcommResult<DlcHandle> {
        self.backlog.recv().map_err(|_| RfcommError::WorkerGone)
    }

    pub fn try_accept(&self) -> Option<DlcHandle> {
        self.backlog.try_recv().ok()
    }

    pub fn accept_timeout(&self, timeout: Duration) -> RfcommResult<DlcHandle> {
        self.backlog.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => RfcommError::Timeout,
            RecvTimeoutError::Disconnected => RfcommError::WorkerGone,
        })
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = self.work_tx.send(Work::Unlisten {
            local: self.local,
            channel: self.channel,
        });
    }
}
