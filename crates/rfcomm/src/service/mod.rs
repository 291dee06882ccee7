//! Public RFCOMM service
//!
//! [`Rfcomm`] owns the worker thread and hands out [`DlcHandle`]s for
//! outgoing channels and [`Listener`]s for server channels. Transports
//! report inbound links through [`Rfcomm::accept_link`].

pub mod handle;
pub mod listener;
#[cfg(test)]
mod tests;

pub use self::handle::DlcHandle;
pub use self::listener::{AcceptFilter, ListenPolicy, Listener};

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, info};

use crate::bdaddr::BdAddr;
use crate::config::RfcommConfig;
use crate::error::{RfcommError, RfcommResult};
use crate::link::{Connector, Link, LinkNotifier};
use crate::mux::{DlcShared, Mux, OpenRequest, SessionRegistry, Work};
use crate::types::{DlcId, DlcInfo, DlcOptions, SessionInfo};

/// Build a handle and the matching open request
pub(crate) fn open_request(
    work_tx: &Sender<Work>,
    registry: &Arc<SessionRegistry>,
    config: &RfcommConfig,
    local: BdAddr,
    remote: BdAddr,
    channel: u8,
    options: DlcOptions,
) -> (DlcHandle, Work, Receiver<RfcommResult<()>>) {
    let id = registry.next_dlc_id();
    let shared = Arc::new(DlcShared::new(config.rx_queue_limit));
    let (events_tx, events_rx) = mpsc::channel();
    let (reply_tx, reply_rx) = mpsc::channel();

    let handle = DlcHandle::new(
        id,
        channel,
        local,
        remote,
        Arc::clone(&shared),
        events_rx,
        work_tx.clone(),
        Arc::clone(registry),
        config.tx_queue_limit,
    );
    let work = Work::Open {
        request: OpenRequest {
            id,
            local,
            remote,
            channel,
            options,
            shared,
            events: events_tx,
        },
        reply: reply_tx,
    };
    (handle, work, reply_rx)
}

/// The RFCOMM layer
pub struct Rfcomm {
    config: RfcommConfig,
    registry: Arc<SessionRegistry>,
    work_tx: Sender<Work>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Rfcomm {
    /// Start the worker. Outbound transports are opened through `connector`.
    pub fn new(config: RfcommConfig, connector: Arc<dyn Connector>) -> RfcommResult<Self> {
        config.validate()?;

        let registry = Arc::new(SessionRegistry::new());
        let (work_tx, work_rx) = mpsc::channel();
        let mux = Mux::new(
            config.clone(),
            Arc::clone(&registry),
            connector,
            work_tx.clone(),
        );
        let worker = thread::Builder::new()
            .name("rfcomm".into())
            .spawn(move || mux.run(work_rx))?;
        info!("RFCOMM service started");

        Ok(Self {
            config,
            registry,
            work_tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn config(&self) -> &RfcommConfig {
        &self.config
    }

    fn post(&self, work: Work) -> RfcommResult<()> {
        self.work_tx.send(work).map_err(|_| RfcommError::WorkerGone)
    }

    /// Open a DLC to `channel` on `remote` with default options
    pub fn open(&self, local: BdAddr, remote: BdAddr, channel: u8) -> RfcommResult<DlcHandle> {
        self.open_with(local, remote, channel, DlcOptions::default())
    }

    /// Open a DLC.
    ///
    /// Returns as soon as the request is accepted; a session is created and
    /// connected if none exists to `remote`. Wait for
    /// [`DlcEvent::Connected`](crate::DlcEvent::Connected) before sending.
    pub fn open_with(
        &self,
        local: BdAddr,
        remote: BdAddr,
        channel: u8,
        options: DlcOptions,
    ) -> RfcommResult<DlcHandle> {
        let (handle, work, reply) = open_request(
            &self.work_tx,
            &self.registry,
            &self.config,
            local,
            remote,
            channel,
            options,
        );
        self.post(work)?;
        reply.recv().map_err(|_| RfcommError::WorkerGone)??;
        debug!("{}: opening channel {} on {}", handle.id(), channel, remote);
        Ok(handle)
    }

    /// Register a server channel on `local` (`BdAddr::ANY` for every adapter)
    pub fn listen(
        &self,
        local: BdAddr,
        channel: u8,
        policy: ListenPolicy,
    ) -> RfcommResult<Listener> {
        let (backlog_tx, backlog_rx) = mpsc::channel();
        let (reply_tx, reply_rx) = mpsc::channel();
        self.post(Work::Listen {
            local,
            channel,
            policy,
            backlog: backlog_tx,
            reply: reply_tx,
        })?;
        reply_rx.recv().map_err(|_| RfcommError::WorkerGone)??;
        Ok(Listener::new(local, channel, backlog_rx, self.work_tx.clone()))
    }

    /// Whether inbound transports to `local` would be served
    pub fn is_listening(&self, local: &BdAddr) -> bool {
        self.registry.is_listening(local)
    }

    /// Hand an inbound transport to RFCOMM.
    ///
    /// The returned notifier must be used for every event on `link`. The
    /// link is shut down if no listener covers `local`.
    pub fn accept_link(
        &self,
        local: BdAddr,
        remote: BdAddr,
        link: Arc<dyn Link>,
    ) -> RfcommResult<LinkNotifier> {
        let session = self.registry.next_session_id();
        self.post(Work::LinkAccepted {
            session,
            local,
            remote,
            link,
        })?;
        Ok(LinkNotifier::new(session, self.work_tx.clone()))
    }

    /// Snapshot of every session
    pub fn connection_list(&self) -> Vec<SessionInfo> {
        self.registry.connection_list()
    }

    pub fn connection_info(&self, local: &BdAddr, remote: &BdAddr) -> Option<SessionInfo> {
        self.registry.connection_info(local, remote)
    }

    pub fn dlc_info(&self, id: DlcId) -> Option<DlcInfo> {
        self.registry.dlc_info(id)
    }

    /// Close every session and stop the worker
    pub fn shutdown(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return;
        };
        let _ = self.work_tx.send(Work::Shutdown);
        if worker.join().is_err() {
            log::error!("RFCOMM worker panicked");
        }
        info!("RFCOMM service stopped");
    }
}

impl Drop for Rfcomm {
    fn drop(&mut self) {
        self.shutdown();
    }
}
