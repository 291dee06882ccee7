//! User side of a DLC

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bdaddr::BdAddr;
use crate::error::{CloseReason, RfcommError, RfcommResult};
use crate::mcc::{ModemSignals, ParamMask, PortSettings};
use crate::mux::{DlcEvent, DlcShared, SessionRegistry, Work};
use crate::types::{DlcId, DlcInfo, DlcState, SendStatus};

/// An RFCOMM data link connection.
///
/// Received data and state changes arrive as [`DlcEvent`]s. Dropping the
/// handle closes the DLC.
pub struct DlcHandle {
    id: DlcId,
    channel: u8,
    local: BdAddr,
    remote: BdAddr,
    shared: Arc<DlcShared>,
    events: Receiver<DlcEvent>,
    work_tx: Sender<Work>,
    registry: Arc<SessionRegistry>,
    tx_queue_limit: usize,
}

impl DlcHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: DlcId,
        channel: u8,
        local: BdAddr,
        remote: BdAddr,
        shared: Arc<DlcShared>,
        events: Receiver<DlcEvent>,
        work_tx: Sender<Work>,
        registry: Arc<SessionRegistry>,
        tx_queue_limit: usize,
    ) -> Self {
        Self {
            id,
            channel,
            local,
            remote,
            shared,
            events,
            work_tx,
            registry,
            tx_queue_limit,
        }
    }

    pub fn id(&self) -> DlcId {
        self.id
    }

    /// Server channel number
    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn local(&self) -> BdAddr {
        self.local
    }

    pub fn remote(&self) -> BdAddr {
        self.remote
    }

    pub fn state(&self) -> DlcState {
        self.shared.state()
    }

    /// Negotiated maximum payload per frame
    pub fn mtu(&self) -> u16 {
        self.shared.mtu()
    }

    /// Why the DLC closed, once it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason()
    }

    /// Snapshot of the worker's view of this DLC
    pub fn info(&self) -> Option<DlcInfo> {
        self.registry.dlc_info(self.id)
    }

    fn post(&self, work: Work) -> RfcommResult<()> {
        self.work_tx.send(work).map_err(|_| RfcommError::WorkerGone)
    }

    fn closed_error(&self) -> RfcommError {
        self.shared
            .close_reason()
            .map_or(RfcommError::NotConnected, RfcommError::from)
    }

    fn check_usable(&self) -> RfcommResult<()> {
        match self.shared.state() {
            DlcState::Open => Ok(()),
            DlcState::Closed => Err(self.closed_error()),
            _ => Err(RfcommError::NotConnected),
        }
    }

    /// Queue data for transmission.
    ///
    /// Data larger than the MTU is split into several frames. When the
    /// transmit queue is full nothing is queued and `Backpressure` is
    /// returned; a [`DlcEvent::Writable`] follows once it drains.
    pub fn send(&self, data: &[u8]) -> RfcommResult<SendStatus> {
        self.check_usable()?;
        if data.is_empty() {
            return Ok(SendStatus::Accepted);
        }
        if data.len() > self.tx_queue_limit {
            return Err(RfcommError::InvalidParameter(format!(
                "{} bytes exceed the transmit queue limit of {}",
                data.len(),
                self.tx_queue_limit
            )));
        }
        if !self.shared.reserve(data.len(), self.tx_queue_limit) {
            return Ok(SendStatus::Backpressure);
        }
        self.post(Work::Send {
            dlc: self.id,
            data: data.to_vec(),
        })?;
        Ok(SendStatus::Accepted)
    }

    /// Disconnect once queued data has been sent
    pub fn close(&self) -> RfcommResult<()> {
        self.close_with(CloseReason::Local)
    }

    /// Close, reporting `reason` to this handle when the DLC is gone
    pub fn close_with(&self, reason: CloseReason) -> RfcommResult<()> {
        self.post(Work::Close {
            dlc: self.id,
            reason,
        })
    }

    /// Announce new local V.24 signals with MSC.
    ///
    /// Before the DLC is open the signals are kept and sent with the first MSC.
    pub fn set_modem_status(&self, signals: ModemSignals) -> RfcommResult<()> {
        if self.shared.state() == DlcState::Closed {
            return Err(self.closed_error());
        }
        self.post(Work::SetModemStatus {
            dlc: self.id,
            signals,
        })
    }

    /// Ask the peer to stop sending
    pub fn throttle(&self) -> RfcommResult<()> {
        self.post(Work::Throttle {
            dlc: self.id,
            on: true,
        })
    }

    pub fn unthrottle(&self) -> RfcommResult<()> {
        self.post(Work::Throttle {
            dlc: self.id,
            on: false,
        })
    }

    /// Propose port settings with RPN; the outcome arrives as [`DlcEvent::PortSettings`]
    pub fn negotiate_port(&self, settings: PortSettings, mask: ParamMask) -> RfcommResult<()> {
        self.check_usable()?;
        self.post(Work::NegotiatePort {
            dlc: self.id,
            settings,
            mask,
        })
    }

    /// Count received data as read, waking the worker if the peer was paused
    fn consumed(&self, event: DlcEvent) -> DlcEvent {
        if let DlcEvent::Data(data) = &event {
            if self.shared.consume_unread(data.len()) {
                let _ = self.post(Work::RxDrained { dlc: self.id });
            }
        }
        event
    }

    /// Block for the next event. `None` once the DLC is gone and every event was read.
    pub fn recv_event(&self) -> Option<DlcEvent> {
        self.events.recv().ok().map(|event| self.consumed(event))
    }

    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<DlcEvent> {
        self.events
            .recv_timeout(timeout)
            .ok()
            .map(|event| self.consumed(event))
    }

    pub fn try_event(&self) -> Option<DlcEvent> {
        self.events.try_recv().ok().map(|event| self.consumed(event))
    }

    /// Wait for the DLC to open and return its MTU.
    ///
    /// Events other than `Connected` and `Closed` received meanwhile are dropped.
    pub fn wait_connected(&self, timeout: Duration) -> RfcommResult<u16> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(left) {
                Ok(DlcEvent::Connected { mtu }) => return Ok(mtu),
                Ok(DlcEvent::Closed(reason)) => return Err(reason.into()),
                Ok(event) => {
                    self.consumed(event);
                }
                Err(RecvTimeoutError::Timeout) => return Err(RfcommError::Timeout),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(self
                        .shared
                        .close_reason()
                        .map_or(RfcommError::WorkerGone, RfcommError::from))
                }
            }
        }
    }
}

impl Drop for DlcHandle {
    fn drop(&mut self) {
        let _ = self.work_tx.send(Work::Release { dlc: self.id });
    }
}
