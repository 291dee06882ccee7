//! Data link connection state owned by the worker

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::trace;

use crate::constants::*;
use crate::error::CloseReason;
use crate::mcc::{ModemSignals, ParamMask, PnParams, PortSettings};
use crate::types::{CfcMode, Dlci, DlcId, DlcInfo, DlcState, SecurityLevel};

use super::credit::CreditFlow;

/// Events delivered to the owner of a DLC handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DlcEvent {
    /// The channel is open; data may be sent
    Connected { mtu: u16 },
    /// Data received from the peer
    Data(Vec<u8>),
    /// Peer's V.24 signals changed
    ModemStatus(ModemSignals),
    /// Peer reported a line status error
    LineStatus(u8),
    /// Port settings changed, with the mask of accepted fields
    PortSettings(PortSettings, ParamMask),
    /// Queue drained below the limit after a send was refused
    Writable,
    /// The channel is closed; no further events follow
    Closed(CloseReason),
}

/// DLC state mirrored for the handle side
#[derive(Debug)]
pub(crate) struct DlcShared {
    state: AtomicU8,
    mtu: AtomicU16,
    queued_bytes: AtomicUsize,
    backpressured: AtomicBool,
    /// Received bytes delivered as events and not read yet
    unread: AtomicUsize,
    rx_limit: usize,
    /// The worker paused the peer until `unread` drops to half of `rx_limit`
    rx_blocked: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
}

impl DlcShared {
    pub(crate) fn new(rx_limit: usize) -> Self {
        Self {
            state: AtomicU8::new(DlcState::Closed as u8),
            mtu: AtomicU16::new(RFCOMM_DEFAULT_MTU),
            queued_bytes: AtomicUsize::new(0),
            backpressured: AtomicBool::new(false),
            unread: AtomicUsize::new(0),
            rx_limit,
            rx_blocked: AtomicBool::new(false),
            close_reason: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> DlcState {
        DlcState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::Acquire)
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        *self
            .close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve room for `len` bytes, failing if the queue limit would be exceeded
    pub(crate) fn reserve(&self, len: usize, limit: usize) -> bool {
        let reserved = self
            .queued_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                let total = queued.checked_add(len)?;
                (total <= limit).then_some(total)
            })
            .is_ok();
        if !reserved {
            self.backpressured.store(true, Ordering::Release);
        }
        reserved
    }

    pub(crate) fn release(&self, len: usize) {
        let _ = self
            .queued_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                Some(queued.saturating_sub(len))
            });
    }

    pub(crate) fn unread(&self) -> usize {
        self.unread.load(Ordering::Acquire)
    }

    fn rx_low_watermark(&self) -> usize {
        self.rx_limit / 2
    }

    /// Account for data the owner has read. Returns true when the receive
    /// side was paused and may resume now.
    pub(crate) fn consume_unread(&self, len: usize) -> bool {
        let before = self
            .unread
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |unread| {
                Some(unread.saturating_sub(len))
            })
            .unwrap_or_default();
        before.saturating_sub(len) <= self.rx_low_watermark()
            && self.rx_blocked.swap(false, Ordering::AcqRel)
    }

    fn set_state(&self, state: DlcState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn set_mtu(&self, mtu: u16) {
        self.mtu.store(mtu, Ordering::Release);
    }

    fn set_closed(&self, reason: CloseReason) {
        *self
            .close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason);
        self.queued_bytes.store(0, Ordering::Release);
        self.set_state(DlcState::Closed);
    }

    fn take_backpressured(&self) -> bool {
        self.backpressured.swap(false, Ordering::AcqRel)
    }
}

/// Worker side of a DLC
pub(crate) struct Dlc {
    pub id: DlcId,
    pub dlci: Dlci,
    pub state: DlcState,
    /// Opened by the local side
    pub outgoing: bool,
    pub mtu: u16,
    /// MTU asked for by the owner, if any
    pub requested_mtu: Option<u16>,
    pub priority: u8,
    pub security: SecurityLevel,
    pub flow: CreditFlow,
    pub v24_local: ModemSignals,
    pub v24_remote: ModemSignals,
    /// Last status reported with RLS
    pub line_status: u8,
    pub port: PortSettings,
    /// Receive side paused by the owner
    pub rx_throttled: bool,
    /// Receive side paused because the owner left too much data unread
    pub rx_full: bool,
    /// Peer asked us to stop sending (FC in MSC, non credit mode)
    pub tx_throttled: bool,
    pub msc_pending: bool,
    /// Our MSC was answered
    pub msc_tx_done: bool,
    /// Peer's MSC was received
    pub msc_rx_done: bool,
    pub pn_sent: bool,
    pub sabm_sent: bool,
    pub sec_pending: bool,
    /// DISC goes out once the transmit queue drains
    pub disc_queued: bool,
    /// Reason given when the local side asked for the close
    pub closing: Option<CloseReason>,
    pub tx_queue: VecDeque<Vec<u8>>,
    pub timer: Option<Instant>,
    shared: Arc<DlcShared>,
    events: Sender<DlcEvent>,
}

impl Dlc {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: DlcId,
        dlci: Dlci,
        outgoing: bool,
        security: SecurityLevel,
        requested_mtu: Option<u16>,
        priority: u8,
        shared: Arc<DlcShared>,
        events: Sender<DlcEvent>,
    ) -> Self {
        Self {
            id,
            dlci,
            state: DlcState::Closed,
            outgoing,
            mtu: RFCOMM_DEFAULT_MTU,
            requested_mtu,
            priority: priority & 0x3F,
            security,
            flow: CreditFlow::new(),
            v24_local: ModemSignals::initial(),
            v24_remote: ModemSignals::empty(),
            line_status: 0,
            port: PortSettings::default(),
            rx_throttled: false,
            rx_full: false,
            tx_throttled: false,
            msc_pending: false,
            msc_tx_done: false,
            msc_rx_done: false,
            pn_sent: false,
            sabm_sent: false,
            sec_pending: false,
            disc_queued: false,
            closing: None,
            tx_queue: VecDeque::new(),
            timer: None,
            shared,
            events,
        }
    }

    pub fn set_state(&mut self, state: DlcState) {
        trace!("dlc {} ({}): {} -> {}", self.dlci, self.id, self.state, state);
        self.state = state;
        self.shared.set_state(state);
    }

    pub fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu.max(1);
        self.shared.set_mtu(self.mtu);
    }

    pub fn set_timer(&mut self, now: Instant, timeout: Duration) {
        self.timer = Some(now + timeout);
    }

    pub fn clear_timer(&mut self) {
        self.timer = None;
    }

    pub fn timed_out(&self, now: Instant) -> bool {
        self.timer.is_some_and(|deadline| deadline <= now)
    }

    pub fn notify(&self, event: DlcEvent) {
        if self.events.send(event).is_err() {
            trace!("dlc {} ({}): handle gone, event dropped", self.dlci, self.id);
        }
    }

    /// Take over negotiated parameters from a PN.
    ///
    /// The MTU is clamped to `cap`. A response may lower the MTU we proposed
    /// but never raise it.
    pub fn apply_pn(
        &mut self,
        pn: &PnParams,
        command: bool,
        session_cfc: &mut CfcMode,
        cap: u16,
        tx_credit_max: u16,
    ) {
        let credit = (pn.flow_ctrl == RFCOMM_PN_CFC_REQUEST && *session_cfc != CfcMode::Disabled)
            || pn.flow_ctrl == RFCOMM_PN_CFC_ACCEPT;

        if credit {
            self.flow.enable(pn.credits, tx_credit_max);
            self.tx_throttled = false;
        } else {
            self.flow.disable();
            // Wait for the peer's MSC before sending
            self.tx_throttled = true;
        }

        if *session_cfc == CfcMode::Unknown {
            *session_cfc = if credit {
                CfcMode::Enabled
            } else {
                CfcMode::Disabled
            };
        }

        self.priority = pn.priority & 0x3F;
        let mut mtu = if pn.mtu == 0 { RFCOMM_DEFAULT_MTU } else { pn.mtu };
        if !command {
            mtu = mtu.min(self.mtu);
        }
        self.set_mtu(mtu.min(cap));
    }

    /// PN body describing this DLC
    pub fn pn_params(&self, command: bool, session_cfc: CfcMode) -> PnParams {
        let credit = if command {
            session_cfc != CfcMode::Disabled
        } else {
            self.flow.is_enabled()
        };
        let (flow_ctrl, credits) = match (credit, command) {
            (true, true) => (RFCOMM_PN_CFC_REQUEST, RFCOMM_DEFAULT_CREDITS),
            (true, false) => (RFCOMM_PN_CFC_ACCEPT, RFCOMM_DEFAULT_CREDITS),
            (false, _) => (0, 0),
        };

        PnParams {
            dlci: self.dlci,
            flow_ctrl,
            priority: self.priority,
            ack_timer: 0,
            mtu: self.mtu,
            max_retrans: 0,
            credits,
        }
    }

    /// Queue user data, split into frames no larger than the DLC MTU
    pub fn enqueue(&mut self, data: Vec<u8>) {
        let mtu = self.mtu as usize;
        if data.len() <= mtu {
            self.tx_queue.push_back(data);
        } else {
            self.tx_queue
                .extend(data.chunks(mtu).map(|chunk| chunk.to_vec()));
        }
    }

    /// Discard queued data and release its reservation
    pub fn purge(&mut self) {
        let bytes: usize = self.tx_queue.iter().map(Vec::len).sum();
        self.tx_queue.clear();
        self.shared.release(bytes);
    }

    /// Data frames may only flow once both sides exchanged MSC
    pub fn tx_ready(&self) -> bool {
        self.msc_tx_done && self.msc_rx_done
    }

    pub fn sent(&mut self, len: usize) {
        self.shared.release(len);
    }

    /// Hand received data to the owner, pausing the peer once too much is unread
    pub fn deliver(&mut self, data: Vec<u8>) {
        let unread = self.shared.unread.fetch_add(data.len(), Ordering::AcqRel) + data.len();
        self.notify(DlcEvent::Data(data));
        if !self.rx_full && unread > self.shared.rx_limit {
            trace!("dlc {} ({}): {} bytes unread, pausing peer", self.dlci, self.id, unread);
            self.rx_full = true;
            self.shared.rx_blocked.store(true, Ordering::Release);
            self.sync_fc();
        }
    }

    /// Resume the peer once the owner has caught up
    pub fn check_drained(&mut self) {
        if self.rx_full && self.shared.unread() <= self.shared.rx_low_watermark() {
            trace!("dlc {} ({}): receive queue drained", self.dlci, self.id);
            self.rx_full = false;
            self.shared.rx_blocked.store(false, Ordering::Release);
            self.sync_fc();
        }
    }

    pub fn rx_paused(&self) -> bool {
        self.rx_throttled || self.rx_full
    }

    /// Without credits the peer is paused with the FC bit of our MSC
    pub fn sync_fc(&mut self) {
        if self.flow.is_enabled() {
            return;
        }
        let paused = self.rx_paused();
        if self.v24_local.contains(ModemSignals::FC) != paused {
            self.v24_local.set(ModemSignals::FC, paused);
            self.msc_pending = true;
        }
    }

    /// Report the queue as writable again if a sender was refused earlier
    pub fn wake_writer(&self) {
        if self.shared.take_backpressured() {
            self.notify(DlcEvent::Writable);
        }
    }

    /// Transition to OPEN and tell the owner
    pub fn mark_open(&mut self) {
        self.clear_timer();
        self.set_state(DlcState::Open);
        // The first MSC carries the current signals
        self.msc_pending = false;
        self.notify(DlcEvent::Connected { mtu: self.mtu });
    }

    /// Final transition to CLOSED. The caller unlinks the DLC afterwards.
    pub fn finish(&mut self, reason: CloseReason) {
        self.clear_timer();
        self.tx_queue.clear();
        self.state = DlcState::Closed;
        self.shared.set_closed(reason);
        self.notify(DlcEvent::Closed(reason));
    }

    pub fn info(&self) -> DlcInfo {
        DlcInfo {
            id: self.id,
            dlci: self.dlci,
            channel: self.dlci.channel(),
            state: self.state,
            mtu: self.mtu,
            priority: self.priority,
            credit_mode: self.flow.is_enabled(),
            tx_credits: self.flow.tx_credits(),
            rx_credits: self.flow.rx_credits(),
            queued_frames: self.tx_queue.len(),
            modem_status: self.v24_local.bits(),
            remote_modem_status: self.v24_remote.bits(),
            line_status: self.line_status,
            unread_bytes: self.shared.unread(),
        }
    }
}
