//! Session state machine
//!
//! A session owns one transport link, the multiplexer control channel on
//! DLCI 0 and every DLC multiplexed on the link. All methods run on the
//! worker; frames produced while handling an event are collected in an
//! outbox and written to the link in order by `flush`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{mpsc, Arc};
use std::time::Instant;

use log::{debug, info, trace, warn};

use crate::bdaddr::BdAddr;
use crate::config::RfcommConfig;
use crate::constants::*;
use crate::error::{CloseReason, McError};
use crate::frame::{Frame, FrameType};
use crate::link::Link;
use crate::mcc::{McBody, McMessage, ModemSignals, ParamMask, PnParams, PortSettings};
use crate::service::DlcHandle;
use crate::types::{
    CfcMode, Dlci, DlcState, SecurityLevel, SessionId, SessionInfo, SessionState,
};

use super::dlc::{Dlc, DlcEvent, DlcShared};
use super::engine::{Env, PendingAccept};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionTimer {
    /// Transport connect or multiplexer start-up
    Connect,
    /// Waiting for a link security upgrade
    Security,
    /// No DLC left on an open session
    Idle,
    /// DISC sent on the control channel
    Disconnect,
}

pub(crate) struct Session {
    pub id: SessionId,
    pub local: BdAddr,
    pub remote: BdAddr,
    pub state: SessionState,
    /// We opened the transport; decides DLCI direction and C/R bits
    pub initiator: bool,
    pub link: Option<Arc<dyn Link>>,
    pub mtu: u16,
    pub cfc: CfcMode,
    /// Peer sent FCoff
    pub flow_off: bool,
    pub dlcs: BTreeMap<Dlci, Dlc>,
    pub rx_queue: VecDeque<Vec<u8>>,
    timer: Option<(Instant, SessionTimer)>,
    outbox: Vec<Frame>,
    broken: bool,
}

fn initial_cfc(config: &RfcommConfig) -> CfcMode {
    if config.disable_cfc {
        CfcMode::Disabled
    } else {
        CfcMode::Unknown
    }
}

impl Session {
    fn new(
        id: SessionId,
        local: BdAddr,
        remote: BdAddr,
        state: SessionState,
        initiator: bool,
        config: &RfcommConfig,
    ) -> Self {
        Self {
            id,
            local,
            remote,
            state,
            initiator,
            link: None,
            mtu: config.session_mtu(config.l2cap_mtu),
            cfc: initial_cfc(config),
            flow_off: false,
            dlcs: BTreeMap::new(),
            rx_queue: VecDeque::new(),
            timer: None,
            outbox: Vec::new(),
            broken: false,
        }
    }

    /// Session for a locally requested connection; the transport is still connecting
    pub fn outgoing(
        id: SessionId,
        local: BdAddr,
        remote: BdAddr,
        config: &RfcommConfig,
        now: Instant,
    ) -> Self {
        let mut session = Self::new(id, local, remote, SessionState::WaitConn, true, config);
        session.set_timer(now + config.conn_timeout, SessionTimer::Connect);
        session
    }

    /// Session for an inbound transport; waits for the peer's SABM on DLCI 0
    pub fn accepted(
        id: SessionId,
        local: BdAddr,
        remote: BdAddr,
        link: Arc<dyn Link>,
        config: &RfcommConfig,
        now: Instant,
    ) -> Self {
        let mut session = Self::new(id, local, remote, SessionState::WaitMux, false, config);
        session.mtu = config.session_mtu(link.mtu());
        session.link = Some(link);
        session.set_timer(now + config.conn_timeout, SessionTimer::Connect);
        session
    }

    /// Placeholder session marking a local address with registered listeners
    pub fn listening(id: SessionId, local: BdAddr, config: &RfcommConfig) -> Self {
        Self::new(id, local, BdAddr::ANY, SessionState::Listening, false, config)
    }

    /// DLCI for a server channel on the peer, as opened from this side
    pub fn dlci_for(&self, channel: u8) -> Dlci {
        Dlci::from_channel(channel, if self.initiator { 0 } else { 1 })
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            local: self.local,
            remote: self.remote,
            state: self.state,
            initiator: self.initiator,
            mtu: self.mtu,
            credit_mode: self.cfc,
            dlcs: self.dlcs.values().map(Dlc::info).collect(),
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("{} {}: {} -> {}", self.id, self.remote, self.state, state);
            self.state = state;
        }
    }

    fn set_timer(&mut self, deadline: Instant, kind: SessionTimer) {
        self.timer = Some((deadline, kind));
    }

    /// Local limit on the MTU of a channel
    fn mtu_cap(&self, config: &RfcommConfig) -> u16 {
        config.channel_mtu.map_or(self.mtu, |mtu| mtu.min(self.mtu))
    }

    pub fn link_dlc(&mut self, dlc: Dlc) {
        if matches!(self.timer, Some((_, SessionTimer::Idle))) {
            self.timer = None;
        }
        self.dlcs.insert(dlc.dlci, dlc);
    }

    /// Remove a DLC and report it closed
    fn close_dlc(&mut self, env: &mut Env<'_>, dlci: Dlci, reason: CloseReason) {
        if let Some(mut dlc) = self.dlcs.remove(&dlci) {
            debug!("{}: dlc {} closed: {}", self.id, dlci, reason);
            dlc.finish(reason);
            env.accepts.remove(&dlc.id);
        }
    }

    /// Tear the session down, closing every DLC with `reason`
    pub fn close(&mut self, env: &mut Env<'_>, reason: CloseReason) {
        if self.state == SessionState::Closed {
            return;
        }
        info!("{}: session with {} closed: {}", self.id, self.remote, reason);
        self.set_state(SessionState::Closed);
        self.timer = None;

        let dlcis: Vec<Dlci> = self.dlcs.keys().copied().collect();
        for dlci in dlcis {
            self.close_dlc(env, dlci, reason);
        }

        if !self.broken {
            self.flush();
        }
        self.outbox.clear();
        self.rx_queue.clear();
        if let Some(link) = self.link.take() {
            link.shutdown();
        }
    }

    // --- Outbound helpers -------------------------------------------------

    fn send_command(&mut self, frame_type: FrameType, dlci: Dlci) {
        self.outbox
            .push(Frame::empty(frame_type, dlci, self.initiator));
    }

    fn send_response(&mut self, frame_type: FrameType, dlci: Dlci) {
        self.outbox
            .push(Frame::empty(frame_type, dlci, !self.initiator));
    }

    fn send_mcc(&mut self, message: McMessage) {
        trace!("{}: mcc tx {:?}", self.id, message);
        self.outbox
            .push(Frame::uih(Dlci::CONTROL, self.initiator, message.encode()));
    }

    fn send_msc(&mut self, dlci: Dlci, signals: ModemSignals) {
        self.send_mcc(McMessage::command(McBody::Msc {
            dlci,
            signals,
            break_signal: None,
        }));
    }

    /// Write every queued frame to the link
    pub fn flush(&mut self) {
        let Some(link) = &self.link else {
            self.outbox.clear();
            return;
        };

        for frame in self.outbox.drain(..) {
            match frame.encode() {
                Ok(bytes) => {
                    trace!("{} tx {} [{}]", self.id, frame, hex::encode(&bytes));
                    if let Err(e) = link.send(&bytes) {
                        warn!("{}: link write failed: {}", self.id, e);
                        self.broken = true;
                        break;
                    }
                }
                Err(e) => warn!("{}: cannot encode {}: {}", self.id, frame, e),
            }
        }
    }

    // --- Session start-up -------------------------------------------------

    /// The outbound transport is connected
    pub fn link_up(&mut self, env: &mut Env<'_>, link: Arc<dyn Link>, now: Instant) {
        if self.state != SessionState::WaitConn {
            debug!("{}: unexpected link in state {}", self.id, self.state);
            link.shutdown();
            return;
        }

        self.mtu = env.config.session_mtu(link.mtu());
        let level = link.security_level();
        let required = self
            .dlcs
            .values()
            .map(|dlc| dlc.security)
            .max()
            .unwrap_or_default();
        let satisfied = level >= required || link.request_security(required);
        self.link = Some(link);

        if satisfied {
            self.start_mux(env, now);
        } else {
            debug!("{}: waiting for security {:?}", self.id, required);
            self.set_state(SessionState::WaitSecurity);
            self.set_timer(now + env.config.auth_timeout, SessionTimer::Security);
        }
    }

    fn start_mux(&mut self, env: &mut Env<'_>, now: Instant) {
        self.send_command(FrameType::Sabm, Dlci::CONTROL);
        self.set_state(SessionState::WaitMux);
        self.set_timer(now + env.config.conn_timeout, SessionTimer::Connect);
    }

    fn mux_opened(&mut self, env: &mut Env<'_>) {
        info!("{}: multiplexer open with {}", self.id, self.remote);
        self.set_state(SessionState::Open);
        self.timer = None;

        let pending: Vec<Dlci> = self
            .dlcs
            .values()
            .filter(|dlc| dlc.outgoing && dlc.state == DlcState::WaitConn)
            .map(|dlc| dlc.dlci)
            .collect();
        for dlci in pending {
            self.start_dlc(env, dlci);
        }
    }

    /// Link security upgrade finished
    pub fn security_changed(&mut self, env: &mut Env<'_>, success: bool, now: Instant) {
        match self.state {
            SessionState::WaitSecurity => {
                if success {
                    self.start_mux(env, now);
                } else {
                    self.close(env, CloseReason::Security);
                }
            }
            SessionState::Open => {
                let level = self
                    .link
                    .as_ref()
                    .map(|link| link.security_level())
                    .unwrap_or_default();
                let waiting: Vec<(Dlci, bool, SecurityLevel)> = self
                    .dlcs
                    .values()
                    .filter(|dlc| dlc.sec_pending)
                    .map(|dlc| (dlc.dlci, dlc.outgoing, dlc.security))
                    .collect();

                for (dlci, outgoing, required) in waiting {
                    if success && level >= required {
                        if let Some(dlc) = self.dlcs.get_mut(&dlci) {
                            dlc.sec_pending = false;
                        }
                        if outgoing {
                            self.start_dlc(env, dlci);
                        } else {
                            self.accept_dlc(env, dlci);
                        }
                    } else {
                        if !outgoing {
                            self.send_response(FrameType::Dm, dlci);
                        }
                        self.close_dlc(env, dlci, CloseReason::Security);
                    }
                }
            }
            _ => {}
        }
    }

    // --- Outgoing DLCs ----------------------------------------------------

    /// Begin opening a locally requested DLC on an open session
    pub fn start_dlc(&mut self, env: &mut Env<'_>, dlci: Dlci) {
        let Some(link) = self.link.clone() else {
            return;
        };
        let cap = self.mtu_cap(env.config);
        let cfc = self.cfc;
        let Some(dlc) = self.dlcs.get_mut(&dlci) else {
            return;
        };
        if dlc.state != DlcState::WaitConn || dlc.pn_sent || dlc.sabm_sent {
            return;
        }

        if dlc.security > link.security_level() && !link.request_security(dlc.security) {
            debug!("{}: dlc {} waiting for security", self.id, dlci);
            dlc.sec_pending = true;
            return;
        }
        dlc.sec_pending = false;

        if env.config.parameter_negotiation {
            dlc.set_mtu(dlc.requested_mtu.map_or(cap, |mtu| mtu.min(cap)));
            dlc.pn_sent = true;
            let pn = dlc.pn_params(true, cfc);
            self.send_mcc(McMessage::command(McBody::Pn(pn)));
        } else {
            dlc.sabm_sent = true;
            self.send_command(FrameType::Sabm, dlci);
        }
    }

    /// Local close request
    pub fn close_request(
        &mut self,
        env: &mut Env<'_>,
        dlci: Dlci,
        reason: CloseReason,
        now: Instant,
    ) {
        let Some(dlc) = self.dlcs.get_mut(&dlci) else {
            return;
        };

        match dlc.state {
            DlcState::Closed | DlcState::Disconnecting => {}
            DlcState::Open => {
                dlc.closing = Some(reason);
                dlc.set_state(DlcState::Disconnecting);
                if dlc.tx_queue.is_empty() || !dlc.tx_ready() {
                    dlc.purge();
                    dlc.set_timer(now, env.config.disc_timeout);
                    self.send_command(FrameType::Disc, dlci);
                } else {
                    dlc.disc_queued = true;
                    dlc.set_timer(now, env.config.disc_timeout * 2);
                }
            }
            DlcState::WaitConn | DlcState::Config => {
                if dlc.outgoing && dlc.sabm_sent {
                    dlc.closing = Some(reason);
                    dlc.set_state(DlcState::Disconnecting);
                    dlc.set_timer(now, env.config.disc_timeout);
                    self.send_command(FrameType::Disc, dlci);
                } else {
                    if !dlc.outgoing {
                        self.send_response(FrameType::Dm, dlci);
                    }
                    self.close_dlc(env, dlci, reason);
                }
            }
        }
    }

    pub fn queue_data(&mut self, dlci: Dlci, data: Vec<u8>) {
        let Some(dlc) = self.dlcs.get_mut(&dlci) else {
            return;
        };
        if dlc.state == DlcState::Open {
            dlc.enqueue(data);
        } else {
            dlc.sent(data.len());
        }
    }

    pub fn throttle(&mut self, dlci: Dlci, on: bool) {
        let Some(dlc) = self.dlcs.get_mut(&dlci) else {
            return;
        };
        if dlc.rx_throttled == on {
            return;
        }
        dlc.rx_throttled = on;
        dlc.sync_fc();
    }

    /// The owner read enough received data to resume the peer
    pub fn rx_drained(&mut self, dlci: Dlci) {
        if let Some(dlc) = self.dlcs.get_mut(&dlci) {
            dlc.check_drained();
        }
    }

    pub fn set_modem_status(&mut self, dlci: Dlci, signals: ModemSignals) {
        let Some(dlc) = self.dlcs.get_mut(&dlci) else {
            return;
        };
        let mut signals = signals - ModemSignals::FC;
        if dlc.rx_paused() && !dlc.flow.is_enabled() {
            signals |= ModemSignals::FC;
        }
        dlc.v24_local = signals;
        dlc.msc_pending = true;
    }

    pub fn negotiate_port(&mut self, dlci: Dlci, settings: PortSettings, mask: ParamMask) {
        if self.state != SessionState::Open || !self.dlcs.contains_key(&dlci) {
            return;
        }
        self.send_mcc(McMessage::command(McBody::Rpn {
            dlci,
            settings: Some((settings, mask)),
        }));
    }

    // --- Incoming DLCs ----------------------------------------------------

    /// Create a DLC for a peer request if a listener takes the channel
    fn accept_incoming(&mut self, env: &mut Env<'_>, dlci: Dlci, now: Instant) -> bool {
        if !dlci.is_user() || dlci.direction() == self.dlci_for(dlci.channel()).direction() {
            return false;
        }
        let channel = dlci.channel();
        let entry = env
            .listeners
            .get(&(self.local, channel))
            .or_else(|| env.listeners.get(&(BdAddr::ANY, channel)));
        let Some(entry) = entry else {
            debug!("{}: no listener on channel {}", self.id, channel);
            return false;
        };
        if let Some(filter) = &entry.policy.filter {
            if !filter(self.remote, channel) {
                debug!("{}: channel {} refused by policy", self.id, channel);
                return false;
            }
        }

        let id = env.registry.next_dlc_id();
        let shared = Arc::new(DlcShared::new(env.config.rx_queue_limit));
        let (events_tx, events_rx) = mpsc::channel();
        let handle = DlcHandle::new(
            id,
            channel,
            self.local,
            self.remote,
            Arc::clone(&shared),
            events_rx,
            env.work_tx.clone(),
            Arc::clone(env.registry),
            env.config.tx_queue_limit,
        );
        env.accepts.insert(
            id,
            PendingAccept {
                handle,
                backlog: entry.backlog.clone(),
            },
        );

        let mut dlc = Dlc::new(
            id,
            dlci,
            false,
            entry.policy.min_security_level,
            env.config.channel_mtu,
            RFCOMM_DEFAULT_PRIORITY,
            shared,
            events_tx,
        );
        dlc.set_state(DlcState::Config);
        dlc.set_timer(now, env.config.conn_timeout);
        self.link_dlc(dlc);
        true
    }

    /// Answer the peer's SABM once security allows it
    fn check_accept(&mut self, env: &mut Env<'_>, dlci: Dlci, now: Instant) {
        let Some(link) = self.link.clone() else {
            return;
        };
        let Some(dlc) = self.dlcs.get_mut(&dlci) else {
            return;
        };
        if link.security_level() >= dlc.security || link.request_security(dlc.security) {
            self.accept_dlc(env, dlci);
        } else {
            debug!("{}: dlc {} waiting for security", self.id, dlci);
            dlc.sec_pending = true;
            dlc.set_timer(now, env.config.auth_timeout);
        }
    }

    fn accept_dlc(&mut self, env: &mut Env<'_>, dlci: Dlci) {
        self.send_response(FrameType::Ua, dlci);
        let Some(dlc) = self.dlcs.get_mut(&dlci) else {
            return;
        };
        dlc.sec_pending = false;
        dlc.mark_open();
        let (id, signals) = (dlc.id, dlc.v24_local);
        self.send_msc(dlci, signals);

        if let Some(pending) = env.accepts.remove(&id) {
            // A closed backlog drops the handle, which closes the DLC again
            if pending.backlog.send(pending.handle).is_err() {
                debug!("{}: listener gone for dlc {}", self.id, dlci);
            }
        }
    }

    // --- Frame reception --------------------------------------------------

    fn recv(&mut self, env: &mut Env<'_>, data: &[u8], now: Instant) {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("{}: dropping frame [{}]: {}", self.id, hex::encode(data), e);
                return;
            }
        };
        trace!("{} rx {} [{}]", self.id, frame, hex::encode(data));

        if frame.dlci.is_control() {
            self.recv_control(env, frame, now);
            return;
        }
        if self.state != SessionState::Open {
            debug!("{}: {} before multiplexer start-up, dropped", self.id, frame);
            return;
        }

        match frame.frame_type {
            FrameType::Sabm => self.recv_sabm(env, frame.dlci, now),
            FrameType::Ua => self.recv_ua(env, frame.dlci),
            FrameType::Dm => self.recv_dm(env, frame.dlci),
            FrameType::Disc => self.recv_disc(env, frame.dlci),
            FrameType::Uih => self.recv_data(frame),
        }
    }

    fn recv_control(&mut self, env: &mut Env<'_>, frame: Frame, now: Instant) {
        match frame.frame_type {
            FrameType::Sabm => match self.state {
                SessionState::WaitMux if !self.initiator => {
                    self.send_response(FrameType::Ua, Dlci::CONTROL);
                    self.mux_opened(env);
                }
                SessionState::Open => self.send_response(FrameType::Ua, Dlci::CONTROL),
                _ => debug!("{}: SABM on control channel in {}", self.id, self.state),
            },
            FrameType::Ua => match self.state {
                SessionState::WaitMux if self.initiator => self.mux_opened(env),
                SessionState::Disconnecting => self.close(env, CloseReason::Local),
                _ => debug!("{}: UA on control channel in {}", self.id, self.state),
            },
            FrameType::Dm => match self.state {
                SessionState::WaitMux => self.close(env, CloseReason::Refused),
                SessionState::Disconnecting => self.close(env, CloseReason::Local),
                SessionState::Open => self.close(env, CloseReason::Reset),
                _ => {}
            },
            FrameType::Disc => {
                self.send_response(FrameType::Ua, Dlci::CONTROL);
                let reason = if self.state == SessionState::Disconnecting {
                    CloseReason::Local
                } else {
                    CloseReason::RemoteDisconnect
                };
                self.close(env, reason);
            }
            FrameType::Uih => {
                if self.state == SessionState::Open {
                    self.recv_mcc(env, &frame.payload, now);
                } else {
                    debug!("{}: control command before start-up, dropped", self.id);
                }
            }
        }
    }

    fn recv_sabm(&mut self, env: &mut Env<'_>, dlci: Dlci, now: Instant) {
        match self.dlcs.get(&dlci).map(|dlc| (dlc.outgoing, dlc.state, dlc.sec_pending)) {
            Some((false, DlcState::Config, false)) => self.check_accept(env, dlci, now),
            Some((_, state, _)) => debug!("{}: SABM for dlc {} in {}", self.id, dlci, state),
            None => {
                if self.accept_incoming(env, dlci, now) {
                    self.check_accept(env, dlci, now);
                } else {
                    self.send_response(FrameType::Dm, dlci);
                }
            }
        }
    }

    fn recv_ua(&mut self, env: &mut Env<'_>, dlci: Dlci) {
        let Some(dlc) = self.dlcs.get_mut(&dlci) else {
            debug!("{}: UA for unknown dlc {}", self.id, dlci);
            return;
        };

        match dlc.state {
            DlcState::WaitConn | DlcState::Config if dlc.outgoing && dlc.sabm_sent => {
                dlc.mark_open();
                let signals = dlc.v24_local;
                self.send_msc(dlci, signals);
            }
            DlcState::Disconnecting => {
                let reason = dlc.closing.unwrap_or(CloseReason::Local);
                self.close_dlc(env, dlci, reason);
            }
            state => debug!("{}: UA for dlc {} in {}", self.id, dlci, state),
        }
    }

    fn recv_dm(&mut self, env: &mut Env<'_>, dlci: Dlci) {
        let Some(dlc) = self.dlcs.get(&dlci) else {
            return;
        };
        let reason = match dlc.state {
            DlcState::WaitConn | DlcState::Config => CloseReason::Refused,
            DlcState::Disconnecting => dlc.closing.unwrap_or(CloseReason::Local),
            _ => CloseReason::Reset,
        };
        self.close_dlc(env, dlci, reason);
    }

    fn recv_disc(&mut self, env: &mut Env<'_>, dlci: Dlci) {
        let Some(dlc) = self.dlcs.get(&dlci) else {
            self.send_response(FrameType::Dm, dlci);
            return;
        };
        let reason = match dlc.state {
            DlcState::Disconnecting => dlc.closing.unwrap_or(CloseReason::Local),
            _ => CloseReason::RemoteDisconnect,
        };
        self.send_response(FrameType::Ua, dlci);
        self.close_dlc(env, dlci, reason);
    }

    fn recv_data(&mut self, frame: Frame) {
        let Some(dlc) = self.dlcs.get_mut(&frame.dlci) else {
            self.send_response(FrameType::Dm, frame.dlci);
            return;
        };

        if let Some(credits) = frame.credits {
            let dropped = dlc.flow.grant(credits);
            if dropped > 0 {
                debug!("{}: dlc {} credits over the cap, {} ignored", self.id, frame.dlci, dropped);
            }
        }
        if frame.payload.is_empty() {
            return;
        }
        if dlc.state != DlcState::Open {
            debug!("{}: data for dlc {} in {}, dropped", self.id, frame.dlci, dlc.state);
            return;
        }
        dlc.flow.on_receive();
        dlc.deliver(frame.payload);
    }

    // --- Control channel --------------------------------------------------

    fn recv_mcc(&mut self, env: &mut Env<'_>, payload: &[u8], now: Instant) {
        let message = match McMessage::decode(payload) {
            Ok(message) => message,
            Err(McError::Unsupported { ty, cr }) => {
                warn!("{}: unsupported control command 0x{:02x}", self.id, ty);
                if cr {
                    self.send_mcc(McMessage::response(McBody::Nsc { ty, cr }));
                }
                return;
            }
            Err(e) => {
                debug!("{}: dropping control command [{}]: {}", self.id, hex::encode(payload), e);
                return;
            }
        };
        trace!("{}: mcc rx {:?}", self.id, message);
        let command = message.command;

        match message.body {
            McBody::Pn(pn) => self.recv_pn(env, command, pn, now),
            McBody::Rpn { dlci, settings } => self.recv_rpn(command, dlci, settings),
            McBody::Rls { dlci, status } => self.recv_rls(command, dlci, status),
            McBody::Msc { dlci, signals, .. } => self.recv_msc(command, dlci, signals),
            McBody::Nsc { ty, .. } => {
                warn!("{}: peer does not support command type 0x{:02x}", self.id, ty)
            }
            McBody::Test(pattern) => {
                if command {
                    self.send_mcc(McMessage::response(McBody::Test(pattern)));
                }
            }
            McBody::FcOn => {
                if command {
                    self.flow_off = false;
                    self.send_mcc(McMessage::response(McBody::FcOn));
                }
            }
            McBody::FcOff => {
                if command {
                    self.flow_off = true;
                    self.send_mcc(McMessage::response(McBody::FcOff));
                }
            }
        }
    }

    fn recv_pn(&mut self, env: &mut Env<'_>, command: bool, pn: PnParams, now: Instant) {
        let dlci = pn.dlci;
        if !dlci.is_user() {
            debug!("{}: PN for invalid dlci {}", self.id, dlci);
            return;
        }
        let cap = self.mtu_cap(env.config);

        if !command {
            let Some(dlc) = self.dlcs.get_mut(&dlci) else {
                return;
            };
            if dlc.outgoing && dlc.state == DlcState::WaitConn && dlc.pn_sent && !dlc.sabm_sent {
                dlc.apply_pn(&pn, false, &mut self.cfc, cap, env.config.max_tx_credits);
                dlc.set_state(DlcState::Config);
                dlc.sabm_sent = true;
                dlc.set_timer(now, env.config.conn_timeout);
                self.send_command(FrameType::Sabm, dlci);
            }
            return;
        }

        if !self.dlcs.contains_key(&dlci) && !self.accept_incoming(env, dlci, now) {
            self.send_response(FrameType::Dm, dlci);
            return;
        }
        let initiator = self.initiator;
        let Some(dlc) = self.dlcs.get_mut(&dlci) else {
            return;
        };

        let glare = dlc.outgoing && dlc.state == DlcState::WaitConn && dlc.pn_sent;
        if glare && initiator {
            debug!("{}: PN collision on dlc {}, keeping our proposal", self.id, dlci);
        } else if matches!(dlc.state, DlcState::WaitConn | DlcState::Config) {
            dlc.apply_pn(&pn, true, &mut self.cfc, cap, env.config.max_tx_credits);
        }
        let response = dlc.pn_params(false, self.cfc);
        self.send_mcc(McMessage::response(McBody::Pn(response)));
    }

    fn recv_rpn(&mut self, command: bool, dlci: Dlci, settings: Option<(PortSettings, ParamMask)>) {
        if !command {
            if let (Some(dlc), Some((port, mask))) = (self.dlcs.get_mut(&dlci), settings) {
                dlc.port = port;
                dlc.notify(DlcEvent::PortSettings(port, mask));
            }
            return;
        }

        let current = self
            .dlcs
            .get(&dlci)
            .map(|dlc| dlc.port)
            .unwrap_or_default();
        let (port, mask) = match settings {
            None => (current, ParamMask::all()),
            Some((proposed, mask)) => {
                let mut port = current;
                let accepted = port.apply(&proposed, mask);
                if let Some(dlc) = self.dlcs.get_mut(&dlci) {
                    dlc.port = port;
                    dlc.notify(DlcEvent::PortSettings(port, accepted));
                }
                (port, accepted)
            }
        };
        self.send_mcc(McMessage::response(McBody::Rpn {
            dlci,
            settings: Some((port, mask)),
        }));
    }

    fn recv_rls(&mut self, command: bool, dlci: Dlci, status: u8) {
        if !command {
            return;
        }
        match self.dlcs.get_mut(&dlci) {
            Some(dlc) => {
                dlc.line_status = status;
                dlc.notify(DlcEvent::LineStatus(status));
            }
            None => debug!("{}: RLS for unknown dlc {}", self.id, dlci),
        }
        self.send_mcc(McMessage::response(McBody::Rls { dlci, status }));
    }

    fn recv_msc(&mut self, command: bool, dlci: Dlci, signals: ModemSignals) {
        let Some(dlc) = self.dlcs.get_mut(&dlci) else {
            debug!("{}: MSC for unknown dlc {}", self.id, dlci);
            if command {
                self.send_mcc(McMessage::response(McBody::Msc {
                    dlci,
                    signals,
                    break_signal: None,
                }));
            }
            return;
        };
        if !command {
            dlc.msc_tx_done = true;
            return;
        }

        if !dlc.flow.is_enabled() {
            dlc.tx_throttled = signals.contains(ModemSignals::FC);
        }
        dlc.v24_remote = signals;
        dlc.msc_rx_done = true;
        dlc.notify(DlcEvent::ModemStatus(signals));
        self.send_mcc(McMessage::response(McBody::Msc {
            dlci,
            signals,
            break_signal: None,
        }));
    }

    // --- Processing pass --------------------------------------------------

    /// One pass: drain received frames, move queued data, run timers
    pub fn process(&mut self, env: &mut Env<'_>, now: Instant) {
        if matches!(self.state, SessionState::Listening | SessionState::Closed) {
            return;
        }
        self.flush();

        while let Some(data) = self.rx_queue.pop_front() {
            self.recv(env, &data, now);
            if self.state == SessionState::Closed {
                return;
            }
        }

        if self.state == SessionState::Open {
            self.process_dlcs();
        }
        self.check_timers(env, now);
        self.flush();

        if self.broken && self.state != SessionState::Closed {
            self.close(env, CloseReason::Transport);
        }
    }

    fn process_dlcs(&mut self) {
        let initiator = self.initiator;
        let flow_off = self.flow_off;

        for dlc in self.dlcs.values_mut() {
            if !matches!(dlc.state, DlcState::Open | DlcState::Disconnecting) {
                continue;
            }
            let dlci = dlc.dlci;
            dlc.check_drained();

            if dlc.state == DlcState::Open && dlc.msc_pending {
                dlc.msc_pending = false;
                let message = McMessage::command(McBody::Msc {
                    dlci,
                    signals: dlc.v24_local,
                    break_signal: None,
                });
                self.outbox
                    .push(Frame::uih(Dlci::CONTROL, initiator, message.encode()));
            }

            if !dlc.tx_ready() {
                continue;
            }

            if let Some(credits) = dlc.flow.replenish(dlc.rx_paused()) {
                self.outbox
                    .push(Frame::uih_with_credits(dlci, initiator, credits, Vec::new()));
            }

            let mut sent = false;
            if !dlc.tx_throttled && !flow_off {
                let mut budget = if dlc.flow.is_enabled() {
                    usize::MAX
                } else {
                    RFCOMM_NO_CFC_TX_BATCH as usize
                };
                while budget > 0 && dlc.flow.can_send() {
                    let Some(data) = dlc.tx_queue.pop_front() else {
                        break;
                    };
                    dlc.flow.consume();
                    dlc.sent(data.len());
                    self.outbox.push(Frame::uih(dlci, initiator, data));
                    budget -= 1;
                    sent = true;
                }
            }
            if sent {
                dlc.wake_writer();
            }

            if dlc.disc_queued && dlc.tx_queue.is_empty() {
                dlc.disc_queued = false;
                self.outbox
                    .push(Frame::empty(FrameType::Disc, dlci, initiator));
            }
        }
    }

    fn check_timers(&mut self, env: &mut Env<'_>, now: Instant) {
        if let Some((deadline, kind)) = self.timer {
            if deadline <= now {
                self.timer = None;
                match kind {
                    SessionTimer::Connect | SessionTimer::Security => {
                        self.close(env, CloseReason::Timeout);
                        return;
                    }
                    SessionTimer::Idle => {
                        if self.state == SessionState::Open && self.dlcs.is_empty() {
                            debug!("{}: idle, disconnecting", self.id);
                            self.send_command(FrameType::Disc, Dlci::CONTROL);
                            self.set_state(SessionState::Disconnecting);
                            self.set_timer(now + env.config.disc_timeout, SessionTimer::Disconnect);
                        }
                    }
                    SessionTimer::Disconnect => {
                        self.close(env, CloseReason::Local);
                        return;
                    }
                }
            }
        }

        let expired: Vec<Dlci> = self
            .dlcs
            .values()
            .filter(|dlc| dlc.timed_out(now))
            .map(|dlc| dlc.dlci)
            .collect();
        for dlci in expired {
            let Some(dlc) = self.dlcs.get_mut(&dlci) else {
                continue;
            };
            dlc.clear_timer();
            match dlc.state {
                DlcState::WaitConn | DlcState::Config => {
                    warn!("{}: dlc {} timed out while connecting", self.id, dlci);
                    if dlc.outgoing && dlc.sabm_sent {
                        self.send_command(FrameType::Disc, dlci);
                    } else if !dlc.outgoing {
                        self.send_response(FrameType::Dm, dlci);
                    }
                    self.close_dlc(env, dlci, CloseReason::Timeout);
                }
                DlcState::Disconnecting => {
                    warn!("{}: dlc {} timed out while disconnecting", self.id, dlci);
                    self.close_dlc(env, dlci, CloseReason::Timeout);
                }
                _ => {}
            }
        }

        if self.state == SessionState::Open && self.dlcs.is_empty() && self.timer.is_none() {
            self.set_timer(now + env.config.idle_timeout, SessionTimer::Idle);
        }
    }

    /// Whether queued data can move without further input
    fn has_pending_tx(&self) -> bool {
        self.state == SessionState::Open
            && !self.flow_off
            && self.dlcs.values().any(|dlc| {
                matches!(dlc.state, DlcState::Open | DlcState::Disconnecting)
                    && dlc.tx_ready()
                    && !dlc.tx_throttled
                    && !dlc.tx_queue.is_empty()
                    && dlc.flow.can_send()
            })
    }

    /// Earliest time the session needs another pass
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        if matches!(self.state, SessionState::Listening | SessionState::Closed) {
            return None;
        }
        if !self.rx_queue.is_empty() || !self.outbox.is_empty() || self.has_pending_tx() {
            return Some(now);
        }
        if self.state == SessionState::Open && self.dlcs.is_empty() && self.timer.is_none() {
            return Some(now);
        }

        self.dlcs
            .values()
            .filter_map(|dlc| dlc.timer)
            .chain(self.timer.map(|(deadline, _)| deadline))
            .min()
    }
}
