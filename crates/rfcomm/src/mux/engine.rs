//! RFCOMM multiplexer engine
//!
//! This module provides the worker side of RFCOMM:
//! - The work queue fed by API callers and transports
//! - Session creation for outbound and inbound links
//! - Listener registration
//! - The processing pass that drives every session and its timers

use std::collections::HashMap;
use std::io;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log::{debug, info, warn};

use crate::bdaddr::BdAddr;
use crate::config::RfcommConfig;
use crate::constants::RFCOMM_MAX_CHANNEL;
use crate::error::{CloseReason, RfcommError, RfcommResult};
use crate::link::{Connector, Link, LinkNotifier};
use crate::mcc::{ModemSignals, ParamMask, PortSettings};
use crate::service::{DlcHandle, ListenPolicy};
use crate::types::{Dlci, DlcId, DlcOptions, DlcState, SessionId, SessionState};

use super::dlc::{Dlc, DlcEvent, DlcShared};
use super::registry::{find_connected, find_dlc, SessionRegistry};
use super::session::Session;

/// A locally requested DLC
pub(crate) struct OpenRequest {
    pub id: DlcId,
    pub local: BdAddr,
    pub remote: BdAddr,
    pub channel: u8,
    pub options: DlcOptions,
    pub shared: Arc<DlcShared>,
    pub events: Sender<DlcEvent>,
}

/// Everything the worker can be asked to do
pub(crate) enum Work {
    Open {
        request: OpenRequest,
        reply: Sender<RfcommResult<()>>,
    },
    Close {
        dlc: DlcId,
        reason: CloseReason,
    },
    Send {
        dlc: DlcId,
        data: Vec<u8>,
    },
    Throttle {
        dlc: DlcId,
        on: bool,
    },
    SetModemStatus {
        dlc: DlcId,
        signals: ModemSignals,
    },
    NegotiatePort {
        dlc: DlcId,
        settings: PortSettings,
        mask: ParamMask,
    },
    Listen {
        local: BdAddr,
        channel: u8,
        policy: ListenPolicy,
        backlog: Sender<DlcHandle>,
        reply: Sender<RfcommResult<()>>,
    },
    Unlisten {
        local: BdAddr,
        channel: u8,
    },
    LinkUp {
        session: SessionId,
        link: Arc<dyn Link>,
    },
    LinkFailed {
        session: SessionId,
        kind: io::ErrorKind,
    },
    LinkAccepted {
        session: SessionId,
        local: BdAddr,
        remote: BdAddr,
        link: Arc<dyn Link>,
    },
    LinkData {
        session: SessionId,
        data: Vec<u8>,
    },
    LinkClosed {
        session: SessionId,
    },
    SecurityChanged {
        session: SessionId,
        success: bool,
    },
    /// The owner read enough data to resume a paused receive side
    RxDrained {
        dlc: DlcId,
    },
    /// The handle was dropped
    Release {
        dlc: DlcId,
    },
    Shutdown,
}

/// A registered server channel
pub(crate) struct ListenerEntry {
    pub policy: ListenPolicy,
    pub backlog: Sender<DlcHandle>,
}

/// Handle of an inbound DLC, delivered to the listener once the DLC opens
pub(crate) struct PendingAccept {
    pub handle: DlcHandle,
    pub backlog: Sender<DlcHandle>,
}

/// Worker state borrowed by session handlers
pub(crate) struct Env<'a> {
    pub config: &'a RfcommConfig,
    pub registry: &'a Arc<SessionRegistry>,
    pub work_tx: &'a Sender<Work>,
    pub listeners: &'a mut HashMap<(BdAddr, u8), ListenerEntry>,
    pub accepts: &'a mut HashMap<DlcId, PendingAccept>,
}

fn close_reason_for(kind: io::ErrorKind) -> CloseReason {
    match kind {
        io::ErrorKind::ConnectionRefused => CloseReason::Refused,
        io::ErrorKind::TimedOut => CloseReason::Timeout,
        io::ErrorKind::PermissionDenied => CloseReason::Security,
        _ => CloseReason::Transport,
    }
}

fn check_channel(channel: u8) -> RfcommResult<()> {
    if channel == 0 || channel > RFCOMM_MAX_CHANNEL {
        return Err(RfcommError::InvalidParameter(format!(
            "channel {channel} outside 1..={RFCOMM_MAX_CHANNEL}"
        )));
    }
    Ok(())
}

/// The RFCOMM worker
pub(crate) struct Mux {
    config: RfcommConfig,
    registry: Arc<SessionRegistry>,
    connector: Arc<dyn Connector>,
    listeners: HashMap<(BdAddr, u8), ListenerEntry>,
    accepts: HashMap<DlcId, PendingAccept>,
    work_tx: Sender<Work>,
}

impl Mux {
    pub fn new(
        config: RfcommConfig,
        registry: Arc<SessionRegistry>,
        connector: Arc<dyn Connector>,
        work_tx: Sender<Work>,
    ) -> Self {
        Self {
            config,
            registry,
            connector,
            listeners: HashMap::new(),
            accepts: HashMap::new(),
            work_tx,
        }
    }

    fn env(&mut self) -> Env<'_> {
        Env {
            config: &self.config,
            registry: &self.registry,
            work_tx: &self.work_tx,
            listeners: &mut self.listeners,
            accepts: &mut self.accepts,
        }
    }

    /// Serve the work queue until shut down
    pub fn run(mut self, rx: Receiver<Work>) {
        info!("RFCOMM worker started");
        loop {
            let work = match self.next_deadline(Instant::now()) {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(timeout) {
                        Ok(work) => Some(work),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match rx.recv() {
                    Ok(work) => Some(work),
                    Err(_) => break,
                },
            };

            if let Some(work) = work {
                if !self.handle(work, Instant::now()) {
                    info!("RFCOMM worker stopped");
                    return;
                }
                while let Ok(work) = rx.try_recv() {
                    if !self.handle(work, Instant::now()) {
                        info!("RFCOMM worker stopped");
                        return;
                    }
                }
            }

            self.process(Instant::now());
        }
        self.shutdown();
    }

    /// Apply one work item. Returns false once the worker should stop.
    pub fn handle(&mut self, work: Work, now: Instant) -> bool {
        match work {
            Work::Open { request, reply } => {
                let result = self.open(request, now);
                if let Err(e) = &result {
                    debug!("open refused: {}", e);
                }
                let _ = reply.send(result);
            }
            Work::Close { dlc, reason } => {
                self.with_dlc(dlc, |session, env, dlci| {
                    session.close_request(env, dlci, reason, now)
                });
            }
            Work::Release { dlc } => {
                self.with_dlc(dlc, |session, env, dlci| {
                    session.close_request(env, dlci, CloseReason::Local, now)
                });
            }
            Work::RxDrained { dlc } => {
                self.with_dlc(dlc, |session, _, dlci| session.rx_drained(dlci));
            }
            Work::Send { dlc, data } => {
                self.with_dlc(dlc, |session, _, dlci| session.queue_data(dlci, data));
            }
            Work::Throttle { dlc, on } => {
                self.with_dlc(dlc, |session, _, dlci| session.throttle(dlci, on));
            }
            Work::SetModemStatus { dlc, signals } => {
                self.with_dlc(dlc, |session, _, dlci| {
                    session.set_modem_status(dlci, signals)
                });
            }
            Work::NegotiatePort {
                dlc,
                settings,
                mask,
            } => {
                self.with_dlc(dlc, |session, _, dlci| {
                    session.negotiate_port(dlci, settings, mask)
                });
            }
            Work::Listen {
                local,
                channel,
                policy,
                backlog,
                reply,
            } => {
                let result = self.listen(local, channel, policy, backlog);
                let _ = reply.send(result);
            }
            Work::Unlisten { local, channel } => self.unlisten(local, channel),
            Work::LinkUp { session, link } => {
                let handled = self.with_session(session, |s, env| s.link_up(env, Arc::clone(&link), now));
                if !handled {
                    debug!("{}: link up for a session that is gone", session);
                    link.shutdown();
                }
            }
            Work::LinkFailed { session, kind } => {
                warn!("{}: transport connect failed: {:?}", session, kind);
                self.with_session(session, |s, env| s.close(env, close_reason_for(kind)));
            }
            Work::LinkAccepted {
                session,
                local,
                remote,
                link,
            } => self.accept_link(session, local, remote, link, now),
            Work::LinkData { session, data } => {
                self.with_session(session, |s, _| s.rx_queue.push_back(data));
            }
            Work::LinkClosed { session } => {
                self.with_session(session, |s, env| s.close(env, CloseReason::Transport));
            }
            Work::SecurityChanged { session, success } => {
                self.with_session(session, |s, env| s.security_changed(env, success, now));
            }
            Work::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    fn with_session<F>(&mut self, id: SessionId, f: F) -> bool
    where
        F: FnOnce(&mut Session, &mut Env<'_>),
    {
        let registry = Arc::clone(&self.registry);
        let mut sessions = registry.write();
        let Some(session) = sessions.get_mut(&id) else {
            return false;
        };
        let mut env = self.env();
        f(session, &mut env);
        true
    }

    fn with_dlc<F>(&mut self, id: DlcId, f: F) -> bool
    where
        F: FnOnce(&mut Session, &mut Env<'_>, Dlci),
    {
        let registry = Arc::clone(&self.registry);
        let mut sessions = registry.write();
        let Some((session_id, dlci)) = find_dlc(&sessions, id) else {
            return false;
        };
        let Some(session) = sessions.get_mut(&session_id) else {
            return false;
        };
        let mut env = self.env();
        f(session, &mut env, dlci);
        true
    }

    fn open(&mut self, request: OpenRequest, now: Instant) -> RfcommResult<()> {
        check_channel(request.channel)?;
        if request.options.priority > 0x3F {
            return Err(RfcommError::InvalidParameter(format!(
                "priority {} out of range",
                request.options.priority
            )));
        }
        if request.options.mtu == Some(0) {
            return Err(RfcommError::InvalidParameter("MTU must be non-zero".into()));
        }

        let registry = Arc::clone(&self.registry);
        let mut sessions = registry.write();

        let session_id = match find_connected(&sessions, &request.local, &request.remote) {
            Some(id) => id,
            None => {
                let active = sessions
                    .values()
                    .filter(|s| s.state != SessionState::Listening)
                    .count();
                if active >= self.config.max_sessions {
                    return Err(RfcommError::ResourceLimitReached);
                }
                let id = self.registry.next_session_id();
                self.spawn_connect(id, request.local, request.remote)?;
                info!("{}: connecting to {}", id, request.remote);
                sessions.insert(
                    id,
                    Session::outgoing(id, request.local, request.remote, &self.config, now),
                );
                id
            }
        };

        let session = sessions
            .get_mut(&session_id)
            .ok_or(RfcommError::NotConnected)?;
        let dlci = session.dlci_for(request.channel);
        if session.dlcs.contains_key(&dlci) {
            return Err(RfcommError::Busy(request.channel));
        }

        let mut dlc = Dlc::new(
            request.id,
            dlci,
            true,
            request.options.security,
            request.options.mtu.or(self.config.channel_mtu),
            request.options.priority,
            request.shared,
            request.events,
        );
        dlc.set_state(DlcState::WaitConn);
        dlc.set_timer(now, self.config.conn_timeout);
        session.link_dlc(dlc);
        debug!("{}: dlc {} requested on channel {}", session_id, dlci, request.channel);

        if session.state == SessionState::Open {
            let mut env = self.env();
            session.start_dlc(&mut env, dlci);
        }
        Ok(())
    }

    fn spawn_connect(&self, id: SessionId, local: BdAddr, remote: BdAddr) -> RfcommResult<()> {
        let connector = Arc::clone(&self.connector);
        let notifier = LinkNotifier::new(id, self.work_tx.clone());
        thread::Builder::new()
            .name(format!("rfcomm-connect-{id}"))
            .spawn(move || match connector.connect(local, remote, notifier.clone()) {
                Ok(link) => notifier.post(Work::LinkUp { session: id, link }),
                Err(e) => {
                    warn!("{}: connect to {} failed: {}", id, remote, e);
                    notifier.post(Work::LinkFailed {
                        session: id,
                        kind: e.kind(),
                    });
                }
            })?;
        Ok(())
    }

    fn listen(
        &mut self,
        local: BdAddr,
        channel: u8,
        policy: ListenPolicy,
        backlog: Sender<DlcHandle>,
    ) -> RfcommResult<()> {
        check_channel(channel)?;
        if self.listeners.contains_key(&(local, channel)) {
            return Err(RfcommError::Busy(channel));
        }
        self.listeners
            .insert((local, channel), ListenerEntry { policy, backlog });

        let mut sessions = self.registry.write();
        let listening = sessions
            .values()
            .any(|s| s.state == SessionState::Listening && s.local == local);
        if !listening {
            let id = self.registry.next_session_id();
            sessions.insert(id, Session::listening(id, local, &self.config));
        }
        info!("listening on {} channel {}", local, channel);
        Ok(())
    }

    fn unlisten(&mut self, local: BdAddr, channel: u8) {
        if self.listeners.remove(&(local, channel)).is_none() {
            return;
        }
        debug!("stopped listening on {} channel {}", local, channel);
        if self.listeners.keys().any(|(addr, _)| *addr == local) {
            return;
        }
        self.registry
            .write()
            .retain(|_, s| !(s.state == SessionState::Listening && s.local == local));
    }

    fn accept_link(
        &mut self,
        id: SessionId,
        local: BdAddr,
        remote: BdAddr,
        link: Arc<dyn Link>,
        now: Instant,
    ) {
        if !self.listeners.keys().any(|(addr, _)| addr.matches(&local)) {
            warn!("{}: no listener for {}, dropping link from {}", id, local, remote);
            link.shutdown();
            return;
        }

        let mut sessions = self.registry.write();
        let active = sessions
            .values()
            .filter(|s| s.state != SessionState::Listening)
            .count();
        if active >= self.config.max_sessions {
            warn!("{}: session limit reached, dropping link from {}", id, remote);
            link.shutdown();
            return;
        }

        info!("{}: accepted link from {}", id, remote);
        sessions.insert(
            id,
            Session::accepted(id, local, remote, link, &self.config, now),
        );
    }

    /// Run one pass over every session
    pub fn process(&mut self, now: Instant) {
        let registry = Arc::clone(&self.registry);
        let mut sessions = registry.write();
        let mut env = self.env();
        for session in sessions.values_mut() {
            session.process(&mut env, now);
        }
        sessions.retain(|_, s| s.state != SessionState::Closed);
    }

    /// When the next pass is due, if any work is pending
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        self.registry
            .read()
            .values()
            .filter_map(|s| s.next_deadline(now))
            .min()
    }

    /// Close every session and forget all listeners
    pub fn shutdown(&mut self) {
        let registry = Arc::clone(&self.registry);
        let mut sessions = registry.write();
        let mut env = self.env();
        for session in sessions.values_mut() {
            session.close(&mut env, CloseReason::Shutdown);
        }
        sessions.clear();
        env.listeners.clear();
        env.accepts.clear();
    }
}
