//! End to end tests: two RFCOMM instances joined by an in-memory link

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::*;
use crate::error::CloseReason;
use crate::mcc::{ModemSignals, ParamMask, PortSettings};
use crate::mux::DlcEvent;
use crate::types::{DlcState, SecurityLevel, SendStatus, SessionState};

const CLIENT: BdAddr = BdAddr {
    bytes: [0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6],
};
const SERVER: BdAddr = BdAddr {
    bytes: [0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6],
};
const WAIT: Duration = Duration::from_secs(5);

/// One direction of a pipe: frames go to the other side's notifier
struct PipeLink {
    peer: Mutex<Option<LinkNotifier>>,
}

impl PipeLink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            peer: Mutex::new(None),
        })
    }

    fn connect_to(&self, notifier: LinkNotifier) {
        *self.peer.lock().unwrap() = Some(notifier);
    }
}

impl Link for PipeLink {
    fn send(&self, frame: &[u8]) -> io::Result<()> {
        match self.peer.lock().unwrap().as_ref() {
            Some(peer) => {
                peer.data_ready(frame.to_vec());
                Ok(())
            }
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn mtu(&self) -> u16 {
        672
    }

    fn security_level(&self) -> SecurityLevel {
        SecurityLevel::AuthenticationAndEncryption
    }

    fn request_security(&self, _level: SecurityLevel) -> bool {
        true
    }

    fn shutdown(&self) {
        if let Some(peer) = self.peer.lock().unwrap().take() {
            peer.closed();
        }
    }
}

/// Connects straight into another RFCOMM instance
struct PipeConnector {
    server: Arc<Rfcomm>,
}

impl Connector for PipeConnector {
    fn connect(
        &self,
        local: BdAddr,
        remote: BdAddr,
        notifier: LinkNotifier,
    ) -> io::Result<Arc<dyn Link>> {
        let to_server = PipeLink::new();
        let to_client = PipeLink::new();
        to_client.connect_to(notifier);

        let server_side: Arc<dyn Link> = to_client.clone();
        let server_notifier = self
            .server
            .accept_link(remote, local, server_side)
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e))?;
        to_server.connect_to(server_notifier);

        let link: Arc<dyn Link> = to_server;
        Ok(link)
    }
}

/// Link whose frames are never answered
struct SilentLink {
    closed: AtomicBool,
}

impl Link for SilentLink {
    fn send(&self, _frame: &[u8]) -> io::Result<()> {
        Ok(())
    }

    fn mtu(&self) -> u16 {
        672
    }

    fn security_level(&self) -> SecurityLevel {
        SecurityLevel::None
    }

    fn request_security(&self, _level: SecurityLevel) -> bool {
        true
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct SilentConnector;

impl Connector for SilentConnector {
    fn connect(&self, _: BdAddr, _: BdAddr, _: LinkNotifier) -> io::Result<Arc<dyn Link>> {
        let link: Arc<dyn Link> = Arc::new(SilentLink {
            closed: AtomicBool::new(false),
        });
        Ok(link)
    }
}

struct RefusingConnector;

impl Connector for RefusingConnector {
    fn connect(&self, _: BdAddr, _: BdAddr, _: LinkNotifier) -> io::Result<Arc<dyn Link>> {
        Err(io::ErrorKind::ConnectionRefused.into())
    }
}

fn pair() -> (Arc<Rfcomm>, Rfcomm) {
    let server = Arc::new(Rfcomm::new(RfcommConfig::default(), Arc::new(RefusingConnector)).unwrap());
    let client = Rfcomm::new(
        RfcommConfig::default(),
        Arc::new(PipeConnector {
            server: Arc::clone(&server),
        }),
    )
    .unwrap();
    (server, client)
}

fn next_data(handle: &DlcHandle) -> Vec<u8> {
    loop {
        match handle.recv_event_timeout(WAIT) {
            Some(DlcEvent::Data(data)) => return data,
            Some(DlcEvent::Closed(reason)) => panic!("closed while waiting for data: {reason}"),
            Some(_) => continue,
            None => panic!("no data received"),
        }
    }
}

fn next_matching<F>(handle: &DlcHandle, mut pred: F) -> DlcEvent
where
    F: FnMut(&DlcEvent) -> bool,
{
    loop {
        match handle.recv_event_timeout(WAIT) {
            Some(event) if pred(&event) => return event,
            Some(_) => continue,
            None => panic!("expected event not received"),
        }
    }
}

fn wait_closed(handle: &DlcHandle) -> CloseReason {
    match next_matching(handle, |e| matches!(e, DlcEvent::Closed(_))) {
        DlcEvent::Closed(reason) => reason,
        _ => unreachable!(),
    }
}

#[test]
fn test_echo_between_instances() {
    let (server, client) = pair();
    let listener = server
        .listen(BdAddr::ANY, 3, ListenPolicy::default())
        .unwrap();
    assert!(server.is_listening(&SERVER));

    let handle = client.open(CLIENT, SERVER, 3).unwrap();
    assert_eq!(handle.wait_connected(WAIT).unwrap(), 667);
    assert_eq!(handle.state(), DlcState::Open);

    let peer = listener.accept_timeout(WAIT).unwrap();
    assert_eq!(peer.channel(), 3);
    assert_eq!(peer.remote(), CLIENT);
    assert_eq!(peer.wait_connected(WAIT).unwrap(), 667);

    assert_eq!(handle.send(b"ping").unwrap(), SendStatus::Accepted);
    assert_eq!(next_data(&peer), b"ping");

    let big: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    peer.send(&big).unwrap();
    let mut received = Vec::new();
    while received.len() < big.len() {
        received.extend(next_data(&handle));
    }
    assert_eq!(received, big);

    let session = client.connection_info(&CLIENT, &SERVER).unwrap();
    assert_eq!(session.state, SessionState::Open);
    assert!(session.initiator);
    assert_eq!(session.dlcs.len(), 1);
    assert!(session.dlcs[0].credit_mode);

    handle.close().unwrap();
    assert_eq!(wait_closed(&handle), CloseReason::Local);
    assert_eq!(wait_closed(&peer), CloseReason::RemoteDisconnect);
}

#[test]
fn test_modem_status_and_port_settings() {
    let (server, client) = pair();
    let listener = server
        .listen(BdAddr::ANY, 7, ListenPolicy::default())
        .unwrap();
    let handle = client.open(CLIENT, SERVER, 7).unwrap();
    handle.wait_connected(WAIT).unwrap();
    let peer = listener.accept_timeout(WAIT).unwrap();
    peer.wait_connected(WAIT).unwrap();

    let signals = ModemSignals::RTC | ModemSignals::IC;
    handle.set_modem_status(signals).unwrap();
    assert_eq!(
        next_matching(&peer, |e| *e == DlcEvent::ModemStatus(signals)),
        DlcEvent::ModemStatus(signals)
    );

    let settings = PortSettings {
        bit_rate: crate::constants::RFCOMM_RPN_BR_115200,
        ..PortSettings::default()
    };
    handle
        .negotiate_port(settings, ParamMask::BITRATE)
        .unwrap();
    let expected = DlcEvent::PortSettings(settings, ParamMask::BITRATE);
    assert_eq!(next_matching(&handle, |e| *e == expected), expected);
    assert_eq!(next_matching(&peer, |e| *e == expected), expected);
}

#[test]
fn test_unregistered_channel_is_refused() {
    let (server, client) = pair();
    let _listener = server
        .listen(BdAddr::ANY, 5, ListenPolicy::default())
        .unwrap();

    let handle = client.open(CLIENT, SERVER, 3).unwrap();
    assert!(matches!(
        handle.wait_connected(WAIT),
        Err(RfcommError::ConnectionRefused)
    ));
    assert_eq!(handle.close_reason(), Some(CloseReason::Refused));
}

#[test]
fn test_duplicate_listen_is_busy() {
    let (server, _client) = pair();
    let _listener = server
        .listen(BdAddr::ANY, 5, ListenPolicy::default())
        .unwrap();
    assert!(matches!(
        server.listen(BdAddr::ANY, 5, ListenPolicy::default()),
        Err(RfcommError::Busy(5))
    ));
    assert!(matches!(
        server.listen(BdAddr::ANY, 0, ListenPolicy::default()),
        Err(RfcommError::InvalidParameter(_))
    ));
}

#[test]
fn test_dropped_listener_stops_listening() {
    let (server, _client) = pair();
    let listener = server
        .listen(SERVER, 5, ListenPolicy::default())
        .unwrap();
    assert!(server.is_listening(&SERVER));
    drop(listener);

    // Unlisten is handled before the next request completes
    let _other = server
        .listen(CLIENT, 6, ListenPolicy::default())
        .unwrap();
    assert!(!server.is_listening(&SERVER));
}

#[test]
fn test_connect_failure_reported() {
    let rfcomm = Rfcomm::new(RfcommConfig::default(), Arc::new(RefusingConnector)).unwrap();
    let handle = rfcomm.open(CLIENT, SERVER, 1).unwrap();
    assert!(matches!(
        handle.wait_connected(WAIT),
        Err(RfcommError::ConnectionRefused)
    ));
}

#[test]
fn test_wait_connected_times_out() {
    let rfcomm = Rfcomm::new(RfcommConfig::default(), Arc::new(SilentConnector)).unwrap();
    let handle = rfcomm.open(CLIENT, SERVER, 1).unwrap();
    assert!(matches!(
        handle.wait_connected(Duration::from_millis(50)),
        Err(RfcommError::Timeout)
    ));
    assert!(matches!(handle.send(b"x"), Err(RfcommError::NotConnected)));
}

#[test]
fn test_invalid_config_rejected() {
    let config = RfcommConfig {
        max_sessions: 0,
        ..RfcommConfig::default()
    };
    assert!(matches!(
        Rfcomm::new(config, Arc::new(RefusingConnector)),
        Err(RfcommError::InvalidParameter(_))
    ));
}

#[test]
fn test_shutdown_stops_worker() {
    let rfcomm = Rfcomm::new(RfcommConfig::default(), Arc::new(SilentConnector)).unwrap();
    let handle = rfcomm.open(CLIENT, SERVER, 2).unwrap();
    rfcomm.shutdown();

    assert_eq!(wait_closed(&handle), CloseReason::Shutdown);
    assert!(matches!(
        rfcomm.open(CLIENT, SERVER, 2),
        Err(RfcommError::WorkerGone)
    ));
    assert!(rfcomm.connection_list().is_empty());
}
