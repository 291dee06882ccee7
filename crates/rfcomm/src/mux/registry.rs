//! Session registry shared between the worker and API callers

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::bdaddr::BdAddr;
use crate::types::{DlcId, DlcInfo, SessionId, SessionInfo, SessionState};

use super::session::Session;

pub(crate) type SessionMap = HashMap<SessionId, Session>;

/// All sessions, keyed by id.
///
/// Only the worker takes the write lock. API callers read snapshots.
pub struct SessionRegistry {
    sessions: RwLock<SessionMap>,
    next_session: AtomicU32,
    next_dlc: AtomicU32,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_session: AtomicU32::new(1),
            next_dlc: AtomicU32::new(1),
        }
    }

    pub(crate) fn next_session_id(&self) -> SessionId {
        SessionId(self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_dlc_id(&self) -> DlcId {
        DlcId(self.next_dlc.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, SessionMap> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, SessionMap> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of every session, ordered by id
    pub fn connection_list(&self) -> Vec<SessionInfo> {
        let sessions = self.read();
        let mut list: Vec<SessionInfo> = sessions.values().map(Session::info).collect();
        list.sort_by_key(|info| info.id);
        list
    }

    /// Snapshot of the connected session between `local` and `remote`
    pub fn connection_info(&self, local: &BdAddr, remote: &BdAddr) -> Option<SessionInfo> {
        let sessions = self.read();
        find_connected(&sessions, local, remote).map(|id| sessions[&id].info())
    }

    /// Snapshot of one DLC
    pub fn dlc_info(&self, id: DlcId) -> Option<DlcInfo> {
        self.read()
            .values()
            .flat_map(|session| session.dlcs.values())
            .find(|dlc| dlc.id == id)
            .map(|dlc| dlc.info())
    }

    /// Whether a listening session covers `local`
    pub(crate) fn is_listening(&self, local: &BdAddr) -> bool {
        self.read().values().any(|session| {
            session.state == SessionState::Listening && session.local.matches(local)
        })
    }
}

/// Session between the address pair that new DLCs may be multiplexed on
pub(crate) fn find_connected(
    sessions: &SessionMap,
    local: &BdAddr,
    remote: &BdAddr,
) -> Option<SessionId> {
    sessions
        .values()
        .filter(|session| &session.local == local && &session.remote == remote)
        .find(|session| {
            !matches!(
                session.state,
                SessionState::Closed | SessionState::Listening | SessionState::Disconnecting
            )
        })
        .map(|session| session.id)
}

/// Session that owns the given DLC
pub(crate) fn find_dlc(sessions: &SessionMap, id: DlcId) -> Option<(SessionId, crate::types::Dlci)> {
    sessions.values().find_map(|session| {
        session
            .dlcs
            .values()
            .find(|dlc| dlc.id == id)
            .map(|dlc| (session.id, dlc.dlci))
    })
}
