//! Type definitions shared across the RFCOMM layers

use std::fmt;

use crate::constants::RFCOMM_MAX_CHANNEL;

/// Data Link Connection Identifier: server channel plus direction bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dlci(u8);

impl Dlci {
    /// The multiplexer control channel
    pub const CONTROL: Dlci = Dlci(0);

    /// Wrap a raw 6-bit DLCI
    pub fn new(raw: u8) -> Option<Self> {
        if raw <= 0x3F {
            Some(Self(raw))
        } else {
            None
        }
    }

    /// Build the DLCI for `channel` as seen from a side with the given direction bit
    pub fn from_channel(channel: u8, direction: u8) -> Self {
        Self(((channel & 0x1F) << 1) | (direction & 0x01))
    }

    pub fn raw(&self) -> u8 {
        self.0
    }

    /// Server channel number
    pub fn channel(&self) -> u8 {
        self.0 >> 1
    }

    pub fn direction(&self) -> u8 {
        self.0 & 0x01
    }

    pub fn is_control(&self) -> bool {
        self.0 == 0
    }

    /// Whether the DLCI names a user channel (1..=30)
    pub fn is_user(&self) -> bool {
        (1..=RFCOMM_MAX_CHANNEL).contains(&self.channel())
    }
}

impl fmt::Display for Dlci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a session in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

/// Identifier of a DLC, stable for the lifetime of its handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DlcId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

impl fmt::Display for DlcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

/// Link security level, ordered from weakest to strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SecurityLevel {
    /// No security (no authentication, no encryption)
    #[default]
    None = 0,
    /// Authentication required
    Authentication = 1,
    /// Authentication and encryption required
    AuthenticationAndEncryption = 2,
    /// Secure Connections required with encryption
    SecureConnectionsWithEncryption = 3,
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session has been torn down
    Closed,
    /// Waiting for the underlying transport to connect
    WaitConn,
    /// Transport is up, waiting for the link security upgrade
    WaitSecurity,
    /// Waiting for SABM/UA on the control channel
    WaitMux,
    /// Multiplexer running, DLCs may be opened
    Open,
    /// DISC sent on the control channel
    Disconnecting,
    /// Passive session accepting inbound transports
    Listening,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::WaitConn => write!(f, "Waiting for transport"),
            Self::WaitSecurity => write!(f, "Waiting for security"),
            Self::WaitMux => write!(f, "Waiting for multiplexer start-up"),
            Self::Open => write!(f, "Open"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Listening => write!(f, "Listening"),
        }
    }
}

/// DLC state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DlcState {
    /// Channel is closed
    Closed = 0,
    /// PN or SABM sent (or queued until the session opens)
    WaitConn = 1,
    /// PN response received, SABM sent
    Config = 2,
    /// Channel is open and ready for data transfer
    Open = 3,
    /// DISC sent, waiting for UA or DM
    Disconnecting = 4,
}

impl DlcState {
    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::WaitConn,
            2 => Self::Config,
            3 => Self::Open,
            4 => Self::Disconnecting,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for DlcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::WaitConn => write!(f, "Waiting for connection"),
            Self::Config => write!(f, "Configuring"),
            Self::Open => write!(f, "Open"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Session-wide credit based flow control mode, decided by the first PN exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfcMode {
    Unknown,
    Disabled,
    Enabled,
}

/// Options applied to a locally opened DLC
#[derive(Debug, Clone, Copy)]
pub struct DlcOptions {
    /// Required link security level
    pub security: SecurityLevel,
    /// Proposed MTU; the configured channel MTU is used when unset
    pub mtu: Option<u16>,
    /// PN priority (0..=63)
    pub priority: u8,
}

impl Default for DlcOptions {
    fn default() -> Self {
        Self {
            security: SecurityLevel::None,
            mtu: None,
            priority: crate::constants::RFCOMM_DEFAULT_PRIORITY,
        }
    }
}

/// Outcome of a `send` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Data was queued for transmission
    Accepted,
    /// The transmit queue is full; nothing was queued
    Backpressure,
}

/// Read-only view of a DLC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlcInfo {
    pub id: DlcId,
    pub dlci: Dlci,
    pub channel: u8,
    pub state: DlcState,
    pub mtu: u16,
    pub priority: u8,
    pub credit_mode: bool,
    pub tx_credits: u16,
    pub rx_credits: u16,
    pub queued_frames: usize,
    pub modem_status: u8,
    pub remote_modem_status: u8,
    pub line_status: u8,
    /// Received bytes the owner has not read yet
    pub unread_bytes: usize,
}

/// Read-only view of a session and its DLCs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub local: crate::bdaddr::BdAddr,
    pub remote: crate::bdaddr::BdAddr,
    pub state: SessionState,
    pub initiator: bool,
    pub mtu: u16,
    pub credit_mode: CfcMode,
    pub dlcs: Vec<DlcInfo>,
}
