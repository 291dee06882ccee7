//! Runtime configuration of the RFCOMM layer

use std::time::Duration;

use crate::constants::*;
use crate::error::{RfcommError, RfcommResult};

/// Tunables applied to every session and DLC
#[derive(Debug, Clone)]
pub struct RfcommConfig {
    /// Never request credit based flow control in PN
    pub disable_cfc: bool,
    /// Upper bound on the MTU proposed or accepted per channel
    pub channel_mtu: Option<u16>,
    /// Largest transport packet used by a session
    pub l2cap_mtu: u16,
    /// Send PN before SABM when opening a DLC
    pub parameter_negotiation: bool,
    /// Maximum number of connected sessions (listening sessions excluded)
    pub max_sessions: usize,
    /// Bytes buffered per DLC before `send` reports backpressure
    pub tx_queue_limit: usize,
    /// Unread received bytes per DLC before the peer is paused. Sending
    /// resumes once the owner has read half of it.
    pub rx_queue_limit: usize,
    /// Most send credits held at once; larger grants are trimmed
    pub max_tx_credits: u16,
    pub conn_timeout: Duration,
    pub disc_timeout: Duration,
    pub auth_timeout: Duration,
    /// Delay before an unused session is torn down
    pub idle_timeout: Duration,
}

impl Default for RfcommConfig {
    fn default() -> Self {
        Self {
            disable_cfc: false,
            channel_mtu: None,
            l2cap_mtu: RFCOMM_MAX_L2CAP_MTU,
            parameter_negotiation: true,
            max_sessions: RFCOMM_MAX_SESSIONS,
            tx_queue_limit: RFCOMM_TX_QUEUE_LIMIT,
            rx_queue_limit: RFCOMM_RX_QUEUE_LIMIT,
            max_tx_credits: RFCOMM_MAX_TX_CREDITS,
            conn_timeout: RFCOMM_CONN_TIMEOUT,
            disc_timeout: RFCOMM_DISC_TIMEOUT,
            auth_timeout: RFCOMM_AUTH_TIMEOUT,
            idle_timeout: RFCOMM_IDLE_TIMEOUT,
        }
    }
}

impl RfcommConfig {
    /// Check that every value is usable
    pub fn validate(&self) -> RfcommResult<()> {
        if let Some(mtu) = self.channel_mtu {
            if mtu == 0 || mtu as usize > RFCOMM_MAX_FRAME_PAYLOAD {
                return Err(RfcommError::InvalidParameter(format!(
                    "channel MTU {mtu} out of range"
                )));
            }
        }

        if self.l2cap_mtu <= RFCOMM_HDR_OVERHEAD {
            return Err(RfcommError::InvalidParameter(format!(
                "L2CAP MTU {} leaves no room for payload",
                self.l2cap_mtu
            )));
        }

        if self.max_sessions == 0 {
            return Err(RfcommError::InvalidParameter(
                "max_sessions must be at least 1".into(),
            ));
        }

        let limits = [
            ("tx_queue_limit", self.tx_queue_limit),
            ("rx_queue_limit", self.rx_queue_limit),
            ("max_tx_credits", self.max_tx_credits as usize),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(RfcommError::InvalidParameter(format!(
                    "{name} must be at least 1"
                )));
            }
        }

        let timers = [
            ("conn_timeout", self.conn_timeout),
            ("disc_timeout", self.disc_timeout),
            ("auth_timeout", self.auth_timeout),
            ("idle_timeout", self.idle_timeout),
        ];
        for (name, value) in timers {
            if value.is_zero() {
                return Err(RfcommError::InvalidParameter(format!("{name} must be non-zero")));
            }
        }

        Ok(())
    }

    /// Session MTU for a transport with the given packet size
    pub(crate) fn session_mtu(&self, link_mtu: u16) -> u16 {
        link_mtu
            .min(self.l2cap_mtu)
            .saturating_sub(RFCOMM_HDR_OVERHEAD)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = RfcommConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session_mtu(672), 667);
        assert_eq!(config.session_mtu(4096), RFCOMM_MAX_L2CAP_MTU - RFCOMM_HDR_OVERHEAD);
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let config = RfcommConfig {
            channel_mtu: Some(0),
            ..RfcommConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RfcommError::InvalidParameter(_))
        ));

        let config = RfcommConfig {
            l2cap_mtu: 4,
            ..RfcommConfig::default()
        };
        assert!(config.validate().is_err());

        let config = RfcommConfig {
            rx_queue_limit: 0,
            ..RfcommConfig::default()
        };
        assert!(config.validate().is_err());

        let config = RfcommConfig {
            idle_timeout: Duration::ZERO,
            ..RfcommConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
