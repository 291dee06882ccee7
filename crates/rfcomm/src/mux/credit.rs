//! Credit based flow control for a single DLC

use crate::constants::{RFCOMM_DEFAULT_CREDITS, RFCOMM_MAX_CREDITS};

/// Per-DLC credit counters.
///
/// `tx` is what the peer allows us to send, `rx` is what we allowed the peer
/// to send and it has not used yet. Both saturate at zero.
#[derive(Debug, Clone)]
pub struct CreditFlow {
    /// Maximum outstanding credits we hand out; zero when credit flow is off
    max: u8,
    /// Most send credits we hold at once
    tx_max: u16,
    tx: u16,
    rx: u16,
    granted_total: u64,
    consumed_total: u64,
}

impl Default for CreditFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl CreditFlow {
    pub fn new() -> Self {
        Self {
            max: 0,
            tx_max: 0,
            tx: 0,
            rx: RFCOMM_DEFAULT_CREDITS as u16,
            granted_total: 0,
            consumed_total: 0,
        }
    }

    /// Switch credit flow on with the peer's initial grant from PN.
    ///
    /// Send credits are never held beyond `tx_max`.
    pub fn enable(&mut self, initial: u8, tx_max: u16) {
        self.max = RFCOMM_MAX_CREDITS;
        self.tx_max = tx_max.max(1);
        self.tx = (initial as u16).min(self.tx_max);
        self.granted_total = self.tx as u64;
        self.consumed_total = 0;
    }

    pub fn disable(&mut self) {
        self.max = 0;
        self.tx = 0;
    }

    pub fn is_enabled(&self) -> bool {
        self.max != 0
    }

    pub fn tx_credits(&self) -> u16 {
        self.tx
    }

    pub fn rx_credits(&self) -> u16 {
        self.rx
    }

    /// Credits received from the peer since the DLC opened
    pub fn granted_total(&self) -> u64 {
        self.granted_total
    }

    /// Frames sent against those credits
    pub fn consumed_total(&self) -> u64 {
        self.consumed_total
    }

    /// Whether one more frame may go out
    pub fn can_send(&self) -> bool {
        !self.is_enabled() || self.tx > 0
    }

    /// Account for one transmitted frame. Returns false if no credit was left.
    pub fn consume(&mut self) -> bool {
        if !self.is_enabled() {
            return true;
        }
        match self.tx.checked_sub(1) {
            Some(left) => {
                self.tx = left;
                self.consumed_total += 1;
                true
            }
            None => false,
        }
    }

    /// Credits granted by the peer. Returns how many were dropped for
    /// exceeding the cap.
    pub fn grant(&mut self, credits: u8) -> u16 {
        if !self.is_enabled() {
            return 0;
        }
        let total = self.tx.saturating_add(credits as u16);
        let kept = total.min(self.tx_max);
        self.granted_total += (kept - self.tx) as u64;
        self.tx = kept;
        total - kept
    }

    /// Account for one received data frame
    pub fn on_receive(&mut self) {
        if self.is_enabled() {
            self.rx = self.rx.saturating_sub(1);
        }
    }

    /// Credits to hand back to the peer, if the outstanding grant has drained
    /// to a quarter of the maximum and the receive side is not throttled.
    pub fn replenish(&mut self, throttled: bool) -> Option<u8> {
        let max = self.max as u16;
        if !self.is_enabled() || throttled || self.rx > max / 4 {
            return None;
        }
        let credits = max - self.rx;
        self.rx = max;
        u8::try_from(credits).ok().filter(|c| *c > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::RFCOMM_MAX_TX_CREDITS;

    #[test]
    fn test_disabled_flow_never_blocks() {
        let mut flow = CreditFlow::new();
        assert!(!flow.is_enabled());
        assert!(flow.can_send());
        assert!(flow.consume());
        flow.grant(10);
        assert_eq!(flow.tx_credits(), 0);
        assert_eq!(flow.replenish(false), None);
    }

    #[test]
    fn test_consumption_never_exceeds_grants() {
        let mut flow = CreditFlow::new();
        flow.enable(2, RFCOMM_MAX_TX_CREDITS);

        assert!(flow.consume());
        assert!(flow.consume());
        assert!(!flow.can_send());
        assert!(!flow.consume());
        assert_eq!(flow.tx_credits(), 0);

        flow.grant(3);
        while flow.consume() {}
        assert_eq!(flow.granted_total(), 5);
        assert_eq!(flow.consumed_total(), 5);
    }

    #[test]
    fn test_replenish_watermark() {
        let mut flow = CreditFlow::new();
        flow.enable(0, RFCOMM_MAX_TX_CREDITS);

        // The initial advertisement is below the watermark
        assert_eq!(
            flow.replenish(false),
            Some(RFCOMM_MAX_CREDITS - RFCOMM_DEFAULT_CREDITS)
        );
        assert_eq!(flow.rx_credits(), RFCOMM_MAX_CREDITS as u16);
        assert_eq!(flow.replenish(false), None);

        for _ in 0..30 {
            flow.on_receive();
        }
        assert_eq!(flow.replenish(false), Some(30));

        for _ in 0..60 {
            flow.on_receive();
        }
        assert_eq!(flow.rx_credits(), 0);
        assert_eq!(flow.replenish(true), None);
        assert_eq!(flow.replenish(false), Some(RFCOMM_MAX_CREDITS));
    }

    #[test]
    fn test_grants_are_capped() {
        let mut flow = CreditFlow::new();
        flow.enable(7, 40);

        let mut dropped = 0;
        for _ in 0..10 {
            dropped += flow.grant(255);
        }
        assert_eq!(flow.tx_credits(), 40);
        assert_eq!(dropped, 7 + 10 * 255 - 40);
        assert_eq!(flow.granted_total(), 40);

        while flow.consume() {}
        assert_eq!(flow.consumed_total(), flow.granted_total());
        assert_eq!(flow.grant(5), 0);
        assert_eq!(flow.tx_credits(), 5);

        let mut flow = CreditFlow::new();
        flow.enable(200, 40);
        assert_eq!(flow.tx_credits(), 40);
    }
}
