//! Type definitions for multiplexer control commands

use bitflags::bitflags;

use crate::constants::*;
use crate::types::Dlci;

bitflags! {
    /// V.24 control signals carried by MSC
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ModemSignals: u8 {
        /// Flow control: sender is unable to accept frames
        const FC = 0x02;
        /// Ready to communicate (DSR/DTR)
        const RTC = 0x04;
        /// Ready to receive (RTS/CTS)
        const RTR = 0x08;
        /// Incoming call (RI)
        const IC = 0x40;
        /// Data valid (DCD)
        const DV = 0x80;
    }
}

impl ModemSignals {
    /// Signals a freshly opened DLC announces
    pub fn initial() -> Self {
        Self::RTC | Self::RTR | Self::DV
    }
}

bitflags! {
    /// RPN parameter mask: which fields of a port negotiation are meaningful
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ParamMask: u16 {
        const BITRATE = 0x0001;
        const DATA_BITS = 0x0002;
        const STOP_BITS = 0x0004;
        const PARITY = 0x0008;
        const PARITY_TYPE = 0x0010;
        const XON_CHAR = 0x0020;
        const XOFF_CHAR = 0x0040;
        const XON_INPUT = 0x0100;
        const XON_OUTPUT = 0x0200;
        const RTR_INPUT = 0x0400;
        const RTR_OUTPUT = 0x0800;
        const RTC_INPUT = 0x1000;
        const RTC_OUTPUT = 0x2000;
        const FLOW = 0x3F00;
    }
}

/// RLS line status error bits
pub const RLS_ERROR: u8 = 0x01;
pub const RLS_OVERRUN: u8 = 0x02;
pub const RLS_PARITY: u8 = 0x04;
pub const RLS_FRAMING: u8 = 0x08;

/// Serial port parameters exchanged by RPN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSettings {
    /// Bit rate code (RFCOMM_RPN_BR_*)
    pub bit_rate: u8,
    /// Data bits code: 0 = 5 bits .. 3 = 8 bits
    pub data_bits: u8,
    /// 0 = 1 stop bit, 1 = 1.5 stop bits
    pub stop_bits: u8,
    /// 1 when parity is enabled
    pub parity: u8,
    /// Parity type code (odd, even, mark, space)
    pub parity_type: u8,
    /// Flow control bits, same layout as the upper byte of `ParamMask`
    pub flow_ctrl: u8,
    pub xon_char: u8,
    pub xoff_char: u8,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            bit_rate: RFCOMM_RPN_BR_9600,
            data_bits: RFCOMM_RPN_DATA_8,
            stop_bits: RFCOMM_RPN_STOP_1,
            parity: RFCOMM_RPN_PARITY_NONE,
            parity_type: 0,
            flow_ctrl: RFCOMM_RPN_FLOW_NONE,
            xon_char: RFCOMM_RPN_XON_CHAR,
            xoff_char: RFCOMM_RPN_XOFF_CHAR,
        }
    }
}

impl PortSettings {
    /// Packed line settings octet
    pub fn line_settings(&self) -> u8 {
        (self.data_bits & 0x03)
            | ((self.stop_bits & 0x01) << 2)
            | ((self.parity & 0x01) << 3)
            | ((self.parity_type & 0x03) << 4)
    }

    pub(crate) fn set_line_settings(&mut self, line: u8) {
        self.data_bits = line & 0x03;
        self.stop_bits = (line >> 2) & 0x01;
        self.parity = (line >> 3) & 0x01;
        self.parity_type = (line >> 4) & 0x03;
    }

    /// Copy the fields selected by `mask` from `proposed`.
    ///
    /// Returns the mask of fields actually taken over; a field with an out of
    /// range value keeps its current setting and is dropped from the mask.
    pub fn apply(&mut self, proposed: &PortSettings, mask: ParamMask) -> ParamMask {
        let mut accepted = mask & ParamMask::all();

        if mask.contains(ParamMask::BITRATE) {
            if proposed.bit_rate <= RFCOMM_RPN_BR_230400 {
                self.bit_rate = proposed.bit_rate;
            } else {
                accepted.remove(ParamMask::BITRATE);
            }
        }
        if mask.contains(ParamMask::DATA_BITS) {
            self.data_bits = proposed.data_bits & 0x03;
        }
        if mask.contains(ParamMask::STOP_BITS) {
            self.stop_bits = proposed.stop_bits & 0x01;
        }
        if mask.contains(ParamMask::PARITY) {
            self.parity = proposed.parity & 0x01;
        }
        if mask.contains(ParamMask::PARITY_TYPE) {
            self.parity_type = proposed.parity_type & 0x03;
        }
        if mask.contains(ParamMask::XON_CHAR) {
            self.xon_char = proposed.xon_char;
        }
        if mask.contains(ParamMask::XOFF_CHAR) {
            self.xoff_char = proposed.xoff_char;
        }
        if mask.intersects(ParamMask::FLOW) {
            let flow_bits = ((mask.bits() & ParamMask::FLOW.bits()) >> 8) as u8;
            self.flow_ctrl = (self.flow_ctrl & !flow_bits) | (proposed.flow_ctrl & flow_bits);
        }

        accepted
    }
}

/// Parameter negotiation body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PnParams {
    pub dlci: Dlci,
    /// Convergence layer: 0xF0 requests credit based flow, 0xE0 accepts it
    pub flow_ctrl: u8,
    pub priority: u8,
    pub ack_timer: u8,
    pub mtu: u16,
    pub max_retrans: u8,
    /// Initial credits granted to the receiver of this PN
    pub credits: u8,
}

impl PnParams {
    /// Whether the convergence layer field asks for, or confirms, credit based flow
    pub fn credit_flow(&self) -> bool {
        matches!(
            self.flow_ctrl,
            RFCOMM_PN_CFC_REQUEST | RFCOMM_PN_CFC_ACCEPT
        )
    }
}
