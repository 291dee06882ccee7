//! Multiplexer control channel commands
//!
//! Commands travel inside UIH frames on DLCI 0. Each one is a type octet
//! (`type << 2 | C/R << 1 | EA`), an EA-terminated length and a body.
//! Every command is answered by exactly one response of the same type;
//! there are no sequence numbers, so a response is matched to its request
//! by type and DLCI alone.

pub mod types;
#[cfg(test)]
mod tests;

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::constants::*;
use crate::error::McError;
use crate::types::Dlci;

pub use self::types::*;

/// Decoded body of a control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McBody {
    /// DLC parameter negotiation
    Pn(PnParams),
    /// Remote port negotiation; `None` settings is a query for current values
    Rpn {
        dlci: Dlci,
        settings: Option<(PortSettings, ParamMask)>,
    },
    /// Remote line status
    Rls { dlci: Dlci, status: u8 },
    /// Modem status
    Msc {
        dlci: Dlci,
        signals: ModemSignals,
        break_signal: Option<u8>,
    },
    /// Non supported command response naming the offending type
    Nsc { ty: u8, cr: bool },
    /// Echo test pattern
    Test(Vec<u8>),
    /// Aggregate flow on
    FcOn,
    /// Aggregate flow off
    FcOff,
}

/// A control command or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McMessage {
    /// True for commands, false for responses
    pub command: bool,
    pub body: McBody,
}

/// DLCI fields inside MSC/RLS/RPN use the address octet layout
fn dlci_octet(dlci: Dlci) -> u8 {
    (dlci.raw() << 2) | RFCOMM_CR_BIT | RFCOMM_EA_BIT
}

fn dlci_from_octet(octet: u8) -> Dlci {
    Dlci::new(octet >> 2).unwrap_or(Dlci::CONTROL)
}

fn type_octet(ty: u8, command: bool) -> u8 {
    let cr = if command { RFCOMM_CR_BIT } else { 0 };
    (ty << 2) | cr | RFCOMM_EA_BIT
}

fn push_length(out: &mut Vec<u8>, mut len: usize) {
    loop {
        let chunk = (len & 0x7F) as u8;
        len >>= 7;
        if len == 0 {
            out.push((chunk << 1) | RFCOMM_EA_BIT);
            break;
        }
        out.push(chunk << 1);
    }
}

impl McMessage {
    pub fn command(body: McBody) -> Self {
        Self { command: true, body }
    }

    pub fn response(body: McBody) -> Self {
        Self {
            command: false,
            body,
        }
    }

    /// Command type code (before shifting into the type octet)
    pub fn type_code(&self) -> u8 {
        match &self.body {
            McBody::Pn(_) => RFCOMM_PN,
            McBody::Rpn { .. } => RFCOMM_RPN,
            McBody::Rls { .. } => RFCOMM_RLS,
            McBody::Msc { .. } => RFCOMM_MSC,
            McBody::Nsc { .. } => RFCOMM_NSC,
            McBody::Test(_) => RFCOMM_TEST,
            McBody::FcOn => RFCOMM_FCON,
            McBody::FcOff => RFCOMM_FCOFF,
        }
    }

    /// DLCI the command applies to, if it is channel specific
    pub fn dlci(&self) -> Option<Dlci> {
        match &self.body {
            McBody::Pn(pn) => Some(pn.dlci),
            McBody::Rpn { dlci, .. } | McBody::Rls { dlci, .. } | McBody::Msc { dlci, .. } => {
                Some(*dlci)
            }
            _ => None,
        }
    }

    /// Serialize to a UIH information field
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match &self.body {
            McBody::Pn(pn) => {
                body.push(pn.dlci.raw() & 0x3F);
                body.push(pn.flow_ctrl);
                body.push(pn.priority & 0x3F);
                body.push(pn.ack_timer);
                let _ = body.write_u16::<LittleEndian>(pn.mtu);
                body.push(pn.max_retrans);
                body.push(pn.credits);
            }
            McBody::Rpn { dlci, settings } => {
                body.push(dlci_octet(*dlci));
                if let Some((port, mask)) = settings {
                    body.push(port.bit_rate);
                    body.push(port.line_settings());
                    body.push(port.flow_ctrl);
                    body.push(port.xon_char);
                    body.push(port.xoff_char);
                    let _ = body.write_u16::<LittleEndian>(mask.bits());
                }
            }
            McBody::Rls { dlci, status } => {
                body.push(dlci_octet(*dlci));
                body.push(*status);
            }
            McBody::Msc {
                dlci,
                signals,
                break_signal,
            } => {
                body.push(dlci_octet(*dlci));
                body.push(signals.bits() | RFCOMM_EA_BIT);
                if let Some(brk) = break_signal {
                    body.push(*brk);
                }
            }
            McBody::Nsc { ty, cr } => body.push(type_octet(*ty, *cr)),
            McBody::Test(pattern) => body.extend_from_slice(pattern),
            McBody::FcOn | McBody::FcOff => {}
        }

        let mut out = Vec::with_capacity(body.len() + 3);
        out.push(type_octet(self.type_code(), self.command));
        push_length(&mut out, body.len());
        out.extend_from_slice(&body);
        out
    }

    /// Parse a UIH information field received on DLCI 0
    pub fn decode(data: &[u8]) -> Result<Self, McError> {
        let (&type_byte, rest) = data.split_first().ok_or(McError::Truncated)?;
        let command = type_byte & RFCOMM_CR_BIT != 0;
        let ty = type_byte >> 2;

        let mut len = 0usize;
        let mut shift = 0;
        let mut consumed = 0;
        loop {
            let octet = *rest.get(consumed).ok_or(McError::Truncated)?;
            consumed += 1;
            len |= ((octet >> 1) as usize) << shift;
            if octet & RFCOMM_EA_BIT != 0 {
                break;
            }
            shift += 7;
            if shift > 14 {
                return Err(McError::Malformed("length"));
            }
        }
        let body = rest
            .get(consumed..consumed + len)
            .ok_or(McError::Truncated)?;

        let parsed = match ty {
            RFCOMM_PN => {
                if body.len() < RFCOMM_PN_SIZE {
                    return Err(McError::Malformed("PN"));
                }
                let mut cursor = Cursor::new(&body[4..6]);
                let mtu = cursor
                    .read_u16::<LittleEndian>()
                    .map_err(|_| McError::Malformed("PN"))?;
                McBody::Pn(PnParams {
                    dlci: Dlci::new(body[0] & 0x3F).ok_or(McError::Malformed("PN"))?,
                    flow_ctrl: body[1],
                    priority: body[2] & 0x3F,
                    ack_timer: body[3],
                    mtu,
                    max_retrans: body[6],
                    credits: body[7],
                })
            }
            RFCOMM_RPN => {
                let dlci = dlci_from_octet(*body.first().ok_or(McError::Malformed("RPN"))?);
                let settings = match body.len() {
                    1 => None,
                    n if n >= RFCOMM_RPN_SIZE => {
                        let mut port = PortSettings {
                            bit_rate: body[1],
                            flow_ctrl: body[3],
                            xon_char: body[4],
                            xoff_char: body[5],
                            ..PortSettings::default()
                        };
                        port.set_line_settings(body[2]);
                        let mut cursor = Cursor::new(&body[6..8]);
                        let mask = cursor
                            .read_u16::<LittleEndian>()
                            .map_err(|_| McError::Malformed("RPN"))?;
                        Some((port, ParamMask::from_bits_truncate(mask)))
                    }
                    _ => return Err(McError::Malformed("RPN")),
                };
                McBody::Rpn { dlci, settings }
            }
            RFCOMM_RLS => {
                if body.len() < 2 {
                    return Err(McError::Malformed("RLS"));
                }
                McBody::Rls {
                    dlci: dlci_from_octet(body[0]),
                    status: body[1],
                }
            }
            RFCOMM_MSC => {
                if body.len() < 2 {
                    return Err(McError::Malformed("MSC"));
                }
                McBody::Msc {
                    dlci: dlci_from_octet(body[0]),
                    signals: ModemSignals::from_bits_truncate(body[1]),
                    break_signal: body.get(2).copied(),
                }
            }
            RFCOMM_NSC => {
                let octet = *body.first().ok_or(McError::Malformed("NSC"))?;
                McBody::Nsc {
                    ty: octet >> 2,
                    cr: octet & RFCOMM_CR_BIT != 0,
                }
            }
            RFCOMM_TEST => McBody::Test(body.to_vec()),
            RFCOMM_FCON => McBody::FcOn,
            RFCOMM_FCOFF => McBody::FcOff,
            _ => return Err(McError::Unsupported { ty, cr: command }),
        };

        Ok(Self {
            command,
            body: parsed,
        })
    }
}
