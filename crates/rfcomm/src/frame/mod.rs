//! RFCOMM frame handling
//!
//! This module provides the frame structure carried over the transport and
//! its encoding to and from raw bytes:
//!
//! | Address | Control | Length (1-2) | Credits (0-1) | Payload | FCS |
//!
//! The credit octet is only present on UIH frames with the P/F bit set that
//! travel on a DLC using credit based flow control. The length field never
//! counts it.

pub mod fcs;
#[cfg(test)]
mod tests;

use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::constants::*;
use crate::error::FrameError;
use crate::types::Dlci;

use self::fcs::{check_fcs, fcs};

/// Smallest valid frame: address, control, one octet length, FCS
pub const MIN_FRAME_SIZE: usize = 4;

/// The five frame types used by RFCOMM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Set Asynchronous Balanced Mode, opens a DLC
    Sabm,
    /// Unnumbered Acknowledgement
    Ua,
    /// Disconnected Mode, refuses a DLC
    Dm,
    /// Disconnect
    Disc,
    /// Unnumbered Information with Header check, carries data
    Uih,
}

impl FrameType {
    /// Control field value with the P/F bit cleared
    pub fn code(&self) -> u8 {
        match self {
            Self::Sabm => RFCOMM_SABM,
            Self::Ua => RFCOMM_UA,
            Self::Dm => RFCOMM_DM,
            Self::Disc => RFCOMM_DISC,
            Self::Uih => RFCOMM_UIH,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, FrameError> {
        match code & !RFCOMM_PF_BIT {
            RFCOMM_SABM => Ok(Self::Sabm),
            RFCOMM_UA => Ok(Self::Ua),
            RFCOMM_DM => Ok(Self::Dm),
            RFCOMM_DISC => Ok(Self::Disc),
            RFCOMM_UIH => Ok(Self::Uih),
            other => Err(FrameError::UnknownType(other)),
        }
    }

    /// Number of leading octets covered by the FCS.
    /// UIH frames exclude the length field, all other types include its first octet.
    fn fcs_len_for(control: u8) -> usize {
        if control & !RFCOMM_PF_BIT == RFCOMM_UIH {
            2
        } else {
            3
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sabm => write!(f, "SABM"),
            Self::Ua => write!(f, "UA"),
            Self::Dm => write!(f, "DM"),
            Self::Disc => write!(f, "DISC"),
            Self::Uih => write!(f, "UIH"),
        }
    }
}

/// A decoded RFCOMM frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Target DLCI
    pub dlci: Dlci,
    /// Command/response bit of the address field
    pub cr: bool,
    /// Frame type
    pub frame_type: FrameType,
    /// Poll/Final bit
    pub poll_final: bool,
    /// Piggybacked credits (UIH with P/F set only)
    pub credits: Option<u8>,
    /// Information field
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame without credits
    pub fn new(
        dlci: Dlci,
        cr: bool,
        frame_type: FrameType,
        poll_final: bool,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            dlci,
            cr,
            frame_type,
            poll_final,
            credits: None,
            payload,
        }
    }

    /// SABM, UA, DISC or DM; these always carry P/F
    pub fn empty(frame_type: FrameType, dlci: Dlci, cr: bool) -> Self {
        Self::new(dlci, cr, frame_type, true, Vec::new())
    }

    pub fn uih(dlci: Dlci, cr: bool, payload: Vec<u8>) -> Self {
        Self::new(dlci, cr, FrameType::Uih, false, payload)
    }

    /// UIH frame granting `credits` to the peer, optionally carrying data
    pub fn uih_with_credits(dlci: Dlci, cr: bool, credits: u8, payload: Vec<u8>) -> Self {
        Self {
            dlci,
            cr,
            frame_type: FrameType::Uih,
            poll_final: true,
            credits: Some(credits),
            payload,
        }
    }

    /// Address octet: DLCI, C/R and EA bits
    pub fn address(&self) -> u8 {
        (self.dlci.raw() << 2) | ((self.cr as u8) << 1) | RFCOMM_EA_BIT
    }

    /// Control octet: frame type and P/F bit
    pub fn control(&self) -> u8 {
        if self.poll_final || self.credits.is_some() {
            self.frame_type.code() | RFCOMM_PF_BIT
        } else {
            self.frame_type.code()
        }
    }

    /// Serialize the frame to bytes
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let len = self.payload.len();
        if len > RFCOMM_MAX_FRAME_PAYLOAD {
            return Err(FrameError::InvalidLength);
        }
        if self.credits.is_some() && self.frame_type != FrameType::Uih {
            return Err(FrameError::InvalidLength);
        }

        let mut out = Vec::with_capacity(len + 6);
        out.push(self.address());
        out.push(self.control());
        if len <= RFCOMM_SHORT_LEN_MAX {
            out.push(((len as u8) << 1) | RFCOMM_EA_BIT);
        } else {
            // Two octet form: EA bit of the first octet stays clear
            out.write_u16::<LittleEndian>((len as u16) << 1)
                .map_err(|_| FrameError::InvalidLength)?;
        }

        let fcs_len = FrameType::fcs_len_for(out[1]);
        let check = fcs(&out[..fcs_len]);

        if let Some(credits) = self.credits {
            out.push(credits);
        }
        out.extend_from_slice(&self.payload);
        out.push(check);
        Ok(out)
    }

    /// Parse a frame from raw bytes
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < MIN_FRAME_SIZE {
            return Err(FrameError::Truncated {
                needed: MIN_FRAME_SIZE,
                available: data.len(),
            });
        }

        let address = data[0];
        let control = data[1];

        let mut cursor = Cursor::new(&data[2..]);
        let (len, header_len) = if data[2] & RFCOMM_EA_BIT != 0 {
            ((data[2] >> 1) as usize, 3)
        } else {
            let raw = cursor
                .read_u16::<LittleEndian>()
                .map_err(|_| FrameError::Truncated {
                    needed: MIN_FRAME_SIZE + 1,
                    available: data.len(),
                })?;
            ((raw >> 1) as usize, 4)
        };

        let expected = header_len + len + 1;
        if data.len() < expected {
            return Err(FrameError::Truncated {
                needed: expected,
                available: data.len(),
            });
        }

        let is_uih = control & !RFCOMM_PF_BIT == RFCOMM_UIH;
        let has_pf = control & RFCOMM_PF_BIT != 0;
        let has_credits = match data.len() - expected {
            0 => false,
            1 if is_uih && has_pf => true,
            _ => return Err(FrameError::InvalidLength),
        };

        let fcs_octet = data[data.len() - 1];
        if !check_fcs(&data[..FrameType::fcs_len_for(control)], fcs_octet) {
            return Err(FrameError::BadChecksum);
        }

        if address & RFCOMM_EA_BIT == 0 {
            return Err(FrameError::InvalidAddress);
        }
        let frame_type = FrameType::from_code(control)?;
        let dlci = Dlci::new(address >> 2).ok_or(FrameError::InvalidAddress)?;

        let mut offset = header_len;
        let credits = if has_credits {
            offset += 1;
            Some(data[header_len])
        } else {
            None
        };

        Ok(Self {
            dlci,
            cr: address & RFCOMM_CR_BIT != 0,
            frame_type,
            poll_final: has_pf,
            credits,
            payload: data[offset..offset + len].to_vec(),
        })
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} dlci {} cr {} pf {} len {}",
            self.frame_type,
            self.dlci,
            self.cr as u8,
            self.poll_final as u8,
            self.payload.len()
        )?;
        if let Some(credits) = self.credits {
            write!(f, " credits {credits}")?;
        }
        Ok(())
    }
}
