use std::fmt;
use std::str::FromStr;

use crate::error::RfcommError;

/// Bluetooth device address, stored little endian as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    /// Wildcard address used by listeners bound to every local adapter
    pub const ANY: BdAddr = BdAddr { bytes: [0; 6] };

    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }

    /// Matches `other` exactly, or either side is the wildcard
    pub fn matches(&self, other: &BdAddr) -> bool {
        self.is_any() || other.is_any() || self == other
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

impl FromStr for BdAddr {
    type Err = RfcommError;

    /// Parses the `AA:BB:CC:DD:EE:FF` form, most significant octet first
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.chars().filter(|c| *c != ':').collect();
        let mut be = [0u8; 6];
        hex::decode_to_slice(&cleaned, &mut be)
            .map_err(|e| RfcommError::InvalidParameter(format!("bad address {s:?}: {e}")))?;
        be.reverse();
        Ok(Self { bytes: be })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let addr: BdAddr = "00:11:22:33:44:55".parse().unwrap();
        assert_eq!(addr.bytes, [0x55, 0x44, 0x33, 0x22, 0x11, 0x00]);
        assert_eq!(addr.to_string(), "00:11:22:33:44:55");

        assert!("00:11:22".parse::<BdAddr>().is_err());
        assert!("zz:11:22:33:44:55".parse::<BdAddr>().is_err());
    }

    #[test]
    fn test_wildcard_matching() {
        let a = BdAddr::new([1, 2, 3, 4, 5, 6]);
        let b = BdAddr::new([6, 5, 4, 3, 2, 1]);
        assert!(BdAddr::ANY.matches(&a));
        assert!(a.matches(&BdAddr::ANY));
        assert!(a.matches(&a));
        assert!(!a.matches(&b));
    }
}
