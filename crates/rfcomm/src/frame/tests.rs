//! Unit tests for frame encoding, decoding and the FCS

use super::fcs::*;
use super::*;

#[test]
fn test_crc_table_matches_reference() {
    assert_eq!(fcs::CRC_TABLE[0], 0x00);
    assert_eq!(fcs::CRC_TABLE[1], 0x91);
    assert_eq!(fcs::CRC_TABLE[2], 0xE3);
    assert_eq!(fcs::CRC_TABLE[3], 0x72);
}

#[test]
fn test_known_control_channel_frames() {
    // SABM on DLCI 0 from the session initiator
    let sabm = Frame::empty(FrameType::Sabm, Dlci::CONTROL, true).encode().unwrap();
    assert_eq!(sabm, vec![0x03, 0x3F, 0x01, 0x1C]);

    // UA answering it
    let ua = Frame::empty(FrameType::Ua, Dlci::CONTROL, true).encode().unwrap();
    assert_eq!(ua, vec![0x03, 0x73, 0x01, 0xD7]);

    // DISC on DLCI 0
    let disc = Frame::empty(FrameType::Disc, Dlci::CONTROL, true).encode().unwrap();
    assert_eq!(disc, vec![0x03, 0x53, 0x01, 0xFD]);

    let parsed = Frame::decode(&sabm).unwrap();
    assert_eq!(parsed.frame_type, FrameType::Sabm);
    assert!(parsed.dlci.is_control());
    assert!(parsed.cr);
    assert!(parsed.poll_final);
}

#[test]
fn test_fcs_helpers() {
    let header = [0x0B, 0xEF];
    let check = fcs(&header);
    assert!(check_fcs(&header, check));
    assert!(!check_fcs(&header, check ^ 0x01));
}

#[test]
fn test_round_trip_all_types() {
    let dlci = Dlci::from_channel(3, 0);
    let frames = vec![
        Frame::empty(FrameType::Sabm, dlci, true),
        Frame::empty(FrameType::Ua, dlci, false),
        Frame::empty(FrameType::Dm, dlci, false),
        Frame::empty(FrameType::Disc, dlci, true),
        Frame::uih(dlci, true, vec![]),
        Frame::uih(dlci, true, b"hello".to_vec()),
        Frame::uih(dlci, false, vec![0xAA; 127]),
        Frame::uih(dlci, true, vec![0x55; 128]),
        Frame::uih(dlci, true, vec![0x11; 1000]),
        Frame::uih_with_credits(dlci, true, 33, vec![]),
        Frame::uih_with_credits(dlci, true, 5, b"data".to_vec()),
    ];

    for frame in frames {
        let bytes = frame.encode().unwrap();
        let parsed = Frame::decode(&bytes).unwrap();
        assert_eq!(parsed, frame, "round trip failed for {frame}");
    }
}

#[test]
fn test_length_field_forms() {
    let dlci = Dlci::from_channel(1, 0);

    let short = Frame::uih(dlci, true, vec![0; 127]).encode().unwrap();
    assert_eq!(short[2], (127 << 1) | 1);
    assert_eq!(short.len(), 3 + 127 + 1);

    let long = Frame::uih(dlci, true, vec![0; 300]).encode().unwrap();
    assert_eq!(long[2] & RFCOMM_EA_BIT, 0);
    assert_eq!(u16::from_le_bytes([long[2], long[3]]) >> 1, 300);
    assert_eq!(long.len(), 4 + 300 + 1);
}

#[test]
fn test_corrupted_header_reports_bad_checksum() {
    let bytes = Frame::empty(FrameType::Sabm, Dlci::from_channel(5, 1), true)
        .encode()
        .unwrap();

    // Address, control and the FCS octet itself; the length octet is checked
    // against the frame size before the FCS.
    for index in [0usize, 1, 3] {
        for bit in 0..8 {
            let mut corrupted = bytes.clone();
            corrupted[index] ^= 1 << bit;
            assert_eq!(
                Frame::decode(&corrupted),
                Err(FrameError::BadChecksum),
                "byte {index} bit {bit}"
            );
        }
    }

    let data = Frame::uih(Dlci::from_channel(5, 1), true, b"abc".to_vec())
        .encode()
        .unwrap();
    for index in [0usize, 1] {
        let mut corrupted = data.clone();
        corrupted[index] ^= 0x04;
        assert_eq!(Frame::decode(&corrupted), Err(FrameError::BadChecksum));
    }
}

#[test]
fn test_truncated_and_invalid_length() {
    assert!(matches!(
        Frame::decode(&[0x03, 0x3F, 0x01]),
        Err(FrameError::Truncated { .. })
    ));

    let bytes = Frame::uih(Dlci::from_channel(2, 0), true, vec![1, 2, 3, 4])
        .encode()
        .unwrap();
    assert!(matches!(
        Frame::decode(&bytes[..bytes.len() - 2]),
        Err(FrameError::Truncated { .. })
    ));

    // Two surplus octets can never be a credit field
    let mut padded = bytes.clone();
    padded.insert(3, 0);
    padded.insert(3, 0);
    assert_eq!(Frame::decode(&padded), Err(FrameError::InvalidLength));

    // One surplus octet without P/F is not a credit field either
    let mut one_extra = bytes;
    one_extra.insert(3, 0);
    assert_eq!(Frame::decode(&one_extra), Err(FrameError::InvalidLength));

    let oversized = Frame::uih(Dlci::from_channel(2, 0), true, vec![0; 0x8000]);
    assert_eq!(oversized.encode(), Err(FrameError::InvalidLength));
}

#[test]
fn test_unknown_frame_type() {
    let mut bytes = vec![0x0B, 0x93, 0x01];
    bytes.push(fcs(&bytes));
    assert_eq!(Frame::decode(&bytes), Err(FrameError::UnknownType(0x83)));
}
