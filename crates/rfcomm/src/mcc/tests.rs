//! Tests for control command encoding and decoding

use super::*;

fn pn(dlci: Dlci, mtu: u16) -> PnParams {
    PnParams {
        dlci,
        flow_ctrl: RFCOMM_PN_CFC_REQUEST,
        priority: 7,
        ack_timer: 0,
        mtu,
        max_retrans: 0,
        credits: RFCOMM_DEFAULT_CREDITS,
    }
}

#[test]
fn test_pn_wire_layout() {
    let message = McMessage::command(McBody::Pn(pn(Dlci::from_channel(3, 0), 400)));
    let bytes = message.encode();

    // type octet 0x83 (PN, command), length 8
    assert_eq!(bytes[0], 0x83);
    assert_eq!(bytes[1], (8 << 1) | 1);
    assert_eq!(bytes[2], 6); // dlci
    assert_eq!(bytes[3], 0xF0);
    assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), 400);
    assert_eq!(bytes[9], RFCOMM_DEFAULT_CREDITS);

    let parsed = McMessage::decode(&bytes).unwrap();
    assert_eq!(parsed, message);
    assert_eq!(parsed.dlci(), Some(Dlci::from_channel(3, 0)));

    let response = McMessage::response(McBody::Pn(pn(Dlci::from_channel(3, 0), 300)));
    assert_eq!(response.encode()[0], 0x81);
}

#[test]
fn test_msc_and_rls() {
    let dlci = Dlci::from_channel(2, 1);
    let msc = McMessage::command(McBody::Msc {
        dlci,
        signals: ModemSignals::initial(),
        break_signal: None,
    });
    let bytes = msc.encode();
    assert_eq!(bytes[0], 0xE3);
    assert_eq!(bytes[2], (dlci.raw() << 2) | 0x03);
    // EA bit is always set on the signal octet
    assert_eq!(bytes[3], 0x8D);
    assert_eq!(McMessage::decode(&bytes).unwrap(), msc);

    let with_break = McMessage::response(McBody::Msc {
        dlci,
        signals: ModemSignals::FC,
        break_signal: Some(0x03),
    });
    assert_eq!(McMessage::decode(&with_break.encode()).unwrap(), with_break);

    let rls = McMessage::command(McBody::Rls {
        dlci,
        status: RLS_ERROR | RLS_OVERRUN,
    });
    let parsed = McMessage::decode(&rls.encode()).unwrap();
    assert_eq!(parsed, rls);
    assert_eq!(parsed.type_code(), RFCOMM_RLS);
}

#[test]
fn test_rpn_query_and_full() {
    let dlci = Dlci::from_channel(4, 0);
    let query = McMessage::command(McBody::Rpn {
        dlci,
        settings: None,
    });
    let bytes = query.encode();
    assert_eq!(bytes.len(), 3);
    assert_eq!(McMessage::decode(&bytes).unwrap(), query);

    let port = PortSettings {
        bit_rate: RFCOMM_RPN_BR_115200,
        parity: 1,
        parity_type: 2,
        ..PortSettings::default()
    };
    let full = McMessage::response(McBody::Rpn {
        dlci,
        settings: Some((port, ParamMask::BITRATE | ParamMask::PARITY)),
    });
    let bytes = full.encode();
    assert_eq!(bytes[1], (8 << 1) | 1);
    assert_eq!(McMessage::decode(&bytes).unwrap(), full);

    // Four octet bodies are neither a query nor a full negotiation
    let mut broken = bytes.clone();
    broken[1] = (4 << 1) | 1;
    assert_eq!(McMessage::decode(&broken), Err(McError::Malformed("RPN")));
}

#[test]
fn test_port_settings_apply() {
    let mut current = PortSettings::default();
    let proposed = PortSettings {
        bit_rate: 0x0F,
        data_bits: 0x02,
        xon_char: 0x21,
        flow_ctrl: 0x3F,
        ..PortSettings::default()
    };

    let accepted = current.apply(
        &proposed,
        ParamMask::BITRATE | ParamMask::DATA_BITS | ParamMask::XON_CHAR | ParamMask::XON_INPUT,
    );

    // Out of range bit rate is kept and dropped from the mask
    assert_eq!(current.bit_rate, RFCOMM_RPN_BR_9600);
    assert!(!accepted.contains(ParamMask::BITRATE));
    assert_eq!(current.data_bits, 0x02);
    assert_eq!(current.xon_char, 0x21);
    assert_eq!(current.flow_ctrl, 0x01);
    // Fields outside the mask are untouched
    assert_eq!(current.xoff_char, RFCOMM_RPN_XOFF_CHAR);
    assert_eq!(
        accepted,
        ParamMask::DATA_BITS | ParamMask::XON_CHAR | ParamMask::XON_INPUT
    );
}

#[test]
fn test_test_fc_and_nsc() {
    let test = McMessage::command(McBody::Test(vec![0xDE, 0xAD, 0xBE, 0xEF]));
    assert_eq!(McMessage::decode(&test.encode()).unwrap(), test);

    let long_pattern = McMessage::command(McBody::Test(vec![0x5A; 200]));
    let bytes = long_pattern.encode();
    // Two octet length: EA clear on the first octet
    assert_eq!(bytes[1] & RFCOMM_EA_BIT, 0);
    assert_eq!(McMessage::decode(&bytes).unwrap(), long_pattern);

    for body in [McBody::FcOn, McBody::FcOff] {
        let message = McMessage::command(body);
        assert_eq!(message.encode().len(), 2);
        assert_eq!(McMessage::decode(&message.encode()).unwrap(), message);
    }

    let nsc = McMessage::response(McBody::Nsc { ty: 0x3F, cr: true });
    let bytes = nsc.encode();
    assert_eq!(bytes[0], 0x11);
    assert_eq!(bytes[2], 0xFF);
    assert_eq!(McMessage::decode(&bytes).unwrap(), nsc);
}

#[test]
fn test_unsupported_and_truncated() {
    // Type 0x3F is not a known command
    assert_eq!(
        McMessage::decode(&[0xFF, 0x01]),
        Err(McError::Unsupported { ty: 0x3F, cr: true })
    );
    assert_eq!(McMessage::decode(&[]), Err(McError::Truncated));
    assert_eq!(McMessage::decode(&[0x83]), Err(McError::Truncated));
    // PN announcing 8 octets but carrying 3
    assert_eq!(
        McMessage::decode(&[0x83, 0x11, 1, 2, 3]),
        Err(McError::Truncated)
    );
    // PN with a short body
    assert_eq!(
        McMessage::decode(&[0x83, 0x05, 1, 2]),
        Err(McError::Malformed("PN"))
    );
}
