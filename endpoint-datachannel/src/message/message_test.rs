use super::*;
use bytes::Bytes;

#[test]
fn test_channel_open_marshal_unmarshal() -> Result<()> {
    let msg = Message::DataChannelOpen(DataChannelOpen {
        channel_type: ChannelType::Reliable,
        priority: ChannelPriority::Normal as u16,
        reliability_parameter: 0,
        label: "chat".to_owned(),
        protocol: "proto".to_owned(),
    });

    let raw = msg.marshal()?;
    assert_eq!(raw.len(), 1 + 10 + 4 + 5);
    assert_eq!(raw[0], 0x03);
    assert_eq!(raw[1], 0x00);
    assert_eq!(&raw[1 + 10..1 + 10 + 4], b"chat");

    let mut buf = &raw[..];
    let parsed = Message::unmarshal(&mut buf)?;
    assert_eq!(parsed, msg);
    assert_eq!(buf.remaining(), 0);

    Ok(())
}

#[test]
fn test_channel_open_unordered_partial() -> Result<()> {
    let msg = Message::DataChannelOpen(DataChannelOpen {
        channel_type: ChannelType::PartialReliableRexmitUnordered,
        priority: ChannelPriority::High as u16,
        reliability_parameter: 3,
        label: String::new(),
        protocol: String::new(),
    });

    let raw = msg.marshal()?;
    let mut buf = &raw[..];
    let parsed = Message::unmarshal(&mut buf)?;

    if let Message::DataChannelOpen(open) = parsed {
        assert!(!open.channel_type.is_ordered());
        assert_eq!(open.reliability_parameter, 3);
        assert!(open.label.is_empty());
    } else {
        panic!("expected OPEN");
    }

    Ok(())
}

#[test]
fn test_channel_ack_marshal_unmarshal() -> Result<()> {
    let msg = Message::DataChannelAck(DataChannelAck);
    let raw = msg.marshal()?;
    assert_eq!(&raw[..], &[0x02]);

    let mut buf = &raw[..];
    assert_eq!(Message::unmarshal(&mut buf)?, msg);

    Ok(())
}

#[test]
fn test_unmarshal_invalid_message_type() {
    let mut buf = Bytes::from_static(&[0x01]);
    let result = Message::unmarshal(&mut buf);
    assert_eq!(result, Err(Error::ErrInvalidMessageType(0x01)));
}

#[test]
fn test_unmarshal_truncated_open() {
    // Header says 4 label bytes but only 2 follow.
    let mut buf = Bytes::from_static(&[
        0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, b'a', b'b',
    ]);
    let result = Message::unmarshal(&mut buf);
    assert_eq!(
        result,
        Err(Error::UnexpectedEndOfBuffer {
            expected: 4,
            actual: 2
        })
    );
}

#[test]
fn test_unmarshal_empty_buffer() {
    let mut buf = Bytes::new();
    let result = Message::unmarshal(&mut buf);
    assert_eq!(
        result,
        Err(Error::UnexpectedEndOfBuffer {
            expected: 1,
            actual: 0
        })
    );
}

#[test]
fn test_invalid_channel_type_and_priority() {
    assert_eq!(
        ChannelType::try_from_u8(0x7f),
        Err(Error::ErrInvalidChannelType(0x7f))
    );
    assert_eq!(
        ChannelPriority::try_from_u16(300),
        Err(Error::ErrInvalidChannelPriority(300))
    );
    assert_eq!(ChannelPriority::try_from_u16(1024), Ok(ChannelPriority::ExtraHigh));
}
