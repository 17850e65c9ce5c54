use crate::{Frame, FrameType, ProtocolError, Result, MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Codec for encoding/decoding frames with length-prefixed framing
///
/// Frame format: [4-byte length (big-endian)] [1-byte frame type] [payload]
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        // Need at least 5 bytes for length prefix + frame type
        if src.len() < 5 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[0..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(length));
        }
        if length == 0 {
            return Err(ProtocolError::Protocol("empty frame".to_string()));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);

        let type_byte = src.get_u8();
        let frame_type =
            FrameType::from_u8(type_byte).ok_or(ProtocolError::InvalidFrameType(type_byte))?;

        let payload = src.split_to(length - 1);

        let frame = match frame_type {
            FrameType::Request => Frame::Request(bincode::deserialize(&payload)?),
            FrameType::Response => Frame::Response(bincode::deserialize(&payload)?),
            FrameType::Deliver => Frame::Deliver(bincode::deserialize(&payload)?),
            FrameType::Cancelled => Frame::Cancelled(bincode::deserialize(&payload)?),
        };

        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        let payload = match &item {
            Frame::Request(req) => bincode::serialize(req)?,
            Frame::Response(resp) => bincode::serialize(resp)?,
            Frame::Deliver(deliver) => bincode::serialize(deliver)?,
            Frame::Cancelled(cancelled) => bincode::serialize(cancelled)?,
        };

        let total_length = 1 + payload.len();
        if total_length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(total_length));
        }

        dst.reserve(4 + total_length);
        dst.put_u32(total_length as u32);
        dst.put_u8(item.frame_type().as_u8());
        dst.put_slice(&payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeliverFrame, Method, MethodOk, RequestFrame, ResponseFrame};
    use bytes::Bytes;
    use rpc_queue_core::{Delivery, MessageProperties};

    fn publish_frame() -> Frame {
        Frame::Request(RequestFrame {
            seq: 7,
            channel: 1,
            method: Method::BasicPublish {
                routing_key: "math".to_string(),
                body: Bytes::from_static(b"\x05"),
                properties: MessageProperties::default()
                    .with_correlation_id("abc")
                    .with_reply_to("amq.gen-1")
                    .persistent(),
            },
        })
    }

    #[test]
    fn test_codec_roundtrip() {
        let mut codec = FrameCodec;
        let mut buffer = BytesMut::new();

        let frame = publish_frame();
        codec.encode(frame.clone(), &mut buffer).unwrap();

        let decoded = codec.decode(&mut buffer).unwrap();
        assert_eq!(decoded, Some(frame));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_frame() {
        let mut codec = FrameCodec;
        let mut buffer = BytesMut::new();

        codec.encode(publish_frame(), &mut buffer).unwrap();

        let full_len = buffer.len();
        let partial = buffer.split_to(full_len / 2);
        let mut partial_buffer = BytesMut::from(&partial[..]);

        let result = codec.decode(&mut partial_buffer).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut codec = FrameCodec;
        let mut buffer = BytesMut::new();

        let response = Frame::Response(ResponseFrame {
            seq: 7,
            result: Ok(MethodOk::Done),
        });
        let deliver = Frame::Deliver(DeliverFrame {
            channel: 1,
            consumer_tag: "ctag-1".to_string(),
            delivery: Delivery {
                delivery_tag: 1,
                routing_key: "math".to_string(),
                body: Bytes::from_static(b"body"),
                properties: MessageProperties::default(),
                redelivered: false,
            },
        });

        codec.encode(response.clone(), &mut buffer).unwrap();
        codec.encode(deliver.clone(), &mut buffer).unwrap();

        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(response));
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(deliver));
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
    }

    #[test]
    fn test_invalid_frame_type() {
        let mut codec = FrameCodec;
        let mut buffer = BytesMut::new();
        buffer.put_u32(1);
        buffer.put_u8(42);

        assert!(matches!(
            codec.decode(&mut buffer),
            Err(ProtocolError::InvalidFrameType(42))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec;
        let mut buffer = BytesMut::new();
        buffer.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buffer.put_u8(1);

        assert!(matches!(
            codec.decode(&mut buffer),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }
}
