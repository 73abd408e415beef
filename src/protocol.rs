//! Wire frames and codec for the default TCP broker transport
//!
//! Frame layout: `u32 length | u8 kind | i32 correlation | body`, where
//! `length` counts everything after the length field itself. Requests carry a
//! client-assigned correlation id that the broker echoes in its reply;
//! `Deliver` frames are pushed by the broker with a correlation of zero and
//! are matched to a subscription by the client-assigned subscription id.

use crate::error::{DriverError, ErrorCode};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub type CorrelationId = i32;
pub type SubscriptionId = u64;

const KIND_OPEN: u8 = 1;
const KIND_PUBLISH: u8 = 2;
const KIND_SUBSCRIBE: u8 = 3;
const KIND_UNSUBSCRIBE: u8 = 4;
const KIND_PROVISION: u8 = 5;
const KIND_BIND: u8 = 6;

const KIND_OK: u8 = 0x80;
const KIND_ERROR: u8 = 0x81;
const KIND_DELIVER: u8 = 0x90;

/// Client-to-broker request bodies
#[derive(Debug, Clone)]
pub enum Request {
    /// Authenticate and attach to a virtual host
    Open {
        virtual_host: String,
        username: String,
        password: String,
    },
    /// Publish one payload on a topic
    Publish { topic: String, payload: Bytes },
    /// Register a push subscription; the id is assigned by the client so
    /// deliveries can never race the reply
    Subscribe {
        subscription: SubscriptionId,
        topic: String,
    },
    /// Tear down a subscription
    Unsubscribe { subscription: SubscriptionId },
    /// Provision a queue with endpoint settings
    Provision {
        queue: String,
        access: u8,
        permission: u8,
    },
    /// Bind a queue to a topic
    Bind { queue: String, topic: String },
}

/// Broker reply to a request
#[derive(Debug, Clone)]
pub enum Reply {
    Ok,
    Error { code: ErrorCode, message: String },
}

/// Broker-pushed delivery for one subscription
#[derive(Debug, Clone)]
pub struct Deliver {
    pub subscription: SubscriptionId,
    pub receive_ts_nanos: u64,
    pub payload: Bytes,
}

/// Any frame the broker can send to the client
#[derive(Debug, Clone)]
pub enum Frame {
    Reply {
        correlation: CorrelationId,
        reply: Reply,
    },
    Deliver(Deliver),
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut Bytes) -> Result<String, DriverError> {
    if buf.remaining() < 2 {
        return Err(DriverError::protocol("truncated string length"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(DriverError::protocol("truncated string body"));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| DriverError::protocol("invalid UTF-8 string"))
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn get_bytes(buf: &mut Bytes) -> Result<Bytes, DriverError> {
    if buf.remaining() < 4 {
        return Err(DriverError::protocol("truncated bytes length"));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(DriverError::protocol("truncated bytes body"));
    }
    Ok(buf.split_to(len))
}

/// Codec for the client side of the transport: encodes requests, decodes
/// replies and pushed deliveries.
#[derive(Debug, Default)]
pub struct WireCodec;

impl WireCodec {
    pub fn new() -> Self {
        Self
    }
}

impl tokio_util::codec::Encoder<(CorrelationId, Request)> for WireCodec {
    type Error = DriverError;

    fn encode(
        &mut self,
        (correlation, request): (CorrelationId, Request),
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.put_u32(0); // length placeholder

        match request {
            Request::Open {
                virtual_host,
                username,
                password,
            } => {
                dst.put_u8(KIND_OPEN);
                dst.put_i32(correlation);
                put_string(dst, &virtual_host);
                put_string(dst, &username);
                put_string(dst, &password);
            }
            Request::Publish { topic, payload } => {
                dst.put_u8(KIND_PUBLISH);
                dst.put_i32(correlation);
                put_string(dst, &topic);
                put_bytes(dst, &payload);
            }
            Request::Subscribe {
                subscription,
                topic,
            } => {
                dst.put_u8(KIND_SUBSCRIBE);
                dst.put_i32(correlation);
                dst.put_u64(subscription);
                put_string(dst, &topic);
            }
            Request::Unsubscribe { subscription } => {
                dst.put_u8(KIND_UNSUBSCRIBE);
                dst.put_i32(correlation);
                dst.put_u64(subscription);
            }
            Request::Provision {
                queue,
                access,
                permission,
            } => {
                dst.put_u8(KIND_PROVISION);
                dst.put_i32(correlation);
                put_string(dst, &queue);
                dst.put_u8(access);
                dst.put_u8(permission);
            }
            Request::Bind { queue, topic } => {
                dst.put_u8(KIND_BIND);
                dst.put_i32(correlation);
                put_string(dst, &queue);
                put_string(dst, &topic);
            }
        }

        let frame_len = (dst.len() - start - 4) as u32;
        (&mut dst[start..start + 4]).put_u32(frame_len);
        Ok(())
    }
}

impl tokio_util::codec::Decoder for WireCodec {
    type Item = Frame;
    type Error = DriverError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let frame_len = (&src[0..4]).get_u32() as usize;
        if src.len() < 4 + frame_len {
            return Ok(None);
        }

        let mut frame = src.split_to(4 + frame_len).freeze();
        frame.advance(4);

        if frame.remaining() < 5 {
            return Err(DriverError::protocol("frame too short for header"));
        }
        let kind = frame.get_u8();
        let correlation = frame.get_i32();

        let decoded = match kind {
            KIND_OK => Frame::Reply {
                correlation,
                reply: Reply::Ok,
            },
            KIND_ERROR => {
                if frame.remaining() < 2 {
                    return Err(DriverError::protocol("truncated error code"));
                }
                let code = ErrorCode::from(frame.get_i16());
                let message = get_string(&mut frame)?;
                Frame::Reply {
                    correlation,
                    reply: Reply::Error { code, message },
                }
            }
            KIND_DELIVER => {
                if frame.remaining() < 16 {
                    return Err(DriverError::protocol("truncated delivery header"));
                }
                let subscription = frame.get_u64();
                let receive_ts_nanos = frame.get_u64();
                let payload = get_bytes(&mut frame)?;
                Frame::Deliver(Deliver {
                    subscription,
                    receive_ts_nanos,
                    payload,
                })
            }
            other => {
                return Err(DriverError::protocol(format!(
                    "unexpected frame kind from broker: {:#04x}",
                    other
                )));
            }
        };

        Ok(Some(decoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn test_encode_publish_frame() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(
                (
                    7,
                    Request::Publish {
                        topic: "bench/t1".to_string(),
                        payload: Bytes::from_static(&[1, 2, 3]),
                    },
                ),
                &mut buf,
            )
            .unwrap();

        let frame_len = (&buf[0..4]).get_u32() as usize;
        assert_eq!(buf.len(), 4 + frame_len);
        assert_eq!(buf[4], KIND_PUBLISH);
        assert_eq!((&buf[5..9]).get_i32(), 7);
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(100); // claims 100 bytes follow
        buf.put_u8(KIND_OK);

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_error_reply() {
        let mut buf = BytesMut::new();
        let body_start = buf.len();
        buf.put_u32(0);
        buf.put_u8(KIND_ERROR);
        buf.put_i32(3);
        buf.put_i16(1); // queue already exists
        put_string(&mut buf, "Q/x");
        let len = (buf.len() - body_start - 4) as u32;
        (&mut buf[body_start..body_start + 4]).put_u32(len);

        let mut codec = WireCodec::new();
        match codec.decode(&mut buf).unwrap().unwrap() {
            Frame::Reply {
                correlation,
                reply: Reply::Error { code, message },
            } => {
                assert_eq!(correlation, 3);
                assert_eq!(code, ErrorCode::QueueAlreadyExists);
                assert_eq!(message, "Q/x");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_decode_deliver_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        buf.put_u8(KIND_DELIVER);
        buf.put_i32(0);
        buf.put_u64(42); // subscription
        buf.put_u64(1_000_000); // receive timestamp
        put_bytes(&mut buf, &[9, 8, 7]);
        let len = (buf.len() - 4) as u32;
        (&mut buf[0..4]).put_u32(len);

        let mut codec = WireCodec::new();
        match codec.decode(&mut buf).unwrap().unwrap() {
            Frame::Deliver(deliver) => {
                assert_eq!(deliver.subscription, 42);
                assert_eq!(deliver.receive_ts_nanos, 1_000_000);
                assert_eq!(&deliver.payload[..], &[9, 8, 7]);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_frame_kind_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(0x55);
        buf.put_i32(1);

        let mut codec = WireCodec::new();
        assert!(codec.decode(&mut buf).is_err());
    }
}
