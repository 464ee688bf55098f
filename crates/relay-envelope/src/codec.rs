use crate::{
    DEFAULT_MAX_FRAME_LEN, de::EnvelopeDeserializer, error::EnvelopeError, ser::EnvelopeSerializer,
    types::Envelope,
};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const LENGTH_PREFIX: usize = 4;

/// Length-prefixed envelope framing for `tokio_util::codec::Framed`.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeCodec {
    max_frame_len: usize,
}

impl EnvelopeCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Serialize `item` and check it against the frame limit without
    /// touching a stream. Returns the frame body length.
    pub fn check(&self, item: &Envelope) -> Result<usize, EnvelopeError> {
        self.serialize(item).map(|body| body.len())
    }

    fn serialize(&self, item: &Envelope) -> Result<BytesMut, EnvelopeError> {
        let mut ser = EnvelopeSerializer::with_capacity(64 + item.payload.len());
        ser.write_envelope(item)?;
        let body = ser.into_inner();

        if body.len() > self.max_frame_len {
            return Err(EnvelopeError::FrameTooLarge {
                len: body.len(),
                max: self.max_frame_len,
            });
        }
        Ok(body)
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = EnvelopeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut len_bytes = [0u8; LENGTH_PREFIX];
        len_bytes.copy_from_slice(&src[..LENGTH_PREFIX]);
        let frame_len = u32::from_be_bytes(len_bytes) as usize;

        if frame_len > self.max_frame_len {
            return Err(EnvelopeError::FrameTooLarge {
                len: frame_len,
                max: self.max_frame_len,
            });
        }

        if src.len() < LENGTH_PREFIX + frame_len {
            src.reserve(LENGTH_PREFIX + frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let body = src.split_to(frame_len).freeze();
        EnvelopeDeserializer::new(body).read_envelope().map(Some)
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = EnvelopeError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = self.serialize(&item)?;
        dst.reserve(LENGTH_PREFIX + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ErrorCode, MessageKind, WireError};
    use bytes::Bytes;
    use chrono::{DateTime, Utc};

    fn fixed_time() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(1_760_000_000_123).unwrap()
    }

    #[test]
    fn test_request_round_trip() {
        let mut request = Envelope::request("corr-1", Bytes::from_static(b"{\"op\":\"health\"}"))
            .with_job_id("job-1")
            .with_stage("TRANSLATE");
        request.timestamp = fixed_time();

        let mut codec = EnvelopeCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(request.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, request);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_error_reply_keeps_code_and_correlation() {
        let request = Envelope::request("corr-9", Bytes::new());
        let mut reply =
            Envelope::error_reply(&request, WireError::new(ErrorCode::Overloaded, "queue full"));
        reply.timestamp = fixed_time();

        let frame = crate::encode_frame(reply).unwrap();
        let mut frame = frame;
        let decoded = crate::decode_frame(&mut frame).unwrap().unwrap();

        assert_eq!(decoded.kind, MessageKind::Reply);
        assert_eq!(decoded.correlation_id, "corr-9");
        let error = decoded.error.unwrap();
        assert_eq!(error.code, ErrorCode::Overloaded);
        assert!(error.is_retryable());
        assert_eq!(error.message, "queue full");
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let event = Envelope::event("job-7", Bytes::from_static(b"done"));
        let full = crate::encode_frame(event).unwrap();

        let mut codec = EnvelopeCodec::default();
        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 3..]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.kind, MessageKind::Event);
        assert_eq!(decoded.job_id.as_deref(), Some("job-7"));
        assert_eq!(decoded.correlation_id, "job-7");
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = crate::encode_frame(Envelope::request("a", Bytes::new())).unwrap();
        buf.extend_from_slice(&crate::encode_frame(Envelope::request("b", Bytes::new())).unwrap());

        let mut codec = EnvelopeCodec::default();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().correlation_id, "a");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().correlation_id, "b");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = EnvelopeCodec::new(16);
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        buf.extend_from_slice(&[0u8; 8]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, EnvelopeError::FrameTooLarge { len: 1024, max: 16 }));
    }

    #[test]
    fn test_check_matches_encode_limit() {
        let codec = EnvelopeCodec::new(256);
        let small = Envelope::request("c-1", Bytes::from_static(b"ok"));
        assert!(codec.check(&small).unwrap() < 256);

        let big = Envelope::request("c-2", Bytes::from(vec![7u8; 1024]));
        assert!(matches!(
            codec.check(&big),
            Err(EnvelopeError::FrameTooLarge { max: 256, .. })
        ));

        let long_message = WireError::new(ErrorCode::Internal, "x".repeat(70_000));
        let reply = Envelope::error_reply(&small, long_message);
        assert!(EnvelopeCodec::new(1 << 20).check(&reply).is_err());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_u16(0xBEEF);
        buf.put_u8(1);
        buf.put_u8(1);

        let err = EnvelopeCodec::default().decode(&mut buf).unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidMagic(0xBEEF)));
    }

    #[test]
    fn test_truncated_body_reports_field() {
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_u16(crate::MAGIC);
        buf.put_u8(crate::VERSION);
        buf.put_u8(MessageKind::Request.as_u8());

        let err = EnvelopeCodec::default().decode(&mut buf).unwrap_err();
        assert!(matches!(err, EnvelopeError::Truncated("timestamp")));
    }

    #[test]
    fn test_error_code_retryability() {
        assert!(ErrorCode::Overloaded.is_retryable());
        assert!(ErrorCode::Timeout.is_retryable());
        assert!(ErrorCode::ModelFailure.is_retryable());
        assert!(!ErrorCode::ValidationError.is_retryable());
        assert!(!ErrorCode::Cancelled.is_retryable());
        assert_eq!(ErrorCode::ValidationError.to_string(), "VALIDATION_ERROR");
    }
}
