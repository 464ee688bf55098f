use crate::{
    MAGIC, VERSION,
    error::EnvelopeError,
    types::{Envelope, ErrorCode, MessageKind, WireError},
};
use bytes::{Buf, Bytes};
use chrono::{DateTime, Utc};

pub struct EnvelopeDeserializer {
    buffer: Bytes,
}

impl EnvelopeDeserializer {
    pub fn new(buffer: Bytes) -> Self {
        Self { buffer }
    }

    fn ensure(&self, needed: usize, field: &'static str) -> Result<(), EnvelopeError> {
        if self.buffer.remaining() < needed {
            return Err(EnvelopeError::Truncated(field));
        }
        Ok(())
    }

    pub fn read_u8(&mut self, field: &'static str) -> Result<u8, EnvelopeError> {
        self.ensure(1, field)?;
        Ok(self.buffer.get_u8())
    }

    pub fn read_u16(&mut self, field: &'static str) -> Result<u16, EnvelopeError> {
        self.ensure(2, field)?;
        Ok(self.buffer.get_u16())
    }

    pub fn read_u32(&mut self, field: &'static str) -> Result<u32, EnvelopeError> {
        self.ensure(4, field)?;
        Ok(self.buffer.get_u32())
    }

    pub fn read_i64(&mut self, field: &'static str) -> Result<i64, EnvelopeError> {
        self.ensure(8, field)?;
        Ok(self.buffer.get_i64())
    }

    pub fn read_bytes(&mut self, len: usize, field: &'static str) -> Result<Bytes, EnvelopeError> {
        self.ensure(len, field)?;
        Ok(self.buffer.split_to(len))
    }

    pub fn read_str(&mut self, field: &'static str) -> Result<String, EnvelopeError> {
        let len = self.read_u16(field)? as usize;
        let raw = self.read_bytes(len, field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| EnvelopeError::InvalidUtf8(field))
    }

    pub fn read_opt_str(&mut self, field: &'static str) -> Result<Option<String>, EnvelopeError> {
        match self.read_u8(field)? {
            0 => Ok(None),
            _ => self.read_str(field).map(Some),
        }
    }

    /// Read a complete envelope body. The whole buffer must be consumed.
    pub fn read_envelope(mut self) -> Result<Envelope, EnvelopeError> {
        let magic = self.read_u16("magic")?;
        if magic != MAGIC {
            return Err(EnvelopeError::InvalidMagic(magic));
        }
        let version = self.read_u8("version")?;
        if version != VERSION {
            return Err(EnvelopeError::UnsupportedVersion(version));
        }
        let kind_raw = self.read_u8("kind")?;
        let kind = MessageKind::from_u8(kind_raw).ok_or(EnvelopeError::UnknownKind(kind_raw))?;
        let timestamp_ms = self.read_i64("timestamp")?;
        let timestamp = DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let correlation_id = self.read_str("correlation_id")?;
        let job_id = self.read_opt_str("job_id")?;
        let stage = self.read_opt_str("stage")?;

        let error = match self.read_u8("error")? {
            0 => None,
            _ => {
                let code_raw = self.read_u8("error_code")?;
                let code = ErrorCode::from_u8(code_raw)
                    .ok_or(EnvelopeError::UnknownErrorCode(code_raw))?;
                let message = self.read_str("error_message")?;
                Some(WireError { code, message })
            }
        };

        let payload_len = self.read_u32("payload_len")? as usize;
        let payload = self.read_bytes(payload_len, "payload")?;

        if self.buffer.has_remaining() {
            return Err(EnvelopeError::TrailingBytes(self.buffer.remaining()));
        }

        Ok(Envelope {
            kind,
            correlation_id,
            job_id,
            stage,
            payload,
            timestamp,
            error,
        })
    }
}
