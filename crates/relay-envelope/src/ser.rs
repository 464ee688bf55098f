use crate::{MAGIC, VERSION, error::EnvelopeError, types::Envelope};
use bytes::{BufMut, BytesMut};

/// Longest string field (correlation id, job id, stage, error message).
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

pub struct EnvelopeSerializer {
    buffer: BytesMut,
}

impl EnvelopeSerializer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    pub fn into_inner(self) -> BytesMut {
        self.buffer
    }

    pub fn write_str(&mut self, field: &'static str, value: &str) -> Result<(), EnvelopeError> {
        if value.len() > MAX_FIELD_LEN {
            return Err(EnvelopeError::FieldTooLong {
                field,
                len: value.len(),
                max: MAX_FIELD_LEN,
            });
        }
        self.buffer.put_u16(value.len() as u16);
        self.buffer.put_slice(value.as_bytes());
        Ok(())
    }

    pub fn write_opt_str(
        &mut self,
        field: &'static str,
        value: Option<&str>,
    ) -> Result<(), EnvelopeError> {
        match value {
            Some(value) => {
                self.buffer.put_u8(1);
                self.write_str(field, value)
            }
            None => {
                self.buffer.put_u8(0);
                Ok(())
            }
        }
    }

    /// Write the envelope body (everything after the length prefix).
    pub fn write_envelope(&mut self, envelope: &Envelope) -> Result<(), EnvelopeError> {
        self.buffer.put_u16(MAGIC);
        self.buffer.put_u8(VERSION);
        self.buffer.put_u8(envelope.kind.as_u8());
        self.buffer.put_i64(envelope.timestamp.timestamp_millis());
        self.write_str("correlation_id", &envelope.correlation_id)?;
        self.write_opt_str("job_id", envelope.job_id.as_deref())?;
        self.write_opt_str("stage", envelope.stage.as_deref())?;

        match &envelope.error {
            Some(error) => {
                self.buffer.put_u8(1);
                self.buffer.put_u8(error.code.as_u8());
                self.write_str("error_message", &error.message)?;
            }
            None => self.buffer.put_u8(0),
        }

        if envelope.payload.len() > u32::MAX as usize {
            return Err(EnvelopeError::FieldTooLong {
                field: "payload",
                len: envelope.payload.len(),
                max: u32::MAX as usize,
            });
        }
        self.buffer.put_u32(envelope.payload.len() as u32);
        self.buffer.put_slice(&envelope.payload);
        Ok(())
    }
}

impl Default for EnvelopeSerializer {
    fn default() -> Self {
        Self::new()
    }
}
