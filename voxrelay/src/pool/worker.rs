use std::fmt;
use tokio::time::Instant;

use crate::domain::{PoolKey, StageInput, StageOutput};
use crate::model::{ModelError, ModelInstance};

/// Exclusive owner of one model instance.
///
/// A worker is either idle in its pool or moved into exactly one running
/// batch; it is never shared.
pub struct Worker {
    id: u64,
    key: PoolKey,
    model: Box<dyn ModelInstance>,
    batches_run: u64,
    created_at: Instant,
}

impl Worker {
    pub(crate) fn new(id: u64, key: PoolKey, model: Box<dyn ModelInstance>) -> Self {
        Self {
            id,
            key,
            model,
            batches_run: 0,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn batches_run(&self) -> u64 {
        self.batches_run
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Blocking model call. Output count must match input count.
    pub fn run(&mut self, inputs: &[StageInput]) -> Result<Vec<StageOutput>, ModelError> {
        self.batches_run += 1;
        let outputs = self.model.invoke(inputs)?;
        if outputs.len() != inputs.len() {
            return Err(ModelError::Failure(format!(
                "model returned {} outputs for {} inputs",
                outputs.len(),
                inputs.len()
            )));
        }
        Ok(outputs)
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("batches_run", &self.batches_run)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Stage, Tier};

    struct ShortModel;

    impl ModelInstance for ShortModel {
        fn invoke(&mut self, _inputs: &[StageInput]) -> Result<Vec<StageOutput>, ModelError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_output_count_mismatch_is_model_failure() {
        let mut worker = Worker::new(
            1,
            PoolKey::new(Stage::Transcribe, Tier::default()),
            Box::new(ShortModel),
        );
        let err = worker
            .run(&[StageInput::Transcribe {
                audio_ref: "a.wav".into(),
                source_language: None,
            }])
            .unwrap_err();
        assert!(matches!(err, ModelError::Failure(_)));
        assert_eq!(worker.batches_run(), 1);
    }
}
