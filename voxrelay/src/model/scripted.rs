//! In-process model backend with scriptable behavior.
//!
//! Produces deterministic placeholder outputs. Per-stage scripts inject
//! failures, hangs and panics, and the factory records invocation counts and
//! any overlapping use of one instance.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use super::{ModelError, ModelFactory, ModelInstance};
use crate::domain::{PoolKey, Stage, StageInput, StageOutput};

/// What the next invocation for a stage does.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    Succeed,
    Fail(String),
    RejectInput(String),
    /// Block the calling thread, then succeed.
    Hang(Duration),
    Panic,
}

#[derive(Default)]
struct ScriptState {
    latency: Mutex<HashMap<Stage, Duration>>,
    scripts: Mutex<HashMap<Stage, VecDeque<ScriptedStep>>>,
    invocations: Mutex<HashMap<Stage, usize>>,
    batch_sizes: Mutex<Vec<usize>>,
    instances_created: AtomicUsize,
    overlap_detected: AtomicBool,
    fail_create: AtomicBool,
}

#[derive(Clone, Default)]
pub struct ScriptedModelFactory {
    state: Arc<ScriptState>,
}

impl ScriptedModelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed service time for every call on `stage`.
    pub fn with_latency(self, stage: Stage, latency: Duration) -> Self {
        self.state.latency.lock().insert(stage, latency);
        self
    }

    /// Queue scripted steps for `stage`; once drained, calls succeed.
    pub fn script(&self, stage: Stage, steps: impl IntoIterator<Item = ScriptedStep>) {
        self.state
            .scripts
            .lock()
            .entry(stage)
            .or_default()
            .extend(steps);
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.state.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn invocations(&self, stage: Stage) -> usize {
        self.state
            .invocations
            .lock()
            .get(&stage)
            .copied()
            .unwrap_or(0)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state.batch_sizes.lock().clone()
    }

    pub fn instances_created(&self) -> usize {
        self.state.instances_created.load(Ordering::SeqCst)
    }

    /// True if any instance was ever entered while already busy.
    pub fn overlap_detected(&self) -> bool {
        self.state.overlap_detected.load(Ordering::SeqCst)
    }
}

impl ModelFactory for ScriptedModelFactory {
    fn create(&self, key: &PoolKey) -> Result<Box<dyn ModelInstance>, ModelError> {
        if self.state.fail_create.load(Ordering::SeqCst) {
            return Err(ModelError::Failure(format!("cannot load model for {}", key)));
        }
        let serial = self.state.instances_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedModel {
            serial,
            stage: key.stage,
            state: self.state.clone(),
            busy: Arc::new(AtomicBool::new(false)),
            calls: 0,
        }))
    }
}

struct ScriptedModel {
    serial: usize,
    stage: Stage,
    state: Arc<ScriptState>,
    busy: Arc<AtomicBool>,
    calls: u64,
}

impl ScriptedModel {
    fn next_step(&self) -> ScriptedStep {
        self.state
            .scripts
            .lock()
            .get_mut(&self.stage)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ScriptedStep::Succeed)
    }

    fn produce(&self, input: &StageInput) -> Result<StageOutput, ModelError> {
        let output = match input {
            StageInput::Transcribe {
                audio_ref,
                source_language,
            } => StageOutput::Transcript {
                text: format!("transcript of {}", audio_ref),
                detected_language: Some(source_language.clone().unwrap_or_else(|| "en".into())),
            },
            StageInput::CloneVoice { voice_profile, .. } => StageOutput::VoiceEmbedding {
                embedding_ref: format!("voice://{}/{}", voice_profile, self.serial),
            },
            StageInput::Translate {
                text,
                target_languages,
                ..
            } => StageOutput::Translations {
                texts: target_languages
                    .iter()
                    .map(|lang| (lang.clone(), format!("[{}] {}", lang, text)))
                    .collect(),
            },
            StageInput::Synthesize { texts, voice } => {
                let voice = voice.as_deref().unwrap_or("stock");
                StageOutput::Audio {
                    clips: texts
                        .keys()
                        .map(|lang| {
                            (
                                lang.clone(),
                                format!("audio://{}/{}/{}", voice, lang, self.calls),
                            )
                        })
                        .collect::<BTreeMap<_, _>>(),
                }
            }
        };
        if input.stage() != self.stage {
            return Err(ModelError::InvalidInput(format!(
                "{} model received {} input",
                self.stage,
                input.stage()
            )));
        }
        Ok(output)
    }
}

impl ModelInstance for ScriptedModel {
    fn invoke(&mut self, inputs: &[StageInput]) -> Result<Vec<StageOutput>, ModelError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.state.overlap_detected.store(true, Ordering::SeqCst);
        }
        self.calls += 1;
        *self.state.invocations.lock().entry(self.stage).or_default() += 1;
        self.state.batch_sizes.lock().push(inputs.len());

        let latency = self.state.latency.lock().get(&self.stage).copied();
        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }

        let result = match self.next_step() {
            ScriptedStep::Succeed => inputs.iter().map(|input| self.produce(input)).collect(),
            ScriptedStep::Fail(msg) => Err(ModelError::Failure(msg)),
            ScriptedStep::RejectInput(msg) => Err(ModelError::InvalidInput(msg)),
            ScriptedStep::Hang(duration) => {
                std::thread::sleep(duration);
                inputs.iter().map(|input| self.produce(input)).collect()
            }
            ScriptedStep::Panic => {
                self.busy.store(false, Ordering::SeqCst);
                panic!("scripted model panic on {}", self.stage);
            }
        };

        self.busy.store(false, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Tier;

    fn translate(text: &str) -> StageInput {
        StageInput::Translate {
            text: text.into(),
            source_language: None,
            target_languages: vec!["fr".into(), "de".into()],
        }
    }

    #[test]
    fn test_outputs_match_inputs() {
        let factory = ScriptedModelFactory::new();
        let mut model = factory
            .create(&PoolKey::new(Stage::Translate, Tier::default()))
            .unwrap();

        let outputs = model.invoke(&[translate("a"), translate("b")]).unwrap();
        assert_eq!(outputs.len(), 2);
        match &outputs[1] {
            StageOutput::Translations { texts } => {
                assert_eq!(texts.get("fr").map(String::as_str), Some("[fr] b"));
                assert_eq!(texts.len(), 2);
            }
            other => panic!("unexpected output {:?}", other),
        }
        assert_eq!(factory.invocations(Stage::Translate), 1);
        assert_eq!(factory.batch_sizes(), vec![2]);
    }

    #[test]
    fn test_scripted_failures_then_success() {
        let factory = ScriptedModelFactory::new();
        factory.script(
            Stage::Translate,
            [
                ScriptedStep::Fail("cuda oom".into()),
                ScriptedStep::RejectInput("bad".into()),
            ],
        );
        let mut model = factory
            .create(&PoolKey::new(Stage::Translate, Tier::default()))
            .unwrap();

        assert_eq!(
            model.invoke(&[translate("x")]).unwrap_err(),
            ModelError::Failure("cuda oom".into())
        );
        assert!(matches!(
            model.invoke(&[translate("x")]),
            Err(ModelError::InvalidInput(_))
        ));
        assert!(model.invoke(&[translate("x")]).is_ok());
        assert!(!factory.overlap_detected());
    }

    #[test]
    fn test_wrong_stage_input_rejected() {
        let factory = ScriptedModelFactory::new();
        let mut model = factory
            .create(&PoolKey::new(Stage::Transcribe, Tier::default()))
            .unwrap();
        assert!(matches!(
            model.invoke(&[translate("x")]),
            Err(ModelError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_create_failure() {
        let factory = ScriptedModelFactory::new();
        factory.set_fail_create(true);
        assert!(
            factory
                .create(&PoolKey::new(Stage::Translate, Tier::default()))
                .is_err()
        );
        assert_eq!(factory.instances_created(), 0);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ModelError::Timeout.code(), relay_envelope::ErrorCode::Timeout);
        assert!(ModelError::Failure("x".into()).code().is_retryable());
        assert!(!ModelError::InvalidInput("x".into()).code().is_retryable());
    }
}
