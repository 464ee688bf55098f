use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tokio::time::Instant;

use super::job::{JobId, JobKind, JobPayload, Priority};

/// One discrete step of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "VALIDATE")]
    Validate,
    #[serde(rename = "TRANSCRIBE")]
    Transcribe,
    #[serde(rename = "CLONE")]
    CloneVoice,
    #[serde(rename = "TRANSLATE")]
    Translate,
    #[serde(rename = "SYNTHESIZE")]
    Synthesize,
}

impl Stage {
    /// Stages backed by a model pool. VALIDATE runs inline.
    pub const MODEL_STAGES: [Stage; 4] = [
        Stage::Transcribe,
        Stage::CloneVoice,
        Stage::Translate,
        Stage::Synthesize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validate => "VALIDATE",
            Stage::Transcribe => "TRANSCRIBE",
            Stage::CloneVoice => "CLONE",
            Stage::Translate => "TRANSLATE",
            Stage::Synthesize => "SYNTHESIZE",
        }
    }

    pub fn uses_model(&self) -> bool {
        !matches!(self, Stage::Validate)
    }

    /// Transition table. `None` means the job is done.
    fn successor(
        self,
        kind: JobKind,
        has_voice_profile: bool,
        has_targets: bool,
    ) -> Option<Stage> {
        match (kind, self) {
            (JobKind::Translation, Stage::Validate) => Some(Stage::Translate),
            (JobKind::Translation, _) => None,

            (JobKind::VoicePipeline, Stage::Validate) => Some(Stage::Transcribe),
            (JobKind::VoicePipeline, Stage::Transcribe) if !has_targets => None,
            (JobKind::VoicePipeline, Stage::Transcribe) if has_voice_profile => {
                Some(Stage::CloneVoice)
            }
            (JobKind::VoicePipeline, Stage::Transcribe) => Some(Stage::Translate),
            (JobKind::VoicePipeline, Stage::CloneVoice) => Some(Stage::Translate),
            (JobKind::VoicePipeline, Stage::Translate) => Some(Stage::Synthesize),
            (JobKind::VoicePipeline, Stage::Synthesize) => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "VALIDATE" => Ok(Stage::Validate),
            "TRANSCRIBE" => Ok(Stage::Transcribe),
            "CLONE" => Ok(Stage::CloneVoice),
            "TRANSLATE" => Ok(Stage::Translate),
            "SYNTHESIZE" => Ok(Stage::Synthesize),
            other => Err(format!("unknown stage '{}'", other)),
        }
    }
}

/// Ordered stages a particular payload goes through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    stages: Vec<Stage>,
}

impl StagePlan {
    pub fn for_payload(payload: &JobPayload) -> Self {
        let kind = payload.kind();
        let has_profile = payload.voice_profile().is_some();
        let has_targets = !payload.target_languages().is_empty();

        let mut stages = vec![Stage::Validate];
        let mut current = Stage::Validate;
        while let Some(next) = current.successor(kind, has_profile, has_targets) {
            stages.push(next);
            current = next;
        }
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    pub fn next_after(&self, stage: Stage) -> Option<Stage> {
        let idx = self.stages.iter().position(|s| *s == stage)?;
        self.stages.get(idx + 1).copied()
    }

    pub fn model_stages(&self) -> impl Iterator<Item = Stage> + '_ {
        self.stages.iter().copied().filter(Stage::uses_model)
    }
}

/// Named class of backing model sharing a pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tier(String);

impl Tier {
    pub const DEFAULT: &'static str = "default";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Tier {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one pool: a (stage, tier) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolKey {
    pub stage: Stage,
    pub tier: Tier,
}

impl PoolKey {
    pub fn new(stage: Stage, tier: Tier) -> Self {
        Self { stage, tier }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stage, self.tier)
    }
}

/// Input handed to the model for one item of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageInput {
    Transcribe {
        audio_ref: String,
        source_language: Option<String>,
    },
    CloneVoice {
        audio_ref: String,
        voice_profile: String,
    },
    Translate {
        text: String,
        source_language: Option<String>,
        target_languages: Vec<String>,
    },
    Synthesize {
        /// Language code to translated text.
        texts: BTreeMap<String, String>,
        voice: Option<String>,
    },
}

impl StageInput {
    pub fn stage(&self) -> Stage {
        match self {
            StageInput::Transcribe { .. } => Stage::Transcribe,
            StageInput::CloneVoice { .. } => Stage::CloneVoice,
            StageInput::Translate { .. } => Stage::Translate,
            StageInput::Synthesize { .. } => Stage::Synthesize,
        }
    }
}

/// Model output for one item of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageOutput {
    Transcript {
        text: String,
        detected_language: Option<String>,
    },
    VoiceEmbedding {
        embedding_ref: String,
    },
    Translations {
        texts: BTreeMap<String, String>,
    },
    Audio {
        /// Language code to synthesized audio location.
        clips: BTreeMap<String, String>,
    },
}

/// Intermediate results accumulated across stages. Large artifacts are
/// referenced by location only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageArtifacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_embedding: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub translations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub audio: BTreeMap<String, String>,
}

impl StageArtifacts {
    pub fn apply(&mut self, output: StageOutput) {
        match output {
            StageOutput::Transcript {
                text,
                detected_language,
            } => {
                self.transcript = Some(text);
                self.detected_language = detected_language;
            }
            StageOutput::VoiceEmbedding { embedding_ref } => {
                self.voice_embedding = Some(embedding_ref);
            }
            StageOutput::Translations { texts } => self.translations.extend(texts),
            StageOutput::Audio { clips } => self.audio.extend(clips),
        }
    }

    /// Build the model input for `stage` from the payload and earlier outputs.
    pub fn input_for(&self, stage: Stage, payload: &JobPayload) -> Result<StageInput, String> {
        match (stage, payload) {
            (Stage::Validate, _) => Err("VALIDATE does not run on a model".to_string()),

            (
                Stage::Transcribe,
                JobPayload::VoicePipeline {
                    audio_ref,
                    source_language,
                    ..
                },
            ) => Ok(StageInput::Transcribe {
                audio_ref: audio_ref.clone(),
                source_language: source_language.clone(),
            }),

            (
                Stage::CloneVoice,
                JobPayload::VoicePipeline {
                    audio_ref,
                    voice_profile: Some(profile),
                    ..
                },
            ) => Ok(StageInput::CloneVoice {
                audio_ref: audio_ref.clone(),
                voice_profile: profile.clone(),
            }),

            (
                Stage::Translate,
                JobPayload::Translation {
                    text,
                    source_language,
                    target_languages,
                },
            ) => Ok(StageInput::Translate {
                text: text.clone(),
                source_language: source_language.clone(),
                target_languages: target_languages.clone(),
            }),

            (
                Stage::Translate,
                JobPayload::VoicePipeline {
                    source_language,
                    target_languages,
                    ..
                },
            ) => {
                let text = self
                    .transcript
                    .clone()
                    .ok_or_else(|| "no transcript to translate".to_string())?;
                Ok(StageInput::Translate {
                    text,
                    source_language: source_language
                        .clone()
                        .or_else(|| self.detected_language.clone()),
                    target_languages: target_languages.clone(),
                })
            }

            (Stage::Synthesize, JobPayload::VoicePipeline { .. }) => {
                if self.translations.is_empty() {
                    return Err("no translations to synthesize".to_string());
                }
                Ok(StageInput::Synthesize {
                    texts: self.translations.clone(),
                    voice: self.voice_embedding.clone(),
                })
            }

            (stage, payload) => Err(format!(
                "stage {} does not apply to a {} job",
                stage,
                payload.kind()
            )),
        }
    }
}

/// Unit scheduled by the queue and batch processor.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub job_id: JobId,
    pub stage: Stage,
    pub tier: Tier,
    pub input: StageInput,
    pub priority: Priority,
    /// 1-based attempt of this stage; stale completions are recognized by it.
    pub attempt: u32,
    /// Overwritten by the queue on enqueue.
    pub enqueued_at: Instant,
}

impl StageRequest {
    pub fn new(
        job_id: JobId,
        tier: Tier,
        input: StageInput,
        priority: Priority,
        attempt: u32,
    ) -> Self {
        Self {
            job_id,
            stage: input.stage(),
            tier,
            input,
            priority,
            attempt,
            enqueued_at: Instant::now(),
        }
    }

    pub fn pool_key(&self) -> PoolKey {
        PoolKey::new(self.stage, self.tier.clone())
    }
}
