#![allow(dead_code)]

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use clap::Parser;
use llm_form_service::{
    Cli, RuntimeConfig,
    config::ModelKind,
    device::DeviceProfile,
    error::ServiceError,
    model::{LanguageModel, LoadedModel, ModelLoader, SpecialTokens, TextCodec},
};

pub const VOCAB: usize = 128;
pub const PAD: i64 = 0;
pub const BOS: i64 = 1;
pub const EOS: i64 = 2;

/// One token per ASCII character; ids 0-2 are the special tokens.
pub struct AsciiCodec;

impl TextCodec for AsciiCodec {
    fn encode(&self, text: &str) -> Result<Vec<i64>, ServiceError> {
        text.chars()
            .map(|c| {
                let id = c as i64;
                if (3..VOCAB as i64).contains(&id) {
                    Ok(id)
                } else {
                    Err(ServiceError::Tokenizer(format!("unsupported character {c:?}")))
                }
            })
            .collect()
    }

    fn decode(&self, ids: &[i64]) -> Result<String, ServiceError> {
        Ok(ids
            .iter()
            .map(|&id| match id {
                PAD => "<pad>".to_string(),
                BOS => "<s>".to_string(),
                EOS => "</s>".to_string(),
                other => char::from_u32(other as u32).unwrap_or('?').to_string(),
            })
            .collect())
    }
}

pub fn special() -> SpecialTokens {
    SpecialTokens {
        pad: PAD,
        bos: Some(BOS),
        eos: Some(EOS),
        decoder_start: PAD,
    }
}

/// Emits `reply` one token at a time after the prompt, then end-of-sequence.
pub struct ScriptedModel {
    pub kind: ModelKind,
    pub prompt_len: usize,
    pub reply: Vec<i64>,
}

impl ScriptedModel {
    pub fn causal(prompt: &str, reply: &str) -> Self {
        Self {
            kind: ModelKind::Causal,
            prompt_len: prompt.chars().count(),
            reply: reply.chars().map(|c| c as i64).collect(),
        }
    }

    pub fn seq2seq(reply: &str) -> Self {
        Self {
            kind: ModelKind::Seq2Seq,
            prompt_len: 1,
            reply: reply.chars().map(|c| c as i64).collect(),
        }
    }
}

impl LanguageModel for ScriptedModel {
    fn kind(&self) -> ModelKind {
        self.kind
    }

    fn next_token_logits(
        &self,
        _context: &[i64],
        sequences: &[Vec<i64>],
    ) -> Result<Vec<Vec<f32>>, ServiceError> {
        Ok(sequences
            .iter()
            .map(|seq| {
                let step = seq.len().saturating_sub(self.prompt_len);
                let target = self.reply.get(step).copied().unwrap_or(EOS);
                let mut row = vec![-10.0f32; VOCAB];
                row[target as usize] = 10.0;
                row
            })
            .collect())
    }
}

pub fn cli(args: &[&str]) -> Cli {
    let mut argv = vec!["llm-form-service"];
    argv.extend_from_slice(args);
    Cli::try_parse_from(argv).unwrap()
}

pub fn runtime_config(args: &[&str]) -> RuntimeConfig {
    RuntimeConfig::from_cli(&cli(args)).unwrap()
}

/// Hands out a prepared model and counts how often it was asked to.
pub struct StubLoader {
    pub model: Arc<dyn LanguageModel>,
    pub calls: AtomicUsize,
}

impl StubLoader {
    pub fn new(model: impl LanguageModel + 'static) -> Self {
        Self {
            model: Arc::new(model),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ModelLoader for StubLoader {
    fn load(
        &self,
        _config: &RuntimeConfig,
        _profile: &DeviceProfile,
    ) -> Result<LoadedModel, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(LoadedModel {
            model: self.model.clone(),
            codec: Arc::new(AsciiCodec),
            special: special(),
        })
    }
}
