use std::{fs, ops::Deref, path::Path};

use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::error::ServiceError;

/// Text <-> token id conversion used by the generation pipeline.
pub trait TextCodec: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<i64>, ServiceError>;

    /// Decodes ids with special tokens kept in the text.
    fn decode(&self, ids: &[i64]) -> Result<String, ServiceError>;
}

impl TextCodec for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<i64>, ServiceError> {
        let encoding = self
            .deref()
            .encode(text, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().iter().map(|&id| id as i64).collect())
    }

    fn decode(&self, ids: &[i64]) -> Result<String, ServiceError> {
        let ids: Vec<u32> = ids
            .iter()
            .map(|&id| {
                u32::try_from(id)
                    .map_err(|_| ServiceError::Tokenizer(format!("token id {id} out of range")))
            })
            .collect::<Result<_, _>>()?;
        self.deref()
            .decode(&ids, false)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub pad: i64,
    pub bos: Option<i64>,
    pub eos: Option<i64>,
    pub decoder_start: i64,
}

/// Subset of a model's `config.json`.
#[derive(Debug, Default, Deserialize)]
struct ModelConfigFile {
    pad_token_id: Option<i64>,
    bos_token_id: Option<i64>,
    eos_token_id: Option<i64>,
    decoder_start_token_id: Option<i64>,
}

impl SpecialTokens {
    pub fn from_config_file(path: &Path) -> Result<Self, ServiceError> {
        let raw = fs::read_to_string(path)?;
        Self::from_config_json(&raw)
    }

    pub fn from_config_json(raw: &str) -> Result<Self, ServiceError> {
        let file: ModelConfigFile = serde_json::from_str(raw)
            .map_err(|e| ServiceError::Load(format!("invalid model config: {e}")))?;
        let pad = file.pad_token_id.unwrap_or(0);
        Ok(Self {
            pad,
            bos: file.bos_token_id,
            eos: file.eos_token_id,
            decoder_start: file.decoder_start_token_id.unwrap_or(pad),
        })
    }

    /// Canonical ids for checkpoints published with a broken special-token config.
    pub fn legacy_patched(self) -> Self {
        Self {
            pad: 0,
            bos: Some(1),
            eos: Some(2),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_ids_from_config() {
        let tokens = SpecialTokens::from_config_json(
            r#"{"architectures": ["T5ForConditionalGeneration"], "pad_token_id": 0, "eos_token_id": 1, "decoder_start_token_id": 0}"#,
        )
        .unwrap();
        assert_eq!(tokens.pad, 0);
        assert_eq!(tokens.eos, Some(1));
        assert_eq!(tokens.bos, None);
        assert_eq!(tokens.decoder_start, 0);
    }

    #[test]
    fn test_legacy_patch_overrides_broken_ids() {
        let broken = SpecialTokens::from_config_json(
            r#"{"pad_token_id": -1, "bos_token_id": 0, "eos_token_id": 1}"#,
        )
        .unwrap();
        let patched = broken.legacy_patched();
        assert_eq!(patched.pad, 0);
        assert_eq!(patched.bos, Some(1));
        assert_eq!(patched.eos, Some(2));
    }

    #[test]
    fn test_invalid_config_is_load_error() {
        let err = SpecialTokens::from_config_json("not json").unwrap_err();
        assert!(matches!(err, ServiceError::Load(_)));
    }
}
