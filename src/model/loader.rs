use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use hf_hub::api::sync::ApiBuilder;
use tokenizers::Tokenizer;

use crate::{
    config::RuntimeConfig,
    device::DeviceProfile,
    error::ServiceError,
    model::{LanguageModel, TextCodec, codec::SpecialTokens},
};

pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const MODEL_CONFIG_FILE: &str = "config.json";
pub const MODULE_FILE: &str = "model.ts";
pub const QUANTIZED_MODULE_FILE: &str = "model.int8.ts";
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

/// A ready-to-generate model with its tokenizer.
pub struct LoadedModel {
    pub model: Arc<dyn LanguageModel>,
    pub codec: Arc<dyn TextCodec>,
    pub special: SpecialTokens,
}

pub trait ModelLoader {
    fn load(&self, config: &RuntimeConfig, profile: &DeviceProfile)
    -> Result<LoadedModel, ServiceError>;
}

/// Where a model or adapter's files come from: a local directory, or a hub
/// repository downloaded into the cache.
#[derive(Debug, Clone)]
pub struct ArtifactSource {
    id: String,
    local_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
}

impl ArtifactSource {
    pub fn new(id: &str, cache_dir: Option<&Path>) -> Self {
        let local_dir = Some(PathBuf::from(id)).filter(|p| p.is_dir());
        Self {
            id: id.to_string(),
            local_dir,
            cache_dir: cache_dir.map(Path::to_path_buf),
        }
    }

    pub fn fetch(&self, filename: &str) -> Result<PathBuf, ServiceError> {
        if let Some(dir) = &self.local_dir {
            let path = dir.join(filename);
            if !path.exists() {
                return Err(ServiceError::Load(format!(
                    "artifact missing: {}",
                    path.display()
                )));
            }
            return Ok(path);
        }

        tracing::info!(repo = %self.id, file = filename, "resolving artifact from hub");
        let mut builder = ApiBuilder::new();
        if let Some(cache_dir) = &self.cache_dir {
            builder = builder.with_cache_dir(cache_dir.clone());
        }
        let api = builder
            .build()
            .map_err(|e| ServiceError::Load(format!("failed to create hub client: {e}")))?;
        let path = api.model(self.id.clone()).get(filename).map_err(|e| {
            ServiceError::Load(format!("failed to download {}/{}: {}", self.id, filename, e))
        })?;
        tracing::info!(path = %path.display(), "artifact available");
        Ok(path)
    }
}

pub fn load_tokenizer(source: &ArtifactSource) -> Result<Tokenizer, ServiceError> {
    let path = source.fetch(TOKENIZER_FILE)?;
    Tokenizer::from_file(&path).map_err(|e| ServiceError::Tokenizer(e.to_string()))
}

pub fn load_special_tokens(
    source: &ArtifactSource,
    config: &RuntimeConfig,
) -> Result<SpecialTokens, ServiceError> {
    let tokens = SpecialTokens::from_config_file(&source.fetch(MODEL_CONFIG_FILE)?)?;
    if config.needs_legacy_token_patch {
        tracing::info!(model = %config.base_model_id, "patching pad/bos/eos ids of known-bad config");
        return Ok(tokens.legacy_patched());
    }
    Ok(tokens)
}

/// Loader used when the crate is built without an inference backend.
pub struct NoBackend;

impl ModelLoader for NoBackend {
    fn load(
        &self,
        _config: &RuntimeConfig,
        _profile: &DeviceProfile,
    ) -> Result<LoadedModel, ServiceError> {
        Err(ServiceError::Load(
            "built without an inference backend, enable the `tch-backend` feature".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use clap::Parser;

    use super::*;
    use crate::config::Cli;

    const TINY_TOKENIZER: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"<pad>": 0, "<s>": 1, "</s>": 2, "hello": 3, "world": 4, "[UNK]": 5},
            "unk_token": "[UNK]"
        }
    }"#;

    fn model_dir(name: &str, files: &[(&str, &str)]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("llm_form_service-{name}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        for (file, contents) in files {
            fs::write(dir.join(file), contents).unwrap();
        }
        dir
    }

    fn runtime(base_model: &str) -> RuntimeConfig {
        let cli = Cli::try_parse_from(["llm-form-service", "--base_model", base_model]).unwrap();
        RuntimeConfig::from_cli(&cli).unwrap()
    }

    #[test]
    fn test_missing_local_artifact_is_load_error() {
        let dir = model_dir("missing", &[]);
        let source = ArtifactSource::new(dir.to_str().unwrap(), None);
        let err = source.fetch("definitely-not-here.ts").unwrap_err();
        assert!(matches!(err, ServiceError::Load(_)));
    }

    #[test]
    fn test_tokenizer_from_local_dir_encodes_and_decodes() {
        let dir = model_dir("tokenizer", &[(TOKENIZER_FILE, TINY_TOKENIZER)]);
        let source = ArtifactSource::new(dir.to_str().unwrap(), None);
        let tokenizer = load_tokenizer(&source).unwrap();
        let codec: &dyn TextCodec = &tokenizer;

        assert_eq!(codec.encode("hello world").unwrap(), vec![3, 4]);
        assert_eq!(codec.encode("hello rust").unwrap(), vec![3, 5]);
        assert_eq!(codec.decode(&[0, 3, 4, 2]).unwrap(), "<pad> hello world </s>");
        assert!(matches!(codec.decode(&[-1]), Err(ServiceError::Tokenizer(_))));
    }

    #[test]
    fn test_special_tokens_read_from_local_config() {
        let dir = model_dir(
            "config",
            &[(MODEL_CONFIG_FILE, r#"{"pad_token_id": 1, "bos_token_id": 1, "eos_token_id": 1}"#)],
        );
        let source = ArtifactSource::new(dir.to_str().unwrap(), None);
        let tokens = load_special_tokens(&source, &runtime("acme/tiny")).unwrap();
        assert_eq!((tokens.pad, tokens.bos, tokens.eos), (1, Some(1), Some(1)));
    }

    #[test]
    fn test_legacy_checkpoint_gets_patched_ids() {
        let dir = model_dir(
            "legacy",
            &[(MODEL_CONFIG_FILE, r#"{"pad_token_id": -1, "bos_token_id": 0, "eos_token_id": 1}"#)],
        );
        let source = ArtifactSource::new(dir.to_str().unwrap(), None);
        let mut config = runtime("decapoda-research/llama-7b-hf");
        assert!(config.needs_legacy_token_patch);

        let tokens = load_special_tokens(&source, &config).unwrap();
        assert_eq!((tokens.pad, tokens.bos, tokens.eos), (0, Some(1), Some(2)));

        config.needs_legacy_token_patch = false;
        let tokens = load_special_tokens(&source, &config).unwrap();
        assert_eq!(tokens.pad, -1);
    }
}
