use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
};

use clap::Parser;
use serde::Serialize;

use crate::error::ServiceError;

/// Repositories known to ship a tokenizer/model config with wrong special-token ids.
const LEGACY_TOKEN_CONFIG_PREFIXES: &[&str] = &["decapoda-research/llama-"];

const DEFAULT_LISTEN_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7860);

#[derive(Debug, Clone, Parser)]
#[command(name = "llm-form-service")]
#[command(about = "serve a causal or seq2seq language model behind a web form", long_about = None)]
pub struct Cli {
    /// Load the 8-bit quantized model artifact
    #[arg(long = "load_8bit", alias = "load-8bit", env = "LOAD_8BIT")]
    pub load_8bit: bool,

    /// Base model: local directory or hub repository id
    #[arg(long = "base_model", alias = "base-model", env = "BASE_MODEL", default_value = "")]
    pub base_model: String,

    /// Low-rank adapter: local directory or hub repository id (empty for none)
    #[arg(long = "lora_weights", alias = "lora-weights", env = "LORA_WEIGHTS", default_value = "")]
    pub lora_weights: String,

    /// Architecture family: causal or seq2seq
    #[arg(long = "model_type", alias = "model-type", env = "MODEL_TYPE", default_value = "causal")]
    pub model_type: String,

    /// Wrap inputs in the instruction template
    #[arg(long = "use_instruction", alias = "use-instruction", env = "USE_INSTRUCTION")]
    pub use_instruction: bool,

    #[arg(long = "listen_addr", alias = "listen-addr", env = "SERVER_ADDR")]
    pub listen_addr: Option<SocketAddr>,

    /// Hub download cache directory
    #[arg(long = "cache_dir", alias = "cache-dir", env = "MODEL_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Default RNG seed for sampled decoding
    #[arg(long, env = "GENERATION_SEED")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Causal,
    Seq2Seq,
}

impl FromStr for ModelKind {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "causal" => Ok(ModelKind::Causal),
            "seq2seq" => Ok(ModelKind::Seq2Seq),
            other => Err(ServiceError::Config(format!(
                "unknown model_type `{other}`, expected `causal` or `seq2seq`"
            ))),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Causal => f.write_str("causal"),
            ModelKind::Seq2Seq => f.write_str("seq2seq"),
        }
    }
}

/// Model selection and loading policy, fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub base_model_id: String,
    pub adapter_id: Option<String>,
    pub model_kind: ModelKind,
    pub use_instruction_template: bool,
    pub load_quantized: bool,
    pub needs_legacy_token_patch: bool,
    pub cache_dir: Option<PathBuf>,
    pub default_seed: Option<u64>,
}

impl RuntimeConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self, ServiceError> {
        let base_model_id = cli.base_model.trim().to_string();
        if base_model_id.is_empty() {
            return Err(ServiceError::Config(
                "please specify a --base_model, e.g. --base_model='decapoda-research/llama-7b-hf'"
                    .into(),
            ));
        }

        let model_kind = cli.model_type.parse()?;
        let adapter_id = Some(cli.lora_weights.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let needs_legacy_token_patch = needs_legacy_token_patch(&base_model_id);

        Ok(Self {
            base_model_id,
            adapter_id,
            model_kind,
            use_instruction_template: cli.use_instruction,
            load_quantized: cli.load_8bit,
            needs_legacy_token_patch,
            cache_dir: cli.cache_dir.clone(),
            default_seed: cli.seed,
        })
    }

    /// Last path segment of the base model id.
    pub fn model_name(&self) -> &str {
        last_segment(&self.base_model_id)
    }

    pub fn adapter_name(&self) -> Option<&str> {
        self.adapter_id.as_deref().map(last_segment)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub runtime: RuntimeConfig,
}

impl AppConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self, ServiceError> {
        Ok(Self {
            listen_addr: cli.listen_addr.unwrap_or(DEFAULT_LISTEN_ADDR),
            runtime: RuntimeConfig::from_cli(cli)?,
        })
    }
}

pub fn needs_legacy_token_patch(base_model_id: &str) -> bool {
    LEGACY_TOKEN_CONFIG_PREFIXES
        .iter()
        .any(|prefix| base_model_id.starts_with(prefix))
}

fn last_segment(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}
