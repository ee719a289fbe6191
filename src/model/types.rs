use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 0.93;
pub const DEFAULT_TOP_K: usize = 50;
pub const DEFAULT_NUM_BEAMS: usize = 5;
pub const DEFAULT_MAX_NEW_TOKENS: usize = 128;

pub const MAX_TOP_K: usize = 100;
pub const MAX_NUM_BEAMS: usize = 5;
pub const MAX_NEW_TOKENS_LIMIT: usize = 2000;

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationRequest {
    pub instruction: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_num_beams")]
    pub num_beams: usize,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    /// Extra decoding options passed through to the generation config.
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl GenerationRequest {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            context: None,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            top_k: DEFAULT_TOP_K,
            num_beams: DEFAULT_NUM_BEAMS,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            options: BTreeMap::new(),
        }
    }

    /// Blank context counts as no context.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref().filter(|c| !c.trim().is_empty())
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        if !(self.temperature > 0.0 && self.temperature <= 1.0) {
            return Err(ServiceError::BadRequest(format!(
                "temperature must be in (0, 1], got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(ServiceError::BadRequest(format!(
                "top_p must be in [0, 1], got {}",
                self.top_p
            )));
        }
        if self.top_k > MAX_TOP_K {
            return Err(ServiceError::BadRequest(format!(
                "top_k must be at most {MAX_TOP_K}, got {}",
                self.top_k
            )));
        }
        if !(1..=MAX_NUM_BEAMS).contains(&self.num_beams) {
            return Err(ServiceError::BadRequest(format!(
                "num_beams must be in [1, {MAX_NUM_BEAMS}], got {}",
                self.num_beams
            )));
        }
        if !(1..=MAX_NEW_TOKENS_LIMIT).contains(&self.max_new_tokens) {
            return Err(ServiceError::BadRequest(format!(
                "max_new_tokens must be in [1, {MAX_NEW_TOKENS_LIMIT}], got {}",
                self.max_new_tokens
            )));
        }
        Ok(())
    }
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

fn default_top_p() -> f64 {
    DEFAULT_TOP_P
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_num_beams() -> usize {
    DEFAULT_NUM_BEAMS
}

fn default_max_new_tokens() -> usize {
    DEFAULT_MAX_NEW_TOKENS
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationResponse {
    pub prompt: String,
    pub output: String,
    pub tokens_generated: usize,
    pub total_time_ms: u128,
    pub tokens_per_second: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub name: String,
    pub adapter: Option<String>,
    pub kind: crate::config::ModelKind,
    pub instruct: bool,
    pub quantized: bool,
    pub device: crate::device::DeviceProfile,
}
