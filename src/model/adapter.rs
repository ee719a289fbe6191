use std::{collections::BTreeMap, fs, path::Path};

use serde::Deserialize;

use crate::{error::ServiceError, model::device_map::ADAPTER_KEY_PREFIX};

const LORA_A_SUFFIX: &str = ".lora_A.weight";
const LORA_B_SUFFIX: &str = ".lora_B.weight";

/// `adapter_config.json` of a low-rank adapter.
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub target_modules: Vec<String>,
    #[serde(default)]
    pub fan_in_fan_out: bool,
}

impl AdapterConfig {
    pub fn from_file(path: &Path) -> Result<Self, ServiceError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ServiceError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| ServiceError::Adapter(format!("invalid adapter config: {e}")))?;
        if config.r == 0 {
            return Err(ServiceError::Adapter("adapter rank `r` must be positive".into()));
        }
        Ok(config)
    }

    pub fn scaling(&self) -> f64 {
        self.lora_alpha / self.r as f64
    }

    /// Every paired module must be one the adapter declares. An empty
    /// `target_modules` list accepts any module.
    pub fn check_targets(&self, pairs: &[LoraPair]) -> Result<(), ServiceError> {
        if self.target_modules.is_empty() {
            return Ok(());
        }
        for pair in pairs {
            let module = pair.target.strip_suffix(".weight").unwrap_or(&pair.target);
            let declared = self.target_modules.iter().any(|target| {
                module == target || module.ends_with(&format!(".{target}"))
            });
            if !declared {
                return Err(ServiceError::Adapter(format!(
                    "adapter carries weights for `{module}`, which is not in target_modules {:?}",
                    self.target_modules
                )));
            }
        }
        Ok(())
    }
}

/// One low-rank update: `target += (B @ A) * scaling`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoraPair {
    /// Parameter name inside the base model.
    pub target: String,
    /// The same parameter as named from the adapter side.
    pub adapter_key: String,
    pub a_key: String,
    pub b_key: String,
}

/// Matches `lora_A`/`lora_B` tensors by the module they adapt.
pub fn pair_lora_tensors<'a, I>(names: I) -> Result<Vec<LoraPair>, ServiceError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut halves: BTreeMap<&str, (Option<&str>, Option<&str>)> = BTreeMap::new();
    for name in names {
        if let Some(module) = name.strip_suffix(LORA_A_SUFFIX) {
            halves.entry(module).or_default().0 = Some(name);
        } else if let Some(module) = name.strip_suffix(LORA_B_SUFFIX) {
            halves.entry(module).or_default().1 = Some(name);
        }
    }

    halves
        .into_iter()
        .map(|(module, halves)| match halves {
            (Some(a), Some(b)) => {
                let adapter_key = format!("{module}.weight");
                let target = adapter_key
                    .strip_prefix(ADAPTER_KEY_PREFIX)
                    .unwrap_or(&adapter_key)
                    .to_string();
                Ok(LoraPair {
                    target,
                    adapter_key,
                    a_key: a.to_string(),
                    b_key: b.to_string(),
                })
            }
            _ => Err(ServiceError::Adapter(format!(
                "adapter module `{module}` is missing one of lora_A/lora_B"
            ))),
        })
        .collect()
}
