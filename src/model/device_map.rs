use std::collections::BTreeMap;

use crate::error::ServiceError;

const GIB: u64 = 1024 * 1024 * 1024;

/// Per-unit ceilings for quantized loads; unit 0 is capped lower than the rest.
pub const FIRST_UNIT_MAX_MEMORY: u64 = 14 * GIB;
pub const OTHER_UNIT_MAX_MEMORY: u64 = 20 * GIB;

/// Prefix the adapter wrapper puts in front of every base-model parameter.
pub const ADAPTER_KEY_PREFIX: &str = "base_model.model.";

pub fn max_memory(unit_count: usize) -> Vec<u64> {
    (0..unit_count)
        .map(|unit| {
            if unit == 0 {
                FIRST_UNIT_MAX_MEMORY
            } else {
                OTHER_UNIT_MAX_MEMORY
            }
        })
        .collect()
}

/// Parameter name -> accelerator unit index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceMap {
    placements: BTreeMap<String, usize>,
}

impl DeviceMap {
    /// Places parameters in order, moving to the next unit once the current
    /// one would exceed its ceiling.
    pub fn plan<'a, I>(parameters: I, budgets: &[u64]) -> Result<Self, ServiceError>
    where
        I: IntoIterator<Item = (&'a str, u64)>,
    {
        if budgets.is_empty() {
            return Err(ServiceError::Load("no accelerator units to place the model on".into()));
        }

        let mut placements = BTreeMap::new();
        let mut unit = 0usize;
        let mut used = 0u64;

        for (name, bytes) in parameters {
            while used + bytes > budgets[unit] {
                unit += 1;
                used = 0;
                if unit == budgets.len() {
                    return Err(ServiceError::Load(format!(
                        "model does not fit in the memory budget of {} unit(s), stopped at `{name}`",
                        budgets.len()
                    )));
                }
            }
            used += bytes;
            placements.insert(name.to_string(), unit);
        }

        Ok(Self { placements })
    }

    pub fn unit_for(&self, name: &str) -> Option<usize> {
        self.placements.get(name).copied()
    }

    pub fn units_used(&self) -> usize {
        self.placements.values().max().map_or(0, |max| max + 1)
    }

    pub fn len(&self) -> usize {
        self.placements.len()
    }

    /// TorchScript runs a module on one device, so a plan that spills past unit 0
    /// cannot be executed.
    pub fn ensure_single_unit(&self) -> Result<(), ServiceError> {
        match self.units_used() {
            0 | 1 => Ok(()),
            units => Err(ServiceError::Load(format!(
                "quantized model needs {units} accelerator units under the per-unit memory \
                 ceilings, but a TorchScript module runs on a single device"
            ))),
        }
    }

    /// The same placements keyed the way adapter tensors name their targets.
    pub fn for_adapter(&self) -> Self {
        let placements = self
            .placements
            .iter()
            .map(|(name, unit)| (format!("{ADAPTER_KEY_PREFIX}{name}"), *unit))
            .collect();
        Self { placements }
    }
}
