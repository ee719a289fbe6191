//! libtorch backend: TorchScript models, device probing, adapter merging.

use std::{collections::HashMap, panic, sync::Arc};

use parking_lot::Mutex;
use tch::{CModule, Device, IValue, Kind, Tensor, no_grad};

use crate::{
    config::{ModelKind, RuntimeConfig},
    device::{AcceleratorProbe, ComputeDevice, DeviceProfile, ProbeError},
    error::ServiceError,
    model::{
        LanguageModel,
        adapter::{AdapterConfig, pair_lora_tensors},
        codec::SpecialTokens,
        device_map::{DeviceMap, max_memory},
        loader::{
            ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE, ArtifactSource, LoadedModel, MODULE_FILE,
            ModelLoader, QUANTIZED_MODULE_FILE, load_special_tokens, load_tokenizer,
        },
    },
};

pub struct TchProbe;

impl AcceleratorProbe for TchProbe {
    fn primary_available(&self) -> bool {
        tch::Cuda::is_available()
    }

    fn alternate_available(&self) -> Result<bool, ProbeError> {
        panic::catch_unwind(tch::utils::has_mps)
            .map_err(|_| ProbeError("mps availability check panicked".into()))
    }
}

fn tch_device(device: ComputeDevice, unit: usize) -> Device {
    match device {
        ComputeDevice::Cuda => Device::Cuda(unit),
        ComputeDevice::Mps => Device::Mps,
        ComputeDevice::Cpu => Device::Cpu,
    }
}

fn load_err(err: tch::TchError) -> ServiceError {
    ServiceError::Load(err.to_string())
}

fn adapter_err(err: tch::TchError) -> ServiceError {
    ServiceError::Adapter(err.to_string())
}

pub struct TchLoader;

impl ModelLoader for TchLoader {
    fn load(
        &self,
        config: &RuntimeConfig,
        profile: &DeviceProfile,
    ) -> Result<LoadedModel, ServiceError> {
        let source = ArtifactSource::new(&config.base_model_id, config.cache_dir.as_deref());
        let tokenizer = load_tokenizer(&source)?;
        let special = load_special_tokens(&source, config)?;

        let device = tch_device(profile.device, 0);
        let module_file = if profile.is_quantized() {
            QUANTIZED_MODULE_FILE
        } else {
            MODULE_FILE
        };
        let module_path = source.fetch(module_file)?;
        let mut module = CModule::load_on_device(&module_path, device).map_err(load_err)?;
        tracing::info!(path = %module_path.display(), ?device, "loaded TorchScript module");

        let device_map = if profile.is_quantized() {
            Some(shard_parameters(&module)?)
        } else {
            None
        };

        if let Some(adapter_id) = &config.adapter_id {
            let adapter = ArtifactSource::new(adapter_id, config.cache_dir.as_deref());
            let merged = merge_adapter(&module, &adapter, device, device_map.as_ref())?;
            tracing::info!(adapter = %adapter_id, modules = merged, "merged low-rank adapter");
        }

        if !config.load_quantized {
            module.to(device, Kind::Half, false);
        }
        module.set_eval();

        let model = TchModel {
            module: Mutex::new(module),
            device,
            kind: config.model_kind,
        };
        if !cfg!(target_os = "windows") {
            model.warm_up(&special)?;
        }

        Ok(LoadedModel {
            model: Arc::new(model),
            codec: Arc::new(tokenizer),
            special,
        })
    }
}

/// Plans quantized parameters over the CUDA units under the per-unit memory
/// ceilings. The module is already on unit 0, so only a one-unit plan is kept.
fn shard_parameters(module: &CModule) -> Result<DeviceMap, ServiceError> {
    let unit_count = usize::try_from(tch::Cuda::device_count()).unwrap_or(0).max(1);
    let parameters = module.named_parameters().map_err(load_err)?;
    let map = DeviceMap::plan(
        parameters.iter().map(|(name, tensor)| {
            let bytes = tensor.numel() * tensor.kind().elt_size_in_bytes();
            (name.as_str(), bytes as u64)
        }),
        &max_memory(unit_count),
    )?;
    map.ensure_single_unit()?;
    tracing::info!(
        parameters = map.len(),
        units = map.units_used(),
        "placed quantized parameters"
    );
    Ok(map)
}

/// Folds each low-rank pair into its target weight. Adapter tensors follow the
/// base model's placement when it is sharded.
fn merge_adapter(
    module: &CModule,
    source: &ArtifactSource,
    device: Device,
    device_map: Option<&DeviceMap>,
) -> Result<usize, ServiceError> {
    let config = AdapterConfig::from_file(&source.fetch(ADAPTER_CONFIG_FILE)?)?;
    let tensors: HashMap<String, Tensor> =
        Tensor::read_safetensors(source.fetch(ADAPTER_WEIGHTS_FILE)?)
            .map_err(adapter_err)?
            .into_iter()
            .collect();
    let pairs = pair_lora_tensors(tensors.keys().map(String::as_str))?;
    config.check_targets(&pairs)?;
    let adapter_map = device_map.map(DeviceMap::for_adapter);
    let mut parameters: HashMap<String, Tensor> =
        module.named_parameters().map_err(load_err)?.into_iter().collect();
    let scaling = config.scaling();

    no_grad(|| {
        for pair in &pairs {
            let target = parameters
                .get_mut(&pair.target)
                .ok_or_else(|| missing_target(&pair.target, device_map.is_some()))?;
            let placement = adapter_map
                .as_ref()
                .and_then(|map| map.unit_for(&pair.adapter_key))
                .map_or(device, Device::Cuda);

            let a = tensors[&pair.a_key].to_device(placement).to_kind(Kind::Float);
            let b = tensors[&pair.b_key].to_device(placement).to_kind(Kind::Float);
            let mut delta = b.f_matmul(&a).map_err(adapter_err)? * scaling;
            if config.fan_in_fan_out {
                delta = delta.tr();
            }
            let delta = delta.to_device(target.device()).to_kind(target.kind());
            target.f_add_(&delta).map_err(adapter_err)?;
        }
        Ok(pairs.len())
    })
}

fn missing_target(target: &str, quantized: bool) -> ServiceError {
    if quantized {
        ServiceError::Adapter(format!(
            "`{target}` is packed inside the quantized module; export {QUANTIZED_MODULE_FILE} \
             with the adapter already merged"
        ))
    } else {
        ServiceError::Adapter(format!("base model has no parameter `{target}`"))
    }
}

pub struct TchModel {
    module: Mutex<CModule>,
    device: Device,
    kind: ModelKind,
}

impl TchModel {
    /// One throwaway forward pass so the TorchScript executor can profile and
    /// optimise the graph before the first request.
    fn warm_up(&self, special: &SpecialTokens) -> Result<(), ServiceError> {
        let token = special.bos.unwrap_or(special.pad);
        let context = match self.kind {
            ModelKind::Causal => Vec::new(),
            ModelKind::Seq2Seq => vec![token],
        };
        self.next_token_logits(&context, &[vec![token]])?;
        tracing::debug!("graph warm-up finished");
        Ok(())
    }

    fn ids_tensor(&self, ids: &[i64], rows: i64) -> Tensor {
        Tensor::from_slice(ids)
            .reshape([rows, ids.len() as i64 / rows.max(1)])
            .to(self.device)
    }
}

impl LanguageModel for TchModel {
    fn kind(&self) -> ModelKind {
        self.kind
    }

    fn next_token_logits(
        &self,
        context: &[i64],
        sequences: &[Vec<i64>],
    ) -> Result<Vec<Vec<f32>>, ServiceError> {
        let batch = sequences.len() as i64;
        let decoder = self.ids_tensor(&sequences.concat(), batch);
        let inputs = match self.kind {
            ModelKind::Causal => vec![IValue::Tensor(decoder)],
            ModelKind::Seq2Seq => {
                let encoder = self.ids_tensor(context, 1).repeat([batch, 1]);
                vec![IValue::Tensor(encoder), IValue::Tensor(decoder)]
            }
        };

        let logits = no_grad(|| {
            let module = self.module.lock();
            let output = module
                .forward_is(&inputs)
                .map_err(|e| ServiceError::Inference(e.to_string()))?;
            extract_logits(output)
        })?;

        // [batch, seq_len, vocab] -> [batch, vocab] for the last position
        let last = logits
            .select(1, -1)
            .to_kind(Kind::Float)
            .to_device(Device::Cpu)
            .contiguous();
        let size = last.size();
        if size.len() != 2 || size[0] != batch {
            return Err(ServiceError::Inference(format!(
                "unexpected logits shape {size:?}"
            )));
        }
        let vocab = size[1] as usize;
        let flat = Vec::<f32>::try_from(&last.flatten(0, -1))
            .map_err(|e| ServiceError::Inference(e.to_string()))?;
        Ok(flat.chunks(vocab.max(1)).map(<[f32]>::to_vec).collect())
    }
}

/// Traced models return either the logits tensor or a tuple led by it.
fn extract_logits(output: IValue) -> Result<Tensor, ServiceError> {
    match output {
        IValue::Tensor(t) => Ok(t),
        IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
            IValue::Tensor(t) => Ok(t.shallow_clone()),
            _ => Err(ServiceError::Inference(
                "expected tensor as first tuple element".into(),
            )),
        },
        _ => Err(ServiceError::Inference("unexpected model output format".into())),
    }
}
