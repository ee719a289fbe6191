use std::sync::Arc;

use tokio::task;

use crate::{
    config::{AppConfig, Cli, RuntimeConfig},
    device::{AcceleratorProbe, DeviceProfile, select_device},
    error::ServiceError,
    model::{
        GenerationRequest, GenerationResponse, ModelMetadata, loader::ModelLoader,
        pipeline::Pipeline,
    },
};

/// Owns the loaded model for the lifetime of the process.
pub struct ModelRegistry {
    pipeline: Arc<Pipeline>,
    metadata: ModelMetadata,
}

impl ModelRegistry {
    pub fn initialize(
        config: &RuntimeConfig,
        profile: DeviceProfile,
        loader: &dyn ModelLoader,
    ) -> Result<Self, ServiceError> {
        let loaded = loader.load(config, &profile)?;
        let pipeline = Pipeline::new(loaded, config.use_instruction_template, config.default_seed);

        let metadata = ModelMetadata {
            name: config.model_name().to_string(),
            adapter: config.adapter_name().map(str::to_string),
            kind: config.model_kind,
            instruct: config.use_instruction_template,
            quantized: config.load_quantized,
            device: profile,
        };

        Ok(Self {
            pipeline: Arc::new(pipeline),
            metadata,
        })
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    /// Runs one request on the blocking pool; failures stay scoped to the request.
    pub async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, ServiceError> {
        let pipeline = self.pipeline.clone();
        task::spawn_blocking(move || pipeline.run(&request))
            .await
            .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }
}

/// Validates options, picks the device and loads the model, in that order.
pub fn bootstrap(
    cli: &Cli,
    probe: &dyn AcceleratorProbe,
    loader: &dyn ModelLoader,
) -> Result<(AppConfig, ModelRegistry), ServiceError> {
    let config = AppConfig::from_cli(cli)?;
    let profile = select_device(probe, config.runtime.load_quantized);
    tracing::info!(
        model = %config.runtime.base_model_id,
        adapter = ?config.runtime.adapter_id,
        kind = %config.runtime.model_kind,
        "loading model artifacts"
    );
    let registry = ModelRegistry::initialize(&config.runtime, profile, loader)?;
    Ok((config, registry))
}
