use std::{sync::Arc, time::Instant};

use crate::{
    error::ServiceError,
    model::{
        GenerationRequest, GenerationResponse, LanguageModel, TextCodec,
        codec::SpecialTokens,
        generation::{GenerationConfig, generate},
        loader::LoadedModel,
    },
    postprocess::post_process,
    prompt::build_prompt,
};

/// Prompt construction, generation and cleanup for one loaded model.
pub struct Pipeline {
    model: Arc<dyn LanguageModel>,
    codec: Arc<dyn TextCodec>,
    special: SpecialTokens,
    use_instruction_template: bool,
    default_seed: Option<u64>,
}

impl Pipeline {
    pub fn new(loaded: LoadedModel, use_instruction_template: bool, default_seed: Option<u64>) -> Self {
        Self {
            model: loaded.model,
            codec: loaded.codec,
            special: loaded.special,
            use_instruction_template,
            default_seed,
        }
    }

    pub fn run(&self, request: &GenerationRequest) -> Result<GenerationResponse, ServiceError> {
        request.validate()?;
        let config = GenerationConfig::from_request(request, self.default_seed)?;

        let prompt = build_prompt(
            &request.instruction,
            request.context(),
            self.use_instruction_template,
        );
        let input_ids = self.codec.encode(&prompt)?;

        let start = Instant::now();
        let output = generate(self.model.as_ref(), &input_ids, &self.special, &config)?;
        let elapsed = start.elapsed();

        let sequence = output.first()?;
        let decoded = self.codec.decode(&sequence.tokens)?;
        let text = post_process(&decoded, &prompt);

        let tokens_generated = sequence.generated_len();
        let tokens_per_second = if elapsed.as_secs_f64() > 0.0 {
            tokens_generated as f64 / elapsed.as_secs_f64()
        } else {
            tokens_generated as f64
        };
        tracing::info!(
            prompt_tokens = input_ids.len(),
            tokens_generated,
            beams = config.num_beams,
            elapsed_ms = elapsed.as_millis() as u64,
            "generation finished"
        );

        Ok(GenerationResponse {
            prompt,
            output: text,
            tokens_generated,
            total_time_ms: elapsed.as_millis(),
            tokens_per_second,
        })
    }
}
