pub mod adapter;
pub mod codec;
pub mod device_map;
pub mod generation;
pub mod loader;
mod pipeline;
mod registry;
mod types;

#[cfg(feature = "tch-backend")]
pub mod tch_backend;

pub use codec::{SpecialTokens, TextCodec};
pub use generation::{GenerationConfig, GenerationOutput, LanguageModel};
pub use loader::{LoadedModel, ModelLoader, NoBackend};
pub use pipeline::Pipeline;
pub use registry::{ModelRegistry, bootstrap};
pub use types::{
    GenerationRequest, GenerationResponse, MAX_NEW_TOKENS_LIMIT, MAX_NUM_BEAMS, MAX_TOP_K,
    ModelMetadata,
};
