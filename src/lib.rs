pub mod config;
pub mod device;
pub mod error;
pub mod model;
pub mod page;
pub mod postprocess;
pub mod prompt;
pub mod server;

pub use config::{AppConfig, Cli, RuntimeConfig};
pub use device::{DeviceProfile, select_device};
pub use model::{GenerationRequest, GenerationResponse, ModelRegistry, bootstrap};
pub use postprocess::post_process;
pub use prompt::build_prompt;
pub use server::build_router;
