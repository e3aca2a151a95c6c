mod openai;
mod registry;
mod traits;

pub use openai::{OpenAiCompatBackend, OpenAiCompatConfig};
pub use registry::BackendRegistry;
pub use traits::*;
