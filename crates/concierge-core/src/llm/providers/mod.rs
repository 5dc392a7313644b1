mod openai;
mod openrouter;

pub use openai::{OpenAiProvider, OPENAI_API_BASE};
pub use openrouter::OpenRouterProvider;
