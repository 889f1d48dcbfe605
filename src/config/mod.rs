//! Prompt and app catalogue configuration.

mod apps;
mod prompts;

pub use apps::{get_package, APP_PACKAGES, PROMPT_APPS};
pub use prompts::{build_system_prompt, FORMAT_CORRECTION_HINT};
