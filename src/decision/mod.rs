//! Decision layer between the agent loop and the model.

mod adapter;

pub use adapter::{build_user_text, Decision, DecisionAdapter, DecisionContext, DecisionError};
