//! Device actions: the action model, reply parsing and execution.

mod action;
mod handler;

pub use action::{
    parse_action_reply, Action, ActionError, ActionReply, ScrollDirection, DEFAULT_SCROLL_AMOUNT,
};
pub use handler::{scroll_swipe, DeviceError, DeviceExecutor, ExecutionOutcome, ExecutorConfig};
