// Copyright 2025 Zhipu AI (Original Python implementation)
// Copyright 2025 ModerRAS (Rust implementation)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Grid Agent
//!
//! Vision-model driven automation of Android devices.
//!
//! Each step captures the screen, overlays a lettered grid, and asks a
//! vision-language model for the next action in grid cells ("CLICK E5")
//! instead of raw pixels. The action is validated against the grid and
//! executed over ADB, and the step is recorded to a JSONL session log.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use grid_agent::{AdbChannel, DeviceChannel, GridAgent, ModelClient, Settings};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load(None)?;
//!     let channel = Arc::new(AdbChannel::new(settings.adb.device_id.clone()));
//!     let (width, height) = channel.screen_size().await?;
//!     let grid = settings.resolve_grid(width, height)?;
//!
//!     let model = Arc::new(ModelClient::new(settings.model.clone()));
//!     let agent = GridAgent::new(settings.agent.clone(), grid, channel, model);
//!
//!     let (_cancel, cancelled) = tokio::sync::watch::channel(false);
//!     let session = agent.run("Open Settings and turn on Wi-Fi", cancelled).await?;
//!     println!("success: {}", session.is_success());
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod adb;
pub mod agent;
pub mod config;
pub mod decision;
pub mod grid;
pub mod logger;
pub mod model;
pub mod settings;

#[cfg(test)]
mod testing;

pub use actions::{parse_action_reply, Action, ActionError, DeviceExecutor, ScrollDirection};
pub use adb::{AdbChannel, AdbConnection, AdbError, DeviceChannel};
pub use agent::{
    AgentConfig, AgentError, FailureReason, GridAgent, SessionState, StepOutcome, StepRecord,
    TerminalState,
};
pub use decision::{DecisionAdapter, DecisionError};
pub use grid::{Annotator, CellLabel, GridError, GridSpec, GridStyle};
pub use logger::{SessionLogger, SessionSummary};
pub use model::{DecisionService, ModelClient, ModelConfig, ModelError};
pub use settings::{Settings, SettingsError};
