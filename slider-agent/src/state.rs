//! Lifecycle tracking for the supervised component.
//!
//! Two states are kept side by side: what the server asked for (expected) and
//! what has been observed locally (actual). Expected moves only on
//! server-issued commands, actual only on local results; the two are compared
//! but never merged.

use serde_json::{json, Value};
use std::fmt;
use tracing::info;

use crate::messages::{
    CommandResultSummary, CommandStatus, ExecutionCommand, HealthStatus, StatusCommand,
};

/// Install/start progress of the supervised component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Init,
    Installing,
    Installed,
    Starting,
    Started,
    Failed,
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComponentState::Init => "INIT",
            ComponentState::Installing => "INSTALLING",
            ComponentState::Installed => "INSTALLED",
            ComponentState::Starting => "STARTING",
            ComponentState::Started => "STARTED",
            ComponentState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Expected/actual state pair plus the consecutive-failure counter.
#[derive(Debug)]
pub struct ComponentTracker {
    expected: ComponentState,
    actual: ComponentState,
    failure_count: u32,
    status_command: Option<StatusCommand>,
}

impl ComponentTracker {
    pub fn new() -> Self {
        Self {
            expected: ComponentState::Init,
            actual: ComponentState::Init,
            failure_count: 0,
            status_command: None,
        }
    }

    /// Apply a server command batch. Only the first command counts; the
    /// server never sends more than one role command per component.
    pub fn on_command(&mut self, commands: &[ExecutionCommand]) {
        if let Some(command) = commands.first() {
            match command.role_command.as_str() {
                "START" => {
                    self.expected = ComponentState::Starting;
                    self.actual = ComponentState::Starting;
                    self.failure_count = 0;
                    self.status_command = Some(synthesize_status_probe(command));
                }
                "INSTALL" => {
                    self.expected = ComponentState::Installing;
                    self.actual = ComponentState::Installing;
                    self.failure_count = 0;
                }
                _ => {}
            }
        }
        info!(
            expected = %self.expected,
            actual = %self.actual,
            "component states after command"
        );
    }

    /// Apply the latest locally observed result.
    pub fn on_result(&mut self, summary: &CommandResultSummary) {
        match summary.command_status {
            Some(CommandStatus::Completed) => {
                if self.expected == ComponentState::Starting {
                    self.actual = ComponentState::Started;
                    self.expected = ComponentState::Started;
                }
                if self.expected == ComponentState::Installing {
                    self.actual = ComponentState::Installed;
                    self.expected = ComponentState::Installed;
                }
            }
            Some(CommandStatus::Failed) => {
                self.actual = ComponentState::Failed;
                self.failure_count += 1;
            }
            Some(CommandStatus::InProgress) | None => {}
        }

        match summary.health_status {
            // Probe found the component installed but not running: counts as
            // a failure against whatever the server expects.
            Some(HealthStatus::Installed) => {
                self.actual = ComponentState::Failed;
                self.failure_count += 1;
            }
            Some(HealthStatus::Started) => {
                self.actual = ComponentState::Started;
                self.failure_count = 0;
            }
            None => {}
        }

        info!(
            expected = %self.expected,
            actual = %self.actual,
            failures = self.failure_count,
            "component states after result"
        );
    }

    /// The one condition under which the agent shuts itself down instead of
    /// retrying or restarting: the component died after reaching STARTED.
    pub fn should_stop(&self) -> bool {
        self.actual == ComponentState::Failed
            && self.expected == ComponentState::Started
            && self.failure_count >= 1
    }

    /// Probe synthesized from the last START command, resubmitted every cycle
    /// while the component is up.
    pub fn status_command(&self) -> Option<&StatusCommand> {
        self.status_command.as_ref()
    }

    pub fn expected(&self) -> ComponentState {
        self.expected
    }

    pub fn actual(&self) -> ComponentState {
        self.actual
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }
}

impl Default for ComponentTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the repeatable health probe out of the command that started the
/// component, carrying over the global configuration and host parameters.
fn synthesize_status_probe(command: &ExecutionCommand) -> StatusCommand {
    let global = command
        .configurations
        .get("global")
        .cloned()
        .unwrap_or(Value::Null);
    StatusCommand {
        cluster_name: command.cluster_name.clone(),
        command_type: "STATUS_COMMAND".to_string(),
        role_command: "STATUS".to_string(),
        component_name: command.role.clone(),
        service_name: command.service_name.clone(),
        task_id: json!("status"),
        configurations: json!({ "global": global }),
        command_params: command.command_params.clone(),
        host_level_params: command.host_level_params.clone(),
        auto_generated: true,
    }
}
