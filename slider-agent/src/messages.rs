//! Wire types for the agent ⇄ server protocol.
//!
//! These mirror the JSON bodies exchanged on the register and heartbeat
//! endpoints. Response-side fields are widely optional on the wire, so they
//! decode to defaults instead of failing the whole cycle.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Status of a queued command as reported by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
}

/// Health of the supervised component as observed by a status probe.
///
/// `Installed` from a probe means the component is present but not fully up,
/// which the lifecycle tracker counts as a failure when a start was expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Installed,
    Started,
}

/// A server-issued command to install or start the component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutionCommand {
    pub cluster_name: String,
    pub command_type: String,
    pub role_command: String,
    pub role: String,
    pub service_name: String,
    pub task_id: Value,
    pub configurations: Value,
    pub command_params: HashMap<String, String>,
    pub host_level_params: HashMap<String, String>,
}

/// A status probe, either server-issued or synthesized locally after a START.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StatusCommand {
    pub cluster_name: String,
    pub command_type: String,
    pub role_command: String,
    pub component_name: String,
    pub service_name: String,
    pub task_id: Value,
    pub configurations: Value,
    pub command_params: HashMap<String, String>,
    pub host_level_params: HashMap<String, String>,
    pub auto_generated: bool,
}

/// Executor-side outcome of one command, relayed verbatim in heartbeats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReport {
    pub status: CommandStatus,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub role_command: String,
    #[serde(default)]
    pub task_id: Value,
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

/// Latest health probe result for the supervised component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatusReport {
    #[serde(default)]
    pub component_name: String,
    pub status: HealthStatus,
}

/// Compact view of the most recent executor results, derived once per built
/// heartbeat and consumed once by the lifecycle tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CommandResultSummary {
    pub command_status: Option<CommandStatus>,
    pub health_status: Option<HealthStatus>,
}

/// Static node health block carried on every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub status: String,
    pub cause: String,
}

impl NodeStatus {
    pub fn healthy() -> Self {
        Self {
            status: "HEALTHY".to_string(),
            cause: "NONE".to_string(),
        }
    }
}

/// Outgoing registration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Register {
    pub response_id: i64,
    pub timestamp: i64,
    pub hostname: String,
    pub public_hostname: String,
    pub agent_version: String,
}

/// Server reply to a registration request.
///
/// `exit_status` 1 means the agent and server versions disagree; that is
/// terminal and `log` carries the server's explanation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistrationResponse {
    #[serde(rename = "exitstatus")]
    pub exit_status: i32,
    pub log: Option<String>,
    pub response_id: i64,
    pub status_commands: Option<Vec<StatusCommand>>,
    pub response: Option<String>,
}

/// Outgoing heartbeat body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub response_id: i64,
    pub timestamp: i64,
    pub hostname: String,
    pub node_status: NodeStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reports: Vec<CommandReport>,
}

/// Server reply to a heartbeat.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub response_id: i64,
    pub has_mapped_components: Option<bool>,
    pub registration_command: Option<Value>,
    pub execution_commands: Option<Vec<ExecutionCommand>>,
    pub status_commands: Option<Vec<StatusCommand>>,
    pub restart_agent: Option<String>,
}

impl HeartbeatResponse {
    /// A non-null `registrationCommand` asks the agent to redo the handshake.
    pub fn wants_reregistration(&self) -> bool {
        matches!(&self.registration_command, Some(value) if !value.is_null())
    }

    /// The server restarts agents with the literal string `"true"`.
    pub fn wants_restart(&self) -> bool {
        self.restart_agent.as_deref() == Some("true")
    }
}
