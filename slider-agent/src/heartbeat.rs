//! Builds the outgoing heartbeat body from an executor snapshot.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::messages::{CommandResultSummary, CommandStatus, Heartbeat, NodeStatus};
use crate::queue::ActionQueue;

pub struct HeartbeatBuilder<Q> {
    queue: Arc<Q>,
    hostname: String,
}

impl<Q: ActionQueue> HeartbeatBuilder<Q> {
    pub fn new(queue: Arc<Q>, hostname: String) -> Self {
        Self { queue, hostname }
    }

    /// Build one heartbeat from a fresh executor snapshot, together with the
    /// result summary the lifecycle tracker consumes. The summary is derived
    /// here so the tracker never has to look at raw reports: the command
    /// status comes from the most recent report, the health status from the
    /// single live component's probe entry.
    pub fn build(
        &self,
        response_id: i64,
        components_mapped: bool,
    ) -> (Heartbeat, CommandResultSummary) {
        let snapshot = self.queue.result_snapshot();
        let timestamp = Utc::now().timestamp_millis();

        let commands_in_progress = !self.queue.is_empty()
            || snapshot
                .reports
                .iter()
                .any(|report| report.status == CommandStatus::InProgress);

        let summary = CommandResultSummary {
            command_status: snapshot.reports.last().map(|report| report.status),
            health_status: snapshot
                .component_status
                .first()
                .map(|component| component.status),
        };

        let heartbeat = Heartbeat {
            response_id,
            timestamp,
            hostname: self.hostname.clone(),
            node_status: NodeStatus::healthy(),
            reports: snapshot.reports,
        };

        info!(
            response_id,
            timestamp,
            commands_in_progress,
            components_mapped = effective_components_mapped(response_id, components_mapped),
            "sending heartbeat"
        );
        debug!(reports = heartbeat.reports.len(), "heartbeat contents");

        (heartbeat, summary)
    }
}

/// The very first heartbeat can never claim mapped components, whatever the
/// caller believes.
pub fn effective_components_mapped(response_id: i64, requested: bool) -> bool {
    requested && response_id != 0
}
