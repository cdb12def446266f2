//! Registration handshake and heartbeat loop driver.
//!
//! One long-lived task owns every piece of protocol state: the response
//! sequence, the lifecycle tracker, the retry flag and the cached HTTP
//! client. Nothing here is shared; the executor is reached only through the
//! queue boundary, and external callers can at most provoke an early
//! heartbeat through the wake signal.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::error::{classify, ExchangeError};
use crate::heartbeat::HeartbeatBuilder;
use crate::messages::{HeartbeatResponse, RegistrationResponse, StatusCommand};
use crate::queue::ActionQueue;
use crate::registration::RegistrationBuilder;
use crate::state::{ComponentState, ComponentTracker};

/// Exit code understood by the external supervisor as "relaunch me".
pub const AGENT_AUTO_RESTART_EXIT_CODE: i32 = 77;

/// Why the controller returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerExit {
    /// Component failed for good after reaching STARTED; clean shutdown.
    Stopped,
    /// Protocol state can no longer be trusted; the whole process must be
    /// relaunched by the supervisor.
    Restart,
    /// Registration or transport hit a terminal failure.
    Failed,
}

/// Why one heartbeat session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEnd {
    /// Server asked for a fresh handshake; the outer loop redoes it.
    Reregister,
    Stop(ControllerExit),
}

/// Ephemeral result of the registration handshake.
#[derive(Debug)]
pub struct RegistrationSession {
    pub registered: bool,
    pub exit_status: i32,
    pub message: Option<String>,
}

pub struct Controller<Q> {
    config: AgentConfig,
    register_url: String,
    heartbeat_url: String,
    queue: Arc<Q>,
    registration: RegistrationBuilder,
    heartbeat: HeartbeatBuilder<Q>,
    tracker: ComponentTracker,
    /// Cached connection; dropped on any send failure.
    client: Option<Client>,
    response_id: i64,
    is_registered: bool,
    has_mapped_components: bool,
    successful_heartbeats: u64,
    heartbeat_retries: u64,
    wake: Arc<Notify>,
    registration_listeners: Vec<Box<dyn Fn() + Send + Sync>>,
}

impl<Q: ActionQueue> Controller<Q> {
    pub fn new(config: AgentConfig, queue: Arc<Q>) -> Self {
        let hostname = config.agent.label.clone();
        let base = config.base_url();
        Self {
            register_url: format!("{base}/ws/v1/slider/agents/{hostname}/register"),
            heartbeat_url: format!("{base}/ws/v1/slider/agents/{hostname}/heartbeat"),
            registration: RegistrationBuilder::new(hostname.clone()),
            heartbeat: HeartbeatBuilder::new(Arc::clone(&queue), hostname),
            queue,
            config,
            tracker: ComponentTracker::new(),
            client: None,
            response_id: -1,
            is_registered: false,
            has_mapped_components: true,
            successful_heartbeats: 0,
            heartbeat_retries: 0,
            wake: Arc::new(Notify::new()),
            registration_listeners: Vec::new(),
        }
    }

    /// Handle other parts of the system use to provoke an early heartbeat.
    /// The signal is sticky: a wake sent before the wait begins is kept until
    /// the next wait consumes it.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Callback run once after every successful registration.
    pub fn add_registration_listener(&mut self, listener: impl Fn() + Send + Sync + 'static) {
        self.registration_listeners.push(Box::new(listener));
    }

    pub fn response_id(&self) -> i64 {
        self.response_id
    }

    pub fn is_registered(&self) -> bool {
        self.is_registered
    }

    pub fn has_mapped_components(&self) -> bool {
        self.has_mapped_components
    }

    pub fn successful_heartbeats(&self) -> u64 {
        self.successful_heartbeats
    }

    pub fn tracker(&self) -> &ComponentTracker {
        &self.tracker
    }

    /// Drive registration and heartbeating until a terminal outcome.
    pub async fn run(&mut self) -> ControllerExit {
        loop {
            let session = self.register_with_server().await;
            if !session.registered {
                info!("controller stopped");
                return ControllerExit::Failed;
            }
            if let Some(message) = &session.message {
                info!(message = %message, "response from server");
            }
            for listener in &self.registration_listeners {
                listener();
            }

            // Give the server one idle interval to map the agent before the
            // first heartbeat goes out.
            tokio::time::sleep(self.config.heartbeat.idle_interval()).await;

            match self.heartbeat_with_server().await {
                HeartbeatEnd::Reregister => continue,
                HeartbeatEnd::Stop(exit) => {
                    info!("controller stopped heartbeating");
                    return exit;
                }
            }
        }
    }

    /// Registration handshake, retried with jittered backoff until the server
    /// accepts or a terminal condition is hit.
    pub async fn register_with_server(&mut self) -> RegistrationSession {
        loop {
            let payload = self.registration.build(self.response_id);
            let body = match serde_json::to_string(&payload) {
                Ok(body) => body,
                Err(err) => {
                    error!(error = %err, "failed to serialize registration payload");
                    jitter_sleep(self.config.heartbeat.retry_jitter_secs).await;
                    continue;
                }
            };

            info!(url = %self.register_url, "registering with the server");
            let url = self.register_url.clone();
            match self.post::<RegistrationResponse>(&url, body).await {
                Ok(response) if response.exit_status == 1 => {
                    // Version mismatch between agent and server; retrying
                    // cannot fix it.
                    error!(
                        log = %response.log.clone().unwrap_or_default(),
                        "server rejected registration"
                    );
                    return RegistrationSession {
                        registered: false,
                        exit_status: 1,
                        message: response.log,
                    };
                }
                Ok(response) => {
                    info!(response_id = response.response_id, "registered with the server");
                    self.response_id = response.response_id;
                    self.is_registered = true;
                    match response.status_commands {
                        Some(commands) if !commands.is_empty() => {
                            info!(count = commands.len(), "got status commands on registration");
                            self.queue.submit_statuses(commands);
                        }
                        Some(_) => {}
                        None => {
                            // Server has no components mapped to this agent
                            // yet; the heartbeat will say so.
                            self.has_mapped_components = false;
                        }
                    }
                    return RegistrationSession {
                        registered: true,
                        exit_status: 0,
                        message: response.response,
                    };
                }
                Err(ExchangeError::Trust(err)) => {
                    error!(error = %err, "certificate verification failed during registration");
                    return RegistrationSession {
                        registered: false,
                        exit_status: 0,
                        message: None,
                    };
                }
                Err(ExchangeError::Transient(err)) => {
                    warn!(url = %self.register_url, error = format!("{err:#}"), "unable to register, will retry");
                    jitter_sleep(self.config.heartbeat.retry_jitter_secs).await;
                }
            }
        }
    }

    /// Heartbeat loop. Runs until re-registration is requested, the protocol
    /// state diverges, a terminal failure occurs, or the component has
    /// permanently failed.
    pub async fn heartbeat_with_server(&mut self) -> HeartbeatEnd {
        let mut retry = false;
        let mut pending_body = String::new();

        loop {
            if self.tracker.should_stop() {
                info!("component instance has stopped, stopping the agent");
                self.queue.request_stop();
                self.queue.await_stopped().await;
                return HeartbeatEnd::Stop(ControllerExit::Stopped);
            }

            if let Some(end) = self.heartbeat_cycle(&mut retry, &mut pending_body).await {
                return end;
            }

            self.pace().await;
        }
    }

    /// One build/send/process cycle. Returns `Some` when the session must
    /// end; transient failures are absorbed here after flagging a retry.
    async fn heartbeat_cycle(
        &mut self,
        retry: &mut bool,
        pending_body: &mut String,
    ) -> Option<HeartbeatEnd> {
        if !*retry {
            let (payload, summary) = self
                .heartbeat
                .build(self.response_id, self.has_mapped_components);
            // Local state always reflects the last known result before the
            // server is told about it.
            self.tracker.on_result(&summary);
            match serde_json::to_string(&payload) {
                Ok(body) => *pending_body = body,
                Err(err) => {
                    error!(error = %err, "failed to serialize heartbeat payload");
                    jitter_sleep(self.config.heartbeat.retry_jitter_secs).await;
                    return None;
                }
            }
        } else {
            // The server never acknowledged the previous payload; resend it
            // unchanged so no report is lost or duplicated.
            self.heartbeat_retries += 1;
            debug!(retries = self.heartbeat_retries, "resending unacknowledged heartbeat");
        }

        let url = self.heartbeat_url.clone();
        let mut response = match self.post::<HeartbeatResponse>(&url, pending_body.clone()).await {
            Ok(response) => response,
            Err(ExchangeError::Trust(err)) => {
                error!(error = %err, "certificate verification failed during heartbeat");
                return Some(HeartbeatEnd::Stop(ControllerExit::Failed));
            }
            Err(ExchangeError::Transient(err)) => {
                if !*retry {
                    info!("connection to the server was lost, reconnecting");
                }
                warn!(url = %self.heartbeat_url, error = format!("{err:#}"), "heartbeat failed, will resend");
                self.client = None;
                *retry = true;
                jitter_sleep(self.config.heartbeat.retry_jitter_secs).await;
                return None;
            }
        };

        debug!(response_id = response.response_id, "got heartbeat response");

        if response.response_id != self.response_id + 1 {
            // Command/result bookkeeping cannot be trusted once a cycle was
            // lost or duplicated; only a process restart resets both sides.
            error!(
                expected = self.response_id + 1,
                got = response.response_id,
                "responseId sequence diverged, restarting the agent"
            );
            return Some(HeartbeatEnd::Stop(ControllerExit::Restart));
        }
        self.response_id = response.response_id;

        if let Some(mapped) = response.has_mapped_components {
            self.has_mapped_components = mapped;
        }

        if response.wants_reregistration() {
            info!("registration command received, repeating agent registration");
            self.is_registered = false;
            return Some(HeartbeatEnd::Reregister);
        }

        if let Some(commands) = response.execution_commands.take() {
            self.tracker.on_command(&commands);
            self.queue.submit_executions(commands);
        }

        if let Some(commands) = response.status_commands.take() {
            // Status probes must never pile up behind pending work.
            if self.queue.is_empty() {
                self.queue.submit_statuses(commands);
            }
        }

        if response.wants_restart() {
            error!("got restartAgent command");
            return Some(HeartbeatEnd::Stop(ControllerExit::Restart));
        }

        // Keep polling the component's health while it is up.
        if self.tracker.actual() == ComponentState::Started {
            if let Some(probe) = self.tracker.status_command() {
                let probe: StatusCommand = probe.clone();
                self.queue.submit_statuses(vec![probe]);
            }
        }

        if *retry {
            info!("reconnected to the server");
        }
        *retry = false;
        self.successful_heartbeats += 1;
        self.heartbeat_retries = 0;
        self.drain_wake();
        None
    }

    /// Interruptible wait capped at `idle − min`, then an unconditional
    /// `min` sleep so status results landing in the short window get batched
    /// into one heartbeat instead of hammering the server.
    async fn pace(&self) {
        let idle = self.config.heartbeat.idle_interval();
        let min = self.config.heartbeat.min_interval();
        let _ = tokio::time::timeout(idle.saturating_sub(min), self.wake.notified()).await;
        tokio::time::sleep(min).await;
    }

    /// Consume a wake that arrived during the cycle just completed, so it
    /// does not cut the next wait short.
    fn drain_wake(&self) {
        let _ = self.wake.notified().now_or_never();
    }

    fn client(&mut self) -> Result<Client, ExchangeError> {
        match &self.client {
            Some(client) => Ok(client.clone()),
            None => {
                let client = Client::builder()
                    .timeout(self.config.heartbeat.request_timeout())
                    .build()
                    .map_err(|err| ExchangeError::Transient(err.into()))?;
                self.client = Some(client.clone());
                Ok(client)
            }
        }
    }

    async fn post<T: DeserializeOwned>(
        &mut self,
        url: &str,
        body: String,
    ) -> Result<T, ExchangeError> {
        let client = self.client()?;
        let response = client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(classify)?;
        let response = response.error_for_status().map_err(classify)?;
        response.json::<T>().await.map_err(classify)
    }
}

/// Uniform random delay in `[0, upper]` seconds before a retry, so a fleet of
/// agents does not stampede a recovering server.
async fn jitter_sleep(upper: u64) {
    let delay = jitter_secs(upper);
    debug!(delay_secs = delay, "backing off before retry");
    tokio::time::sleep(Duration::from_secs(delay)).await;
}

fn jitter_secs(upper: u64) -> u64 {
    if upper == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=upper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{CommandReport, CommandStatus, ComponentStatusReport, HealthStatus};
    use crate::queue::{CommandQueue, QueuedCommand};

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::time::Instant;

    enum Reply {
        Json(Value),
        Status(u16),
    }

    #[derive(Default)]
    struct MockServer {
        register_bodies: Mutex<Vec<Value>>,
        heartbeat_bodies: Mutex<Vec<String>>,
        register_replies: Mutex<VecDeque<Reply>>,
        heartbeat_replies: Mutex<VecDeque<Reply>>,
        // Called with the request index after a heartbeat body is recorded,
        // before the reply goes out.
        heartbeat_hook: Mutex<Option<Box<dyn Fn(usize) + Send>>>,
    }

    impl MockServer {
        fn script_register(&self, reply: Value) {
            self.register_replies.lock().push_back(Reply::Json(reply));
        }

        fn script_heartbeat(&self, reply: Value) {
            self.heartbeat_replies.lock().push_back(Reply::Json(reply));
        }

        fn script_heartbeat_error(&self, code: u16) {
            self.heartbeat_replies.lock().push_back(Reply::Status(code));
        }
    }

    async fn register_handler(
        State(server): State<Arc<MockServer>>,
        body: String,
    ) -> (StatusCode, String) {
        let parsed: Value = serde_json::from_str(&body).unwrap();
        server.register_bodies.lock().push(parsed);
        match server.register_replies.lock().pop_front() {
            Some(Reply::Json(value)) => (StatusCode::OK, value.to_string()),
            Some(Reply::Status(code)) => (StatusCode::from_u16(code).unwrap(), String::new()),
            None => (StatusCode::SERVICE_UNAVAILABLE, String::new()),
        }
    }

    async fn heartbeat_handler(
        State(server): State<Arc<MockServer>>,
        body: String,
    ) -> (StatusCode, String) {
        let index = {
            let mut bodies = server.heartbeat_bodies.lock();
            bodies.push(body);
            bodies.len() - 1
        };
        if let Some(hook) = server.heartbeat_hook.lock().as_ref() {
            hook(index);
        }
        match server.heartbeat_replies.lock().pop_front() {
            Some(Reply::Json(value)) => (StatusCode::OK, value.to_string()),
            Some(Reply::Status(code)) => (StatusCode::from_u16(code).unwrap(), String::new()),
            None => (StatusCode::SERVICE_UNAVAILABLE, String::new()),
        }
    }

    async fn spawn_server(server: Arc<MockServer>) -> u16 {
        let app = Router::new()
            .route("/ws/v1/slider/agents/{hostname}/register", post(register_handler))
            .route("/ws/v1/slider/agents/{hostname}/heartbeat", post(heartbeat_handler))
            .with_state(server);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    fn test_config(port: u16) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.server.hostname = "127.0.0.1".to_string();
        config.server.port = port;
        config.agent.label = "host1.example.com".to_string();
        config.heartbeat.idle_interval_secs = 0;
        config.heartbeat.min_interval_secs = 0;
        config.heartbeat.retry_jitter_secs = 0;
        config.heartbeat.request_timeout_secs = 5;
        config
    }

    async fn controller_against(
        server: &Arc<MockServer>,
    ) -> (Controller<CommandQueue>, Arc<CommandQueue>) {
        let port = spawn_server(Arc::clone(server)).await;
        let queue = Arc::new(CommandQueue::new());
        let controller = Controller::new(test_config(port), Arc::clone(&queue));
        (controller, queue)
    }

    fn start_command() -> Value {
        json!({
            "clusterName": "cl1",
            "commandType": "EXECUTION_COMMAND",
            "roleCommand": "START",
            "role": "HBASE_MASTER",
            "serviceName": "HBASE",
            "taskId": 2,
            "configurations": {"global": {"app_root": "/apps/hbase"}},
            "commandParams": {"script": "hbase_master.py"},
            "hostLevelParams": {"java_home": "/usr/jdk"}
        })
    }

    #[tokio::test]
    async fn registration_adopts_server_response_id() {
        let server = Arc::new(MockServer::default());
        server.script_register(json!({"exitstatus": 0, "responseId": 5}));
        let (mut controller, queue) = controller_against(&server).await;

        let session = controller.register_with_server().await;
        assert!(session.registered);
        assert_eq!(session.exit_status, 0);
        assert!(controller.is_registered());
        assert_eq!(controller.response_id(), 5);
        // No statusCommands in the response: nothing queued, nothing mapped.
        assert!(queue.is_empty());
        assert!(!controller.has_mapped_components());

        let bodies = server.register_bodies.lock();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["responseId"], -1);
        assert_eq!(bodies[0]["hostname"], "host1.example.com");
    }

    #[tokio::test]
    async fn version_mismatch_is_terminal_without_retry() {
        let server = Arc::new(MockServer::default());
        server.script_register(json!({"exitstatus": 1, "log": "version mismatch"}));
        let (mut controller, _queue) = controller_against(&server).await;

        let session = controller.register_with_server().await;
        assert!(!session.registered);
        assert_eq!(session.exit_status, 1);
        assert_eq!(session.message.as_deref(), Some("version mismatch"));
        assert!(!controller.is_registered());
        assert_eq!(server.register_bodies.lock().len(), 1);
    }

    #[tokio::test]
    async fn transient_registration_failure_retries_until_accepted() {
        let server = Arc::new(MockServer::default());
        server.register_replies.lock().push_back(Reply::Status(500));
        server.script_register(json!({"exitstatus": 0, "responseId": 0}));
        let (mut controller, _queue) = controller_against(&server).await;

        let session = controller.register_with_server().await;
        assert!(session.registered);
        assert_eq!(server.register_bodies.lock().len(), 2);
    }

    #[tokio::test]
    async fn bootstrap_status_commands_are_queued() {
        let server = Arc::new(MockServer::default());
        server.script_register(json!({
            "exitstatus": 0,
            "responseId": 0,
            "statusCommands": [{
                "clusterName": "cl1",
                "commandType": "STATUS_COMMAND",
                "roleCommand": "STATUS",
                "componentName": "HBASE_MASTER",
                "serviceName": "HBASE"
            }]
        }));
        let (mut controller, queue) = controller_against(&server).await;

        let session = controller.register_with_server().await;
        assert!(session.registered);
        assert!(controller.has_mapped_components());
        assert!(matches!(queue.take_next(), Some(QueuedCommand::Status(_))));
    }

    #[tokio::test]
    async fn sequence_divergence_requests_restart() {
        let server = Arc::new(MockServer::default());
        server.script_register(json!({"exitstatus": 0, "responseId": 5}));
        // 7 != 5 + 1: the cycle bookkeeping is broken.
        server.script_heartbeat(json!({"responseId": 7}));
        let (mut controller, _queue) = controller_against(&server).await;

        controller.register_with_server().await;
        let end = controller.heartbeat_with_server().await;
        assert_eq!(end, HeartbeatEnd::Stop(ControllerExit::Restart));
        // The diverged id must not be adopted.
        assert_eq!(controller.response_id(), 5);
    }

    #[tokio::test]
    async fn restart_directive_requests_restart() {
        let server = Arc::new(MockServer::default());
        server.script_register(json!({"exitstatus": 0, "responseId": 5}));
        server.script_heartbeat(json!({"responseId": 6, "restartAgent": "true"}));
        let (mut controller, _queue) = controller_against(&server).await;

        controller.register_with_server().await;
        let end = controller.heartbeat_with_server().await;
        assert_eq!(end, HeartbeatEnd::Stop(ControllerExit::Restart));
        assert_eq!(controller.response_id(), 6);
    }

    #[tokio::test]
    async fn reregistration_directive_exits_the_loop() {
        let server = Arc::new(MockServer::default());
        server.script_register(json!({"exitstatus": 0, "responseId": 5}));
        server.script_heartbeat(json!({
            "responseId": 6,
            "registrationCommand": {"command": "register"}
        }));
        let (mut controller, _queue) = controller_against(&server).await;

        controller.register_with_server().await;
        let end = controller.heartbeat_with_server().await;
        assert_eq!(end, HeartbeatEnd::Reregister);
        assert!(!controller.is_registered());
    }

    #[tokio::test]
    async fn retried_heartbeat_resends_identical_payload() {
        let server = Arc::new(MockServer::default());
        server.script_register(json!({"exitstatus": 0, "responseId": 5}));
        server.script_heartbeat_error(500);
        server.script_heartbeat(json!({
            "responseId": 6,
            "registrationCommand": {"command": "register"}
        }));
        let (mut controller, queue) = controller_against(&server).await;

        // A report that exists only at first-build time: the resend must
        // carry it even though the queue has been drained since.
        queue.push_report(CommandReport {
            status: CommandStatus::Completed,
            role: "HBASE_MASTER".into(),
            role_command: "INSTALL".into(),
            task_id: json!(1),
            cluster_name: "cl1".into(),
            service_name: "HBASE".into(),
            exit_code: Some(0),
            stdout: None,
            stderr: None,
        });

        controller.register_with_server().await;
        let end = controller.heartbeat_with_server().await;
        assert_eq!(end, HeartbeatEnd::Reregister);

        let bodies = server.heartbeat_bodies.lock();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0], bodies[1], "retry must resend byte-identical payload");
        let parsed: Value = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(parsed["reports"][0]["status"], "COMPLETED");
    }

    #[tokio::test]
    async fn execution_commands_are_tracked_and_queued() {
        let server = Arc::new(MockServer::default());
        server.script_register(json!({"exitstatus": 0, "responseId": 5}));
        server.script_heartbeat(json!({
            "responseId": 6,
            "executionCommands": [start_command()]
        }));
        server.script_heartbeat(json!({
            "responseId": 7,
            "registrationCommand": {"command": "register"}
        }));
        let (mut controller, queue) = controller_against(&server).await;

        controller.register_with_server().await;
        let end = controller.heartbeat_with_server().await;
        assert_eq!(end, HeartbeatEnd::Reregister);

        assert_eq!(controller.tracker().expected(), ComponentState::Starting);
        assert!(matches!(queue.take_next(), Some(QueuedCommand::Execution(_))));
        assert!(controller.tracker().status_command().is_some());
    }

    #[tokio::test]
    async fn restart_directive_still_honors_commands_in_the_same_response() {
        let server = Arc::new(MockServer::default());
        server.script_register(json!({"exitstatus": 0, "responseId": 5}));
        server.script_heartbeat(json!({
            "responseId": 6,
            "executionCommands": [start_command()],
            "restartAgent": "true"
        }));
        let (mut controller, queue) = controller_against(&server).await;

        controller.register_with_server().await;
        let end = controller.heartbeat_with_server().await;
        assert_eq!(end, HeartbeatEnd::Stop(ControllerExit::Restart));
        // The command batch delivered alongside the directive is not lost.
        assert_eq!(controller.tracker().expected(), ComponentState::Starting);
        assert!(matches!(queue.take_next(), Some(QueuedCommand::Execution(_))));
    }

    #[tokio::test]
    async fn started_component_is_polled_every_cycle() {
        let server = Arc::new(MockServer::default());
        server.script_register(json!({"exitstatus": 0, "responseId": 5}));
        server.script_heartbeat(json!({
            "responseId": 6,
            "executionCommands": [start_command()]
        }));
        server.script_heartbeat(json!({"responseId": 7}));
        server.script_heartbeat(json!({
            "responseId": 8,
            "registrationCommand": {"command": "register"}
        }));
        let (mut controller, queue) = controller_against(&server).await;

        // Once the START command is delivered, have the executor report it
        // complete before the next heartbeat is built.
        {
            let queue = Arc::clone(&queue);
            *server.heartbeat_hook.lock() = Some(Box::new(move |index| {
                if index == 0 {
                    queue.push_report(CommandReport {
                        status: CommandStatus::Completed,
                        role: "HBASE_MASTER".into(),
                        role_command: "START".into(),
                        task_id: json!(2),
                        cluster_name: "cl1".into(),
                        service_name: "HBASE".into(),
                        exit_code: Some(0),
                        stdout: None,
                        stderr: None,
                    });
                }
            }));
        }

        controller.register_with_server().await;
        let end = controller.heartbeat_with_server().await;
        assert_eq!(end, HeartbeatEnd::Reregister);
        assert_eq!(controller.tracker().actual(), ComponentState::Started);

        // Pending work: the START command plus the probe from the one full
        // cycle spent in STARTED (the final cycle exits at the directive,
        // before probe resubmission).
        let mut probes = 0;
        let mut executions = 0;
        while let Some(command) = queue.take_next() {
            match command {
                QueuedCommand::Execution(_) => executions += 1,
                QueuedCommand::Status(probe) => {
                    assert_eq!(probe.component_name, "HBASE_MASTER");
                    assert!(probe.auto_generated);
                    probes += 1;
                }
            }
        }
        assert_eq!(executions, 1);
        assert_eq!(probes, 1);
    }

    #[tokio::test]
    async fn component_death_after_started_stops_the_agent() {
        let server = Arc::new(MockServer::default());
        server.script_register(json!({"exitstatus": 0, "responseId": 5}));
        server.script_heartbeat(json!({
            "responseId": 6,
            "executionCommands": [start_command()]
        }));
        server.script_heartbeat(json!({"responseId": 7}));
        let (mut controller, queue) = controller_against(&server).await;

        // After the START is delivered: the start completed, but the health
        // probe only found the component installed, not running.
        {
            let queue = Arc::clone(&queue);
            *server.heartbeat_hook.lock() = Some(Box::new(move |index| {
                if index == 0 {
                    queue.push_report(CommandReport {
                        status: CommandStatus::Completed,
                        role: "HBASE_MASTER".into(),
                        role_command: "START".into(),
                        task_id: json!(2),
                        cluster_name: "cl1".into(),
                        service_name: "HBASE".into(),
                        exit_code: Some(0),
                        stdout: None,
                        stderr: None,
                    });
                    queue.set_component_status(ComponentStatusReport {
                        component_name: "HBASE_MASTER".into(),
                        status: HealthStatus::Installed,
                    });
                }
            }));
        }

        controller.register_with_server().await;
        let end = controller.heartbeat_with_server().await;
        assert_eq!(end, HeartbeatEnd::Stop(ControllerExit::Stopped));
        assert_eq!(controller.tracker().expected(), ComponentState::Started);
        assert_eq!(controller.tracker().actual(), ComponentState::Failed);
        assert!(queue.stop_requested());
        // Only two heartbeats went out; the third cycle stopped at the top.
        assert_eq!(server.heartbeat_bodies.lock().len(), 2);
    }

    #[tokio::test]
    async fn run_reregisters_then_surfaces_terminal_failure() {
        let server = Arc::new(MockServer::default());
        server.script_register(json!({"exitstatus": 0, "responseId": 5}));
        server.script_heartbeat(json!({
            "responseId": 6,
            "registrationCommand": {"command": "register"}
        }));
        server.script_register(json!({"exitstatus": 1, "log": "version mismatch"}));
        let (mut controller, _queue) = controller_against(&server).await;

        let exit = controller.run().await;
        assert_eq!(exit, ControllerExit::Failed);

        let bodies = server.register_bodies.lock();
        assert_eq!(bodies.len(), 2);
        // Re-registration carries the last adopted response id.
        assert_eq!(bodies[1]["responseId"], 6);
    }

    #[tokio::test]
    async fn registration_listeners_run_on_a_spawned_controller() {
        let server = Arc::new(MockServer::default());
        server.script_register(json!({"exitstatus": 0, "responseId": 5}));
        server.script_heartbeat(json!({
            "responseId": 6,
            "registrationCommand": {"command": "register"}
        }));
        server.script_register(json!({"exitstatus": 1, "log": "version mismatch"}));
        let (mut controller, _queue) = controller_against(&server).await;

        let registrations = Arc::new(std::sync::atomic::AtomicU32::new(0));
        {
            let registrations = Arc::clone(&registrations);
            controller.add_registration_listener(move || {
                registrations.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
        }

        // The whole run has to live on a worker thread, listener included.
        let exit = tokio::spawn(async move { controller.run().await })
            .await
            .unwrap();
        assert_eq!(exit, ControllerExit::Failed);
        // Once after the initial handshake; the rejected re-registration
        // never completes, so the listener does not fire again.
        assert_eq!(registrations.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wake_signal_cuts_the_idle_wait_short() {
        let server = Arc::new(MockServer::default());
        server.script_register(json!({"exitstatus": 0, "responseId": 5}));
        server.script_heartbeat(json!({"responseId": 6}));
        server.script_heartbeat(json!({
            "responseId": 7,
            "registrationCommand": {"command": "register"}
        }));
        let port = spawn_server(Arc::clone(&server)).await;

        let mut config = test_config(port);
        config.heartbeat.idle_interval_secs = 30;
        let queue = Arc::new(CommandQueue::new());
        let mut controller = Controller::new(config, Arc::clone(&queue));
        let wake = controller.wake_handle();

        let started = Instant::now();
        let task = tokio::spawn(async move {
            controller.register_with_server().await;
            controller.heartbeat_with_server().await
        });

        // Wait for the first heartbeat to land, then wake the loop out of
        // its 30 second idle wait.
        while server.heartbeat_bodies.lock().len() < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        wake.notify_one();

        let end = task.await.unwrap();
        assert_eq!(end, HeartbeatEnd::Reregister);
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "wake should interrupt the idle wait"
        );
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..200 {
            assert!(jitter_secs(30) <= 30);
        }
        assert_eq!(jitter_secs(0), 0);
    }
}
