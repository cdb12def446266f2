//! Builds the registration request body.

use chrono::Utc;

use crate::messages::Register;

pub struct RegistrationBuilder {
    hostname: String,
}

impl RegistrationBuilder {
    pub fn new(hostname: String) -> Self {
        Self { hostname }
    }

    /// Registration payload carrying the last known response id so the server
    /// can tell a fresh agent from one that lost its heartbeat session.
    pub fn build(&self, response_id: i64) -> Register {
        Register {
            response_id,
            timestamp: Utc::now().timestamp_millis(),
            hostname: self.hostname.clone(),
            public_hostname: self.hostname.clone(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
