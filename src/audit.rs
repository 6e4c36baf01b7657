//! §10.1: a small closed set of structured audit events, logged as JSON via
//! `tracing::event!` alongside ordinary log lines.

use serde::{Deserialize, Serialize};
use tracing::{Level, event};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    ServerStarted {
        #[serde(flatten)]
        common: CommonFields,
        bind_addr: String,
        root_dir: String,
    },

    ReadRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
    },

    WriteRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
    },

    TransferCompleted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        bytes_transferred: u64,
    },

    TransferFailed {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        error: String,
    },

    DuplicateRequestSuppressed {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
    },

    ErrorSent {
        #[serde(flatten)]
        common: CommonFields,
        peer_addr: String,
        code: String,
        message: String,
    },
}

/// Fields present on every audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonFields {
    /// ISO 8601 timestamp
    pub timestamp: String,
    pub hostname: String,
    pub service: String,
    pub severity: String,
}

impl CommonFields {
    pub fn new(severity: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            service: "tftpd".to_string(),
            severity: severity.to_string(),
        }
    }
}

impl AuditEvent {
    pub fn log(&self) {
        let severity = self.common().severity.clone();
        let json = serde_json::to_string(self)
            .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize audit event: {e}\"}}"));

        match severity.as_str() {
            "error" => event!(Level::ERROR, audit_event = %json),
            "warn" => event!(Level::WARN, audit_event = %json),
            _ => event!(Level::INFO, audit_event = %json),
        }
    }

    fn common(&self) -> &CommonFields {
        match self {
            AuditEvent::ServerStarted { common, .. }
            | AuditEvent::ReadRequest { common, .. }
            | AuditEvent::WriteRequest { common, .. }
            | AuditEvent::TransferCompleted { common, .. }
            | AuditEvent::TransferFailed { common, .. }
            | AuditEvent::DuplicateRequestSuppressed { common, .. }
            | AuditEvent::ErrorSent { common, .. } => common,
        }
    }
}

pub struct AuditLogger;

impl AuditLogger {
    pub fn server_started(bind_addr: &str, root_dir: &str) {
        AuditEvent::ServerStarted {
            common: CommonFields::new("info"),
            bind_addr: bind_addr.to_string(),
            root_dir: root_dir.to_string(),
        }
        .log();
    }

    pub fn read_request(client_addr: &str, filename: &str) {
        AuditEvent::ReadRequest {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
        }
        .log();
    }

    pub fn write_request(client_addr: &str, filename: &str) {
        AuditEvent::WriteRequest {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
        }
        .log();
    }

    pub fn transfer_completed(client_addr: &str, filename: &str, bytes_transferred: u64) {
        AuditEvent::TransferCompleted {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            bytes_transferred,
        }
        .log();
    }

    pub fn transfer_failed(client_addr: &str, filename: &str, error: &str) {
        AuditEvent::TransferFailed {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            error: error.to_string(),
        }
        .log();
    }

    pub fn duplicate_request_suppressed(client_addr: &str) {
        AuditEvent::DuplicateRequestSuppressed {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
        }
        .log();
    }

    pub fn error_sent(peer_addr: &str, code: &str, message: &str) {
        AuditEvent::ErrorSent {
            common: CommonFields::new("warn"),
            peer_addr: peer_addr.to_string(),
            code: code.to_string(),
            message: message.to_string(),
        }
        .log();
    }
}
