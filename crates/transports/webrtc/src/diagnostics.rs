//! Human-readable, timestamped diagnostics for the user-facing layer
//!
//! Every diagnostic is also emitted as a tracing event; subscribers get
//! their own copy through a broadcast channel.

use crate::endpoint::EndpointId;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{error, info};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

/// One diagnostic line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Time since the diagnostics clock started
    pub elapsed: Duration,
    /// Endpoint the line is about, if any
    pub endpoint: Option<EndpointId>,
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.elapsed.as_secs_f64())?;
        if self.severity == Severity::Error {
            f.write_str(" ERROR")?;
        }
        match self.endpoint {
            Some(endpoint) => write!(f, " {} {}", endpoint, self.message),
            None => write!(f, " {}", self.message),
        }
    }
}

/// Diagnostics sink shared by a call and its sessions
#[derive(Debug, Clone)]
pub struct Diagnostics {
    start: Instant,
    tx: broadcast::Sender<Diagnostic>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            start: Instant::now(),
            tx,
        }
    }

    /// Receive every diagnostic recorded from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Diagnostic> {
        self.tx.subscribe()
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn info(&self, endpoint: Option<EndpointId>, message: impl Into<String>) {
        self.record(endpoint, Severity::Info, message.into());
    }

    pub fn error(&self, endpoint: Option<EndpointId>, message: impl Into<String>) {
        self.record(endpoint, Severity::Error, message.into());
    }

    fn record(&self, endpoint: Option<EndpointId>, severity: Severity, message: String) {
        let diagnostic = Diagnostic {
            elapsed: self.elapsed(),
            endpoint,
            severity,
            message,
        };

        let endpoint_name = endpoint.map(EndpointId::peer_name).unwrap_or("-");
        match severity {
            Severity::Info => info!(endpoint = endpoint_name, "{}", diagnostic.message),
            Severity::Error => error!(endpoint = endpoint_name, "{}", diagnostic.message),
        }

        // No subscribers is fine
        let _ = self.tx.send(diagnostic);
    }
}
