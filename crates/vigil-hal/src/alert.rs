//! Operator alerting.
//!
//! [`AlertDispatcher`] is fire-and-forget: callers hand it an alert and move
//! on. A background task rate-limits duplicates, fans the alert out to every
//! [`AlertSink`] with a per-sink timeout, and logs delivery failures without
//! ever propagating them to the caller.
//!
//! | Limit | Default | Applies to |
//! |---|---|---|
//! | Same source + message | once per 60 s | everything below `EMERGENCY` |
//! | Total volume | 30 per hour | everything below `EMERGENCY` |
//!
//! `EMERGENCY` alerts are never suppressed.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, DefaultKeyedRateLimiter, Quota, RateLimiter};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use vigil_types::{AlertSeverity, VigilError};

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub severity: AlertSeverity,
    /// Component that raised the alert.
    pub source: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// A delivery channel: pager, e-mail, chat webhook, log.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, alert: &Alert) -> Result<(), VigilError>;
}

/// Sink that writes alerts to the tracing log.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> Result<(), VigilError> {
        match alert.severity {
            AlertSeverity::Info => info!(source = %alert.source, "{}", alert.message),
            AlertSeverity::Warning => warn!(source = %alert.source, "{}", alert.message),
            AlertSeverity::Critical | AlertSeverity::Emergency => {
                error!(severity = %alert.severity, source = %alert.source, "{}", alert.message)
            }
        }
        Ok(())
    }
}

/// Throttling and delivery settings for [`AlertDispatcher`].
#[derive(Debug, Clone)]
pub struct AlertPolicy {
    /// Minimum spacing between identical alerts. Zero disables the check.
    pub min_interval: Duration,
    /// Hourly cap across all non-emergency alerts. Zero disables the cap.
    pub max_per_hour: u32,
    /// Per-sink delivery deadline.
    pub send_timeout: Duration,
    pub queue_depth: usize,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(60),
            max_per_hour: 30,
            send_timeout: Duration::from_secs(10),
            queue_depth: 64,
        }
    }
}

struct Throttle {
    per_message: Option<DefaultKeyedRateLimiter<String>>,
    hourly: Option<DefaultDirectRateLimiter>,
}

impl Throttle {
    fn new(policy: &AlertPolicy) -> Self {
        let per_message = Quota::with_period(policy.min_interval).map(RateLimiter::keyed);
        let hourly = NonZeroU32::new(policy.max_per_hour)
            .map(|n| RateLimiter::direct(Quota::per_hour(n)));
        Self { per_message, hourly }
    }

    fn admit(&self, alert: &Alert) -> bool {
        if alert.severity == AlertSeverity::Emergency {
            return true;
        }
        if let Some(limiter) = &self.per_message {
            let key = format!("{}:{}", alert.source, alert.message);
            if limiter.check_key(&key).is_err() {
                return false;
            }
        }
        match &self.hourly {
            Some(limiter) => limiter.check().is_ok(),
            None => true,
        }
    }
}

/// Cloneable handle to the background alert task.
#[derive(Clone, Debug)]
pub struct AlertDispatcher {
    tx: mpsc::Sender<Alert>,
}

impl AlertDispatcher {
    /// Start the delivery task on the current Tokio runtime.
    pub fn spawn(sinks: Vec<Arc<dyn AlertSink>>, policy: AlertPolicy) -> Self {
        let (tx, mut rx) = mpsc::channel::<Alert>(policy.queue_depth.max(1));
        let throttle = Throttle::new(&policy);
        let send_timeout = policy.send_timeout;

        tokio::spawn(async move {
            while let Some(alert) = rx.recv().await {
                if !throttle.admit(&alert) {
                    debug!(source = %alert.source, message = %alert.message, "alert rate limited");
                    continue;
                }
                for sink in &sinks {
                    match tokio::time::timeout(send_timeout, sink.send(&alert)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(sink = sink.name(), error = %e, "alert delivery failed")
                        }
                        Err(_) => warn!(sink = sink.name(), "alert delivery timed out"),
                    }
                }
            }
            debug!("alert dispatcher stopped");
        });

        Self { tx }
    }

    /// Queue an alert for delivery. Returns `false` when it had to be dropped
    /// because the queue is full or the dispatcher has stopped.
    pub fn raise(
        &self,
        severity: AlertSeverity,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> bool {
        let alert = Alert {
            severity,
            source: source.into(),
            message: message.into(),
            raised_at: Utc::now(),
        };
        match self.tx.try_send(alert) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "alert dropped");
                false
            }
        }
    }
}
