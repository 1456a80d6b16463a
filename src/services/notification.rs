//! Booking confirmation delivery.
//!
//! Delivery is best-effort: the booking manager only logs a failure and
//! reports it to the caller as a warning. Two notifiers are provided:
//! [`LogNotifier`] writes a structured log line, and [`HttpNotifier`] posts the
//! confirmation to a mail relay behind a circuit breaker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::NotificationConfig;
use crate::models::{BookingId, SeatId};

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("mail relay temporarily unavailable (circuit open)")]
    CircuitOpen,

    #[error("mail relay rejected the message with status {0}")]
    Rejected(u16),

    #[error("mail relay request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationSeat {
    pub seat_id: SeatId,
    pub row_num: i32,
    pub seat_num: i32,
    pub ticket_type: String,
    pub price_cents: i64,
}

/// Structured content of a booking confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub booking_id: BookingId,
    pub booking_code: String,
    pub movie_title: String,
    pub starts_at: DateTime<Utc>,
    pub seats: Vec<ConfirmationSeat>,
    pub total_cents: i64,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, confirmation: &Confirmation) -> Result<(), NotificationError>;
}

/// Logs confirmations instead of sending them. Used when no relay is configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipient: &str, confirmation: &Confirmation) -> Result<(), NotificationError> {
        info!(
            recipient,
            booking_code = %confirmation.booking_code,
            movie = %confirmation.movie_title,
            seats = confirmation.seats.len(),
            total_cents = confirmation.total_cents,
            "booking confirmation"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Stops calling a failing relay for `reset_timeout` after `failure_threshold`
/// consecutive failures, then lets a single probe through.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<(CircuitState, Option<Instant>)>,
    failure_count: AtomicU32,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            state: Mutex::new((CircuitState::Closed, None)),
            failure_count: AtomicU32::new(0),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
        }
    }

    pub fn can_execute(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.0 {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let elapsed = state.1.map(|opened| opened.elapsed()).unwrap_or_default();
                if elapsed >= self.reset_timeout {
                    state.0 = CircuitState::HalfOpen;
                    info!("mail relay circuit half-open, probing");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.0 == CircuitState::HalfOpen {
            info!("mail relay recovered, circuit closed");
        }
        *state = (CircuitState::Closed, None);
        self.failure_count.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.0 {
            CircuitState::Closed if failures >= self.failure_threshold => {
                *state = (CircuitState::Open, Some(Instant::now()));
                error!(failures, threshold = self.failure_threshold, "mail relay circuit opened");
            }
            CircuitState::HalfOpen => {
                *state = (CircuitState::Open, Some(Instant::now()));
                warn!("mail relay probe failed, circuit re-opened");
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).0
    }
}

#[derive(Debug, Serialize)]
struct RelayMessage<'a> {
    from: &'a str,
    to: &'a str,
    subject: String,
    confirmation: &'a Confirmation,
}

/// Posts confirmations as JSON to an HTTP mail relay.
pub struct HttpNotifier {
    client: reqwest::Client,
    relay_url: String,
    sender: String,
    breaker: CircuitBreaker,
}

impl HttpNotifier {
    pub fn new(relay_url: &str, config: &NotificationConfig) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            relay_url: relay_url.to_string(),
            sender: config.sender.clone(),
            breaker: CircuitBreaker::new(
                config.failure_threshold,
                Duration::from_secs(config.reset_timeout_seconds),
            ),
        })
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, recipient: &str, confirmation: &Confirmation) -> Result<(), NotificationError> {
        if !self.breaker.can_execute() {
            return Err(NotificationError::CircuitOpen);
        }

        let message = RelayMessage {
            from: &self.sender,
            to: recipient,
            subject: format!(
                "Your tickets for {} ({})",
                confirmation.movie_title, confirmation.booking_code
            ),
            confirmation,
        };

        let result = match self.client.post(&self.relay_url).json(&message).send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(NotificationError::Rejected(response.status().as_u16())),
            Err(e) => Err(NotificationError::Transport(e)),
        };

        match &result {
            Ok(()) => self.breaker.record_success(),
            Err(e) => {
                warn!(booking_code = %confirmation.booking_code, error = %e, "confirmation relay failed");
                self.breaker.record_failure();
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> NotificationConfig {
        NotificationConfig {
            relay_url: None,
            sender: "tickets@billetter.test".to_string(),
            timeout_seconds: 2,
            failure_threshold: 2,
            reset_timeout_seconds: 60,
        }
    }

    fn confirmation() -> Confirmation {
        Confirmation {
            booking_id: 1,
            booking_code: "ABC123".to_string(),
            movie_title: "Alien".to_string(),
            starts_at: Utc::now(),
            seats: vec![ConfirmationSeat {
                seat_id: 5,
                row_num: 1,
                seat_num: 5,
                ticket_type: "adult".to_string(),
                price_cents: 1200,
            }],
            total_cents: 1200,
        }
    }

    #[tokio::test]
    async fn posts_confirmation_to_relay() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .and(body_partial_json(serde_json::json!({
                "to": "guest@example.com",
                "confirmation": { "booking_code": "ABC123" }
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = HttpNotifier::new(&format!("{}/send", server.uri()), &config()).unwrap();
        notifier.send("guest@example.com", &confirmation()).await.unwrap();
    }

    #[tokio::test]
    async fn repeated_rejections_open_the_circuit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let notifier = HttpNotifier::new(&server.uri(), &config()).unwrap();
        for _ in 0..2 {
            let err = notifier.send("a@example.com", &confirmation()).await.unwrap_err();
            assert!(matches!(err, NotificationError::Rejected(500)));
        }
        assert_eq!(notifier.circuit_state(), CircuitState::Open);

        let err = notifier.send("a@example.com", &confirmation()).await.unwrap_err();
        assert!(matches!(err, NotificationError::CircuitOpen));
    }

    #[test]
    fn breaker_half_opens_after_timeout() {
        let breaker = CircuitBreaker::new(1, Duration::ZERO);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.can_execute());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
