use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose, Engine as _};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use billetter::cache::CacheService;
use billetter::config::{
    AppConfig, BookingConfig, BroadcastConfig, Config, DatabaseConfig, NotificationConfig, RedisConfig,
};
use billetter::models::{AuditoriumId, Role, ScreeningId, SeatId, TicketTypeId};
use billetter::services::notification::LogNotifier;
use billetter::store::{MemorySeatStore, SeatStore};
use billetter::{app, AppState};

fn test_config() -> Config {
    Config {
        app: AppConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            environment: "test".to_string(),
            rust_log: "billetter=debug".to_string(),
        },
        database: DatabaseConfig { url: String::new(), pool_size: 1 },
        redis: RedisConfig { url: None, seat_map_ttl_seconds: 0 },
        booking: BookingConfig::default(),
        broadcast: BroadcastConfig::default(),
        notification: NotificationConfig {
            relay_url: None,
            sender: "tickets@billetter.test".to_string(),
            timeout_seconds: 1,
            failure_threshold: 3,
            reset_timeout_seconds: 30,
        },
    }
}

struct TestApp {
    router: Router,
    store: MemorySeatStore,
    auditorium: AuditoriumId,
    screening: ScreeningId,
    adult: TicketTypeId,
}

impl TestApp {
    fn new() -> Self {
        let store = MemorySeatStore::new();
        let auditorium = store.add_auditorium(2, 5);
        let screening = store.add_screening("Solaris", auditorium, Utc::now() + Duration::days(1));
        let adult = store.add_ticket_type("adult", 900);
        let hash = bcrypt::hash("secret", 4).unwrap();
        store.add_user("owner@example.com", "Owner", &hash, Role::Customer);
        store.add_user("other@example.com", "Other", &hash, Role::Customer);

        let shared: Arc<dyn SeatStore> = Arc::new(store.clone());
        let state = AppState::new(
            test_config(),
            shared.clone(),
            CacheService::disabled(shared),
            Arc::new(LogNotifier),
        );

        Self { router: app(state), store, auditorium, screening, adult }
    }

    fn seat(&self, row: i32, num: i32) -> SeatId {
        self.store.seat_at(self.auditorium, row, num).unwrap()
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }
}

fn basic(email: &str, password: &str) -> String {
    format!("Basic {}", general_purpose::STANDARD.encode(format!("{email}:{password}")))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn json_request(method: &str, uri: &str, body: Value, auth: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn health_reports_subscribers() {
    let app = TestApp::new();
    let (status, body) = app.send(get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["subscribers"], 0);
}

#[tokio::test]
async fn seat_map_lists_every_seat_in_order() {
    let app = TestApp::new();
    let (status, body) = app
        .send(get(&format!("/api/screenings/{}/seats", app.screening)))
        .await;
    assert_eq!(status, StatusCode::OK);

    let seats = body["seats"].as_array().unwrap();
    assert_eq!(seats.len(), 10);
    assert_eq!(seats[0]["row_num"], 1);
    assert_eq!(seats[0]["seat_num"], 1);
    assert_eq!(seats[0]["status"], "available");

    let (status, body) = app.send(get("/api/screenings/999999/seats")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn guest_booking_then_conflict() {
    let app = TestApp::new();
    let payload = json!({
        "screening_id": app.screening,
        "seats": [{ "seat_id": app.seat(1, 2), "ticket_type_id": app.adult }],
        "guest_email": "guest@example.com"
    });

    let (status, body) = app.send(json_request("POST", "/api/bookings", payload.clone(), None)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["booking_code"].as_str().unwrap().len(), 6);
    assert_eq!(body["warnings"], json!([]));

    let (status, body) = app.send(json_request("POST", "/api/bookings", payload, None)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "seat_conflict");
    assert_eq!(body["seat_ids"], json!([app.seat(1, 2)]));
}

#[tokio::test]
async fn booking_without_any_holder_is_rejected() {
    let app = TestApp::new();
    let payload = json!({
        "screening_id": app.screening,
        "seats": [{ "seat_id": app.seat(1, 1), "ticket_type_id": app.adult }]
    });
    let (status, body) = app.send(json_request("POST", "/api/bookings", payload, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
    assert_eq!(app.store.booking_count(), 0);
}

#[tokio::test]
async fn allocate_and_suggest() {
    let app = TestApp::new();

    let (status, body) = app
        .send(get(&format!(
            "/api/screenings/{}/seats/suggest?count=3&anchor={}",
            app.screening,
            app.seat(2, 5)
        )))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["seat_ids"], json!([app.seat(2, 3), app.seat(2, 4), app.seat(2, 5)]));

    let payload = json!({
        "screening_id": app.screening,
        "ticket_type_ids": [app.adult, app.adult],
        "anchor_seat_id": app.seat(2, 5)
    });
    let (status, body) = app
        .send(json_request(
            "POST",
            "/api/bookings/allocate",
            payload,
            Some(basic("owner@example.com", "secret")),
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["seat_ids"], json!([app.seat(2, 4), app.seat(2, 5)]));

    let too_many = json!({
        "screening_id": app.screening,
        "ticket_type_ids": vec![app.adult; 6],
        "guest_email": "guest@example.com"
    });
    let (status, body) = app.send(json_request("POST", "/api/bookings/allocate", too_many, None)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "no_contiguous_block");
}

#[tokio::test]
async fn suggest_with_an_oversized_count_is_empty() {
    let app = TestApp::new();
    for count in [11u64, 1 << 31, (1 << 32) + 2] {
        let (status, body) = app
            .send(get(&format!(
                "/api/screenings/{}/seats/suggest?count={count}&anchor={}",
                app.screening,
                app.seat(1, 3)
            )))
            .await;
        assert_eq!(status, StatusCode::OK, "count {count}");
        assert_eq!(body["seat_ids"], json!([]), "count {count}");
    }
}

#[tokio::test]
async fn cancellation_requires_the_owner() {
    let app = TestApp::new();
    let payload = json!({
        "screening_id": app.screening,
        "seats": [{ "seat_id": app.seat(1, 1), "ticket_type_id": app.adult }]
    });
    let (status, body) = app
        .send(json_request(
            "POST",
            "/api/bookings",
            payload,
            Some(basic("owner@example.com", "secret")),
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let booking_id = body["booking_id"].as_i64().unwrap();
    let cancel = json!({ "booking_id": booking_id });

    let (status, _) = app
        .send(json_request("PATCH", "/api/bookings/cancel", cancel.clone(), None))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .send(json_request(
            "PATCH",
            "/api/bookings/cancel",
            cancel.clone(),
            Some(basic("owner@example.com", "wrong")),
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = app
        .send(json_request(
            "PATCH",
            "/api/bookings/cancel",
            cancel.clone(),
            Some(basic("other@example.com", "secret")),
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");

    let (status, body) = app
        .send(json_request(
            "PATCH",
            "/api/bookings/cancel",
            cancel,
            Some(basic("owner@example.com", "secret")),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["seat_ids"], json!([app.seat(1, 1)]));
    assert_eq!(app.store.booking_count(), 0);
}

#[tokio::test]
async fn lists_only_the_callers_bookings() {
    let app = TestApp::new();
    for (email, seat) in [("owner@example.com", app.seat(1, 1)), ("other@example.com", app.seat(1, 2))] {
        let payload = json!({
            "screening_id": app.screening,
            "seats": [{ "seat_id": seat, "ticket_type_id": app.adult }]
        });
        let (status, _) = app
            .send(json_request("POST", "/api/bookings", payload, Some(basic(email, "secret"))))
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let request = Request::builder()
        .uri("/api/bookings")
        .header(header::AUTHORIZATION, basic("owner@example.com", "secret"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::OK);
    let bookings = body.as_array().unwrap();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0]["seats"][0]["seat_id"], app.seat(1, 1));
}

#[tokio::test]
async fn stream_for_unknown_screening_is_not_found() {
    let app = TestApp::new();
    let (status, body) = app.send(get("/api/screenings/999999/seats/stream")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}
