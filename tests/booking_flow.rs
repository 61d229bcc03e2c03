//! End-to-end booking flow through the public API and the HTTP surface.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use slotlock::coordinator::{BookingCoordinator, LogNotifier, MemoryPersistence};
use slotlock::http::{self, AppState};
use slotlock::ledger::Ledger;
use slotlock::lock::{LockError, LockManager};
use slotlock::model::{SlotKey, SlotStatus};
use slotlock::notify::RoomHub;
use slotlock::store::MemoryStore;

const GENESIS: &str = "0000000000000000000000000000000000000000000000000000000000000000";
const TTL: Duration = Duration::from_secs(300);

fn ledger_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotlock_test_flow");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn app(name: &str) -> (Router, Arc<BookingCoordinator>, Arc<LockManager>) {
    let locks = Arc::new(LockManager::new(Arc::new(MemoryStore::new())));
    let ledger = Arc::new(Ledger::open(&ledger_path(name), GENESIS).unwrap());
    let rooms = Arc::new(RoomHub::new());
    let coordinator = Arc::new(BookingCoordinator::new(
        locks.clone(),
        ledger.clone(),
        rooms.clone(),
        Arc::new(MemoryPersistence::new()),
        Arc::new(LogNotifier),
        TTL,
        TTL,
    ));
    let router = http::router(AppState {
        coordinator: coordinator.clone(),
        rooms,
        ledger,
    });
    (router, coordinator, locks)
}

async fn request_json(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn book_body() -> Value {
    json!({
        "resource_id": "D1",
        "date": "2024-05-01",
        "time": "09:00",
        "patient_id": "patient-7",
        "details": { "consent": true }
    })
}

#[tokio::test]
async fn booking_endpoint_statuses() {
    let (router, _, _) = app("statuses.wal");

    let (status, body) = request_json(&router, "POST", "/book", Some(book_body())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body["booking_id"].is_string());

    // Same slot again: conflict
    let mut second = book_body();
    second["patient_id"] = json!("patient-8");
    let (status, _) = request_json(&router, "POST", "/book", Some(second)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Missing consent: rejected and the slot stays free
    let mut invalid = book_body();
    invalid["time"] = json!("10:00");
    invalid["details"] = json!({ "consent": false });
    let (status, _) = request_json(&router, "POST", "/book", Some(invalid)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let (status, body) =
        request_json(&router, "GET", "/slots/D1/2024-05-01/10:00", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "free");
}

#[tokio::test]
async fn cancel_frees_the_slot() {
    let (router, _, _) = app("cancel.wal");

    let (_, body) = request_json(&router, "POST", "/book", Some(book_body())).await;
    let id = body["booking_id"].as_str().unwrap().to_string();

    let (status, body) = request_json(
        &router,
        "PATCH",
        &format!("/book/{id}"),
        Some(json!({ "action": "cancel" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");

    let (_, body) = request_json(&router, "GET", "/slots/D1/2024-05-01/09:00", None).await;
    assert_eq!(body["state"], "free");

    // The slot can be booked again
    let (status, _) = request_json(&router, "POST", "/book", Some(book_body())).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn reschedule_moves_the_booking() {
    let (router, _, _) = app("reschedule.wal");

    let (_, body) = request_json(&router, "POST", "/book", Some(book_body())).await;
    let id = body["booking_id"].as_str().unwrap().to_string();

    let (status, body) = request_json(
        &router,
        "PATCH",
        &format!("/book/{id}"),
        Some(json!({
            "action": "reschedule",
            "resource_id": "D1",
            "date": "2024-05-02",
            "time": "14:00"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(body["booking_id"].as_str().unwrap(), id);

    let (_, body) = request_json(&router, "GET", "/slots/D1/2024-05-01/09:00", None).await;
    assert_eq!(body["state"], "free");
    let (_, body) = request_json(&router, "GET", "/slots/D1/2024-05-02/14:00", None).await;
    assert_eq!(body["state"], "booked");
}

#[tokio::test]
async fn patch_rejects_bad_ids() {
    let (router, _, _) = app("bad_ids.wal");

    let (status, _) = request_json(
        &router,
        "PATCH",
        "/book/not-a-ulid",
        Some(json!({ "action": "cancel" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let unknown = ulid::Ulid::new();
    let (status, _) = request_json(
        &router,
        "PATCH",
        &format!("/book/{unknown}"),
        Some(json!({ "action": "cancel" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn slot_status_reflects_holds() {
    let (router, coordinator, _) = app("status.wal");
    let key = SlotKey::new("D1", "2024-05-01", "09:00");

    let (_, body) = request_json(&router, "GET", "/slots/D1/2024-05-01/09:00", None).await;
    assert_eq!(body["state"], "free");

    coordinator.hold(&key, "patient-7").await.unwrap();
    let (_, body) = request_json(&router, "GET", "/slots/D1/2024-05-01/09:00", None).await;
    assert_eq!(body["state"], "locked");
    assert_eq!(body["holder"], "patient-7");
}

#[tokio::test]
async fn ledger_verify_endpoint_reports_chain_health() {
    let (router, _, _) = app("verify.wal");

    // Empty ledger verifies trivially
    let (status, body) = request_json(&router, "GET", "/ledger/verify", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["entries"], 0);

    request_json(&router, "POST", "/book", Some(book_body())).await;
    let (_, body) = request_json(&router, "GET", "/ledger/verify", None).await;
    assert_eq!(body["valid"], true);
    assert_eq!(body["entries"], 2); // lock-acquired + booking-confirmed
}

#[tokio::test]
async fn contention_end_to_end() {
    let (_, coordinator, locks) = app("contention.wal");
    let key = SlotKey::new("D1", "2024-05-01", "09:00");

    // A holds, B conflicts
    coordinator.hold(&key, "alice").await.unwrap();
    assert!(matches!(
        locks.acquire(&key, "bob", TTL).await,
        Err(LockError::Conflict)
    ));

    // A confirms; the slot is permanently taken
    coordinator
        .confirm_booking(
            &key,
            "alice",
            "alice",
            slotlock::coordinator::BookingDetails {
                consent: true,
                notes: None,
            },
        )
        .await
        .unwrap();
    assert!(matches!(
        locks.acquire(&key, "bob", TTL).await,
        Err(LockError::Conflict)
    ));
    assert_eq!(
        locks.status(&key).await.unwrap(),
        SlotStatus::Booked {
            holder: "alice".into()
        }
    );
}

#[tokio::test]
async fn abandoned_hold_frees_up_for_the_next_patient() {
    let locks = Arc::new(LockManager::new(Arc::new(MemoryStore::new())));
    let ledger = Arc::new(Ledger::open(&ledger_path("abandoned.wal"), GENESIS).unwrap());
    let rooms = Arc::new(RoomHub::new());
    let coordinator = BookingCoordinator::new(
        locks.clone(),
        ledger,
        rooms,
        Arc::new(MemoryPersistence::new()),
        Arc::new(LogNotifier),
        Duration::from_millis(40),
        Duration::from_millis(40),
    );
    let key = SlotKey::new("D1", "2024-05-01", "09:00");

    coordinator.hold(&key, "alice").await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    // Alice never confirmed; the TTL reclaimed the slot for Bob
    locks.acquire(&key, "bob", TTL).await.unwrap();
    locks.confirm(&key, "bob").await.unwrap();
    assert_eq!(
        locks.status(&key).await.unwrap(),
        SlotStatus::Booked {
            holder: "bob".into()
        }
    );
}
