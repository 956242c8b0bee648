mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use petsit_sync::models::NotificationKind;
use petsit_sync::{Diagnostic, Error, NotificationService};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

async fn listing() -> Json<Value> {
    Json(json!({
        "success": true,
        "notifications": [
            {
                "id": 11, "type": "booking_confirmed", "title": "Booking Confirmed",
                "message": "Your booking has been confirmed by the pet sitter!",
                "read_at": null, "created_at": "2025-03-01 10:00:00", "data": {"booking_id": 4}
            },
            {
                "id": 12, "type": "new_review", "title": "New Review Received",
                "message": "You received a new review!",
                "read_at": "2025-03-01 11:30:00", "created_at": "2025-03-01 11:00:00", "data": null
            },
            {"type": "system", "message": "row without id"}
        ],
        "unread_count": 1
    }))
}

async fn mark_read(Path(id): Path<String>) -> (StatusCode, Json<Value>) {
    if id == "11" {
        (StatusCode::OK, Json(json!({"success": true, "message": "Notification marked as read"})))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "message": "Notification not found"})),
        )
    }
}

async fn read_all(State(calls): State<Arc<AtomicUsize>>) -> Json<Value> {
    calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({"success": true, "message": "All notifications marked as read"}))
}

fn router(read_all_calls: Arc<AtomicUsize>) -> Router {
    Router::new()
        .route("/api/notifications", get(listing))
        .route("/api/notifications/{id}/read", post(mark_read))
        .route("/api/notifications/read-all", post(read_all))
        .with_state(read_all_calls)
}

#[tokio::test]
async fn refresh_merges_listing_and_reports_invalid_rows() {
    let base = common::serve(router(Arc::default())).await;
    let ctx = common::context(&base, "7");
    let mut diagnostics = ctx.engine().subscribe_diagnostics();
    let service = NotificationService::new(ctx);

    let report = service.refresh().await.unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(report.invalid, 1);
    assert!(matches!(
        diagnostics.try_recv().unwrap(),
        Diagnostic::InvalidRecord { .. }
    ));

    let list = service.list().unwrap();
    let ids: Vec<&str> = list.iter().map(|entry| entry.id.as_str()).collect();
    assert_eq!(ids, vec!["12", "11"]);
    assert_eq!(list[0].item.kind, NotificationKind::Review);
    assert!(list[0].item.read);
    assert_eq!(service.unread_count().unwrap(), 1);

    // A second refresh changes nothing.
    let again = service.refresh().await.unwrap();
    assert_eq!(again.accepted(), 0);
    assert_eq!(again.duplicate, 2);
}

#[tokio::test]
async fn mark_read_confirms_or_reverts() {
    let base = common::serve(router(Arc::default())).await;
    let service = NotificationService::new(common::context(&base, "7"));
    service.refresh().await.unwrap();

    service.mark_read("11").await.unwrap();
    assert_eq!(service.unread_count().unwrap(), 0);

    // Local state newer than the server listing survives a refresh.
    service.refresh().await.unwrap();
    assert_eq!(service.unread_count().unwrap(), 0);
}

#[tokio::test]
async fn rejected_mark_read_restores_unread_state() {
    let base = common::serve(router(Arc::default())).await;
    let ctx = common::context(&base, "7");
    let service = NotificationService::new(ctx.clone());
    let record = petsit_sync::Record::remote(
        "99",
        "7",
        json!({"kind": "system", "event": "system", "title": "Hello", "message": "Welcome"}),
        10,
    );
    ctx.engine()
        .reconcile(petsit_sync::Collection::Notifications, record)
        .unwrap();

    let changes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&changes);
    let _handle = service.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let error = service.mark_read("99").await.unwrap_err();
    assert!(matches!(error, Error::Rejected { status: Some(404), .. }));
    assert_eq!(service.unread_count().unwrap(), 1);
    // Optimistic write and its revert.
    assert_eq!(changes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn mark_all_read_posts_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let base = common::serve(router(Arc::clone(&calls))).await;
    let service = NotificationService::new(common::context(&base, "7"));
    service.refresh().await.unwrap();

    assert_eq!(service.mark_all_read().await.unwrap(), 1);
    assert_eq!(service.unread_count().unwrap(), 0);
    assert_eq!(service.mark_all_read().await.unwrap(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
