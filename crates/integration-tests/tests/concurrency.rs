//! Races between approvals and duplicate deliveries.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use serde_json::json;

use kiosk_core::OrderStatus;
use kiosk_integration_tests::{Harness, sign};
use kiosk_server::payments::{WebhookNotification, WebhookOutcome, WebhookQuery};
use kiosk_server::services::OrderError;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_approvals_never_oversell() {
    let h = Arc::new(Harness::new());
    let termo = h.add_product("Termo", 3, 300).await;

    let mut orders = Vec::new();
    for name in ["Kai", "Lia", "Mia", "Noa", "Ona"] {
        let user = h.add_customer(name).await;
        orders.push(h.place_order(user, termo, 1).await.id);
    }

    let handles: Vec<_> = orders
        .iter()
        .enumerate()
        .map(|(i, &order_id)| {
            let h = Arc::clone(&h);
            tokio::spawn(async move {
                h.engine
                    .confirm_payment(order_id, &format!("pay-{i}"))
                    .await
            })
        })
        .collect();

    let mut confirmed = 0;
    let mut short = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(order) => {
                assert_eq!(order.status, OrderStatus::Confirmed);
                confirmed += 1;
            }
            Err(OrderError::InsufficientStock { .. }) => short += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(confirmed, 3);
    assert_eq!(short, 2);
    assert_eq!(h.stock(termo).await, 0);
    for order_id in orders {
        let order = h.order(order_id).await;
        assert!(matches!(
            order.status,
            OrderStatus::Confirmed | OrderStatus::Pending
        ));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_deliveries_decrement_once() {
    let h = Arc::new(Harness::new());
    let user = h.add_customer("Pia").await;
    let mate = h.add_product("Mate", 10, 100).await;
    let order = h.place_order(user, mate, 4).await;
    h.gateway.set_payment("4242", "approved", Some(order.id));

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let h = Arc::clone(&h);
            tokio::spawn(async move {
                let request_id = format!("req-{i}");
                let body = json!({ "type": "payment", "data": { "id": "4242" } });
                let notification = WebhookNotification::new(
                    WebhookQuery::default(),
                    body.to_string().as_bytes(),
                    Some(sign("4242", &request_id, "1767225600")),
                    Some(request_id),
                );
                h.reconciler.handle(&notification).await
            })
        })
        .collect();

    let mut applied = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            WebhookOutcome::Applied { .. } => applied += 1,
            WebhookOutcome::Skipped { .. } => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(h.stock(mate).await, 6);
    assert_eq!(h.order(order.id).await.status, OrderStatus::Confirmed);
}
