//! Expiration of unpaid orders.

#![allow(clippy::unwrap_used)]

use chrono::Duration;

use kiosk_core::{OrderStatus, PaymentStatus};
use kiosk_integration_tests::Harness;
use kiosk_server::sweeper::SweepReport;

#[tokio::test]
async fn test_order_unpaid_for_a_day_is_cancelled() {
    let h = Harness::new();
    let user = h.add_customer("Gabi").await;
    let mate = h.add_product("Mate", 5, 100).await;
    let order = h.place_order(user, mate, 2).await;

    h.clock.advance(Duration::hours(25));
    let report = h.sweeper.sweep().await.unwrap();

    assert_eq!(
        report,
        SweepReport {
            found: 1,
            cancelled: 1,
            failed: 0
        }
    );
    let expired = h.order(order.id).await;
    assert_eq!(expired.status, OrderStatus::Cancelled);
    assert_eq!(expired.payment_status, PaymentStatus::Cancelled);
    assert_eq!(h.stock(mate).await, 5);

    // The user is free to check out again.
    let next = h
        .engine
        .create_from_cart(user, Default::default())
        .await
        .unwrap();
    assert_eq!(next.status, OrderStatus::Pending);
}

#[tokio::test]
async fn test_order_inside_the_window_is_kept() {
    let h = Harness::new();
    let user = h.add_customer("Hugo").await;
    let mate = h.add_product("Mate", 5, 100).await;
    let order = h.place_order(user, mate, 1).await;

    h.clock.advance(Duration::hours(23));
    let report = h.sweeper.sweep().await.unwrap();

    assert_eq!(report, SweepReport::default());
    assert_eq!(h.order(order.id).await.status, OrderStatus::Pending);
}

#[tokio::test]
async fn test_paid_orders_never_expire() {
    let h = Harness::new();
    let user = h.add_customer("Ines").await;
    let mate = h.add_product("Mate", 5, 100).await;
    let order = h.place_order(user, mate, 1).await;
    h.engine.confirm_payment(order.id, "31").await.unwrap();

    h.clock.advance(Duration::days(3));
    let report = h.sweeper.sweep().await.unwrap();

    assert_eq!(report.found, 0);
    assert_eq!(h.order(order.id).await.status, OrderStatus::Confirmed);
    assert_eq!(h.stock(mate).await, 4);
}

#[tokio::test]
async fn test_approval_after_expiry_is_acknowledged_without_stock_change() {
    let h = Harness::new();
    let user = h.add_customer("Juan").await;
    let mate = h.add_product("Mate", 5, 100).await;
    let order = h.place_order(user, mate, 1).await;

    h.clock.advance(Duration::hours(25));
    h.sweeper.sweep().await.unwrap();

    h.gateway.set_payment("808", "approved", Some(order.id));
    let outcome = h.reconciler.sync_payment(order.id, "808").await.unwrap();

    assert!(matches!(
        outcome,
        kiosk_server::payments::WebhookOutcome::Skipped { .. }
    ));
    assert_eq!(h.order(order.id).await.status, OrderStatus::Cancelled);
    assert_eq!(h.stock(mate).await, 5);
}
