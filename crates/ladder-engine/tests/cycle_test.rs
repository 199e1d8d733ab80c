//! Controller lifecycle integration tests.

mod common;

use common::RecordingExchange;
use ladder_core::{PositionSide, Position, Price, Size};
use ladder_engine::{CycleConfig, CycleState, TradingCycleController};
use ladder_feed::SharedPrice;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn config() -> CycleConfig {
    CycleConfig {
        symbol: "BTCUSDT".to_string(),
        // Long enough that only the first tick fires during the test
        poll_interval_ms: 60_000,
        query_attempts: 1,
        retry_base_delay_ms: 1,
        order_spacing_ms: 0,
        settle_delay_ms: 0,
        flatten_on_stop: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_stop_is_idempotent_and_flattens_once() {
    let exchange = Arc::new(RecordingExchange::default());
    exchange.positions.lock().push(Position::new(
        PositionSide::Long,
        Size::new(dec!(0.5)),
        Price::new(dec!(100)),
        Decimal::ZERO,
    ));

    let controller =
        TradingCycleController::new(config(), exchange.clone(), SharedPrice::new());
    let handle = controller.handle();
    let task = tokio::spawn(controller.run());

    // Let the first (idle) tick pass, then stop twice in succession.
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.stop();
    handle.stop();

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("controller must stop within the grace period")
        .expect("controller task must not panic");
    assert!(result.is_ok());

    // Exactly one flatten order and one cancel sweep, despite two stops.
    assert_eq!(exchange.create_calls.load(Ordering::SeqCst), 1);
    assert_eq!(exchange.cancel_calls.load(Ordering::SeqCst), 1);
    assert_eq!(handle.state(), CycleState::Idle);
}

#[tokio::test]
async fn test_stop_without_position_only_cancels() {
    let exchange = Arc::new(RecordingExchange::default());

    let controller =
        TradingCycleController::new(config(), exchange.clone(), SharedPrice::new());
    let handle = controller.handle();
    let task = tokio::spawn(controller.run());

    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.stop();

    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("controller must stop")
        .expect("controller task must not panic")
        .unwrap();

    assert_eq!(exchange.create_calls.load(Ordering::SeqCst), 0);
    assert_eq!(exchange.cancel_calls.load(Ordering::SeqCst), 1);
}
