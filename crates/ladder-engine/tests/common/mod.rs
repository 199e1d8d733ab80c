//! Recording exchange stub shared by integration tests.

use ladder_core::{OrderStatus, Position};
use ladder_exchange::{
    AccountInfo, BoxFuture, ExchangeClient, ExchangeError, ExchangeResult, OpenOrder,
    OrderReceipt, OrderSpec, Ticker,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::atomic::AtomicU32;

/// Exchange stub that records order and cancel activity.
#[derive(Default)]
pub struct RecordingExchange {
    pub positions: Mutex<Vec<Position>>,
    pub create_calls: AtomicU32,
    pub cancel_calls: AtomicU32,
}

impl ExchangeClient for RecordingExchange {
    fn get_ticker<'a>(&'a self, _symbol: &'a str) -> BoxFuture<'a, ExchangeResult<Ticker>> {
        Box::pin(async move { Err(ExchangeError::Transport("no ticker".to_string())) })
    }

    fn get_positions<'a>(
        &'a self,
        _symbol: &'a str,
    ) -> BoxFuture<'a, ExchangeResult<Vec<Position>>> {
        Box::pin(async move { Ok(self.positions.lock().clone()) })
    }

    fn create_order<'a>(
        &'a self,
        _spec: &'a OrderSpec,
    ) -> BoxFuture<'a, ExchangeResult<OrderReceipt>> {
        Box::pin(async move {
            self.create_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(OrderReceipt {
                order_id: "1".to_string(),
                client_order_id: None,
                status: OrderStatus::Filled,
            })
        })
    }

    fn get_open_orders<'a>(
        &'a self,
        _symbol: &'a str,
    ) -> BoxFuture<'a, ExchangeResult<Vec<OpenOrder>>> {
        Box::pin(async move { Ok(Vec::new()) })
    }

    fn cancel_all_orders<'a>(&'a self, _symbol: &'a str) -> BoxFuture<'a, ExchangeResult<()>> {
        Box::pin(async move {
            self.cancel_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        })
    }

    fn get_account_info(&self) -> BoxFuture<'_, ExchangeResult<AccountInfo>> {
        Box::pin(async move {
            Ok(AccountInfo {
                total_balance: Decimal::from(1000),
                available_balance: Decimal::from(1000),
            })
        })
    }

    fn set_leverage<'a>(
        &'a self,
        _symbol: &'a str,
        _leverage: u32,
    ) -> BoxFuture<'a, ExchangeResult<()>> {
        Box::pin(async move { Ok(()) })
    }
}
