//! Payout backends.

use futures_util::FutureExt;
use futures_util::future::ready;
use tracing::info;
use uuid::Uuid;

use super::{from_wei, LedgerFuture, Payout, TxHandle};

/// Payout that only records the intent in the log.
#[derive(Debug, Clone, Default)]
pub struct LoggingPayout;

impl Payout for LoggingPayout {
    fn pay_player(&self, address: &str, amount_wei: u128) -> LedgerFuture<TxHandle> {
        let handle: TxHandle = format!("log-{}", Uuid::new_v4());
        info!(
            address,
            amount_wei = %amount_wei,
            amount = from_wei(amount_wei),
            tx = %handle,
            "Payout recorded"
        );
        ready(Ok(handle)).boxed()
    }
}
