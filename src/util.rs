use anyhow::anyhow;
use sentry_core::protocol::SpanStatus;
use sentry_core::{TransactionContext, start_transaction};
use std::any::Any;
use std::future::Future;

/// Runs the callback's future inside a Sentry performance transaction.
pub(crate) async fn with_sentry_transaction<F, R, E>(
    transaction_name: &str,
    callback: impl FnOnce() -> F,
) -> Result<R, E>
where
    F: Future<Output = Result<R, E>>,
{
    let tx_ctx = TransactionContext::new(transaction_name, "queue.process");
    let tx = start_transaction(tx_ctx);

    let result = callback().await;

    tx.set_status(match result.is_ok() {
        true => SpanStatus::Ok,
        false => SpanStatus::UnknownError,
    });
    tx.finish();

    result
}

/// Turns opaque panic payloads into a readable error.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(x) = info.downcast_ref::<&'static str>() {
        anyhow!("job panicked: {x}")
    } else if let Some(x) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {x}")
    } else {
        anyhow!("job panicked")
    }
}
