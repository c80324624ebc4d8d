// Cancellation helpers around tokio-util's CancellationToken.

use crate::error::{ServiceError, ServiceResult};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Fail fast if the token has already fired.
pub fn check(token: &CancellationToken) -> ServiceResult<()> {
    if token.is_cancelled() {
        Err(ServiceError::Cancelled)
    } else {
        Ok(())
    }
}

/// Race `fut` against the token. Cancellation wins ties.
pub async fn run<T, F>(token: &CancellationToken, fut: F) -> ServiceResult<T>
where
    F: Future<Output = ServiceResult<T>>,
{
    check(token)?;
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ServiceError::Cancelled),
        res = fut => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn must_not_be_polled() {
        panic!("future polled after cancellation");
    }

    #[tokio::test]
    async fn run_returns_future_output() {
        let token = CancellationToken::new();
        let v = run(&token, async { Ok::<_, ServiceError>(7) }).await;
        assert_eq!(v.ok(), Some(7));
    }

    #[tokio::test]
    async fn run_aborts_pending_future_on_cancel() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            child.cancel();
        });
        let res = run(&token, std::future::pending::<ServiceResult<()>>()).await;
        assert!(matches!(res, Err(ServiceError::Cancelled)));
    }

    #[tokio::test]
    async fn run_does_not_poll_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let res = run(&token, async {
            must_not_be_polled();
            Ok::<(), ServiceError>(())
        })
        .await;
        assert!(matches!(res, Err(ServiceError::Cancelled)));
    }
}
