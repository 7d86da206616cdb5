use std::{future::Future, time::Duration};

use crate::error::BridgeError;

/// Wall-clock budget for one blocking host operation, from the guest's `RTR` (units of 100 µs)
/// and `RCR` registers. Zero means "wait forever".
pub(crate) fn retry_timeout(rtr: u16, rcr: u8) -> Option<Duration> {
    let millis = u64::from(rtr) * u64::from(rcr) / 10;
    (millis > 0).then(|| Duration::from_millis(millis))
}

/// Awaits `fut` under a timeout when `dur` is set, mapping expiry to [`BridgeError::Timeout`].
pub(crate) async fn timeout_opt<T, F>(dur: Option<Duration>, fut: F) -> Result<T, BridgeError>
where
    F: Future<Output = Result<T, BridgeError>>,
{
    match dur {
        Some(dur) => tokio::time::timeout(dur, fut).await?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::{retry_timeout, timeout_opt};
    use crate::error::BridgeError;
    use std::time::Duration;

    #[test]
    fn reset_defaults_give_a_1600ms_budget() {
        assert_eq!(retry_timeout(0x07D0, 8), Some(Duration::from_millis(1600)));
        assert_eq!(retry_timeout(0, 8), None);
        assert_eq!(retry_timeout(0x07D0, 0), None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn timeout_opt_times_out_when_enabled() {
        tokio::time::pause();

        let handle = tokio::spawn(timeout_opt(Some(Duration::from_secs(1)), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, BridgeError>(())
        }));

        // Ensure the spawned task is polled at least once so the timers are registered.
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(2)).await;

        let res = handle.await.unwrap();
        assert!(matches!(res, Err(BridgeError::Timeout)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn timeout_opt_passes_inner_errors_through() {
        let res = timeout_opt(None, async { Err::<(), _>(BridgeError::NotConnected) }).await;
        assert!(matches!(res, Err(BridgeError::NotConnected)));
    }
}
