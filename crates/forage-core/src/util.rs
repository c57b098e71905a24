use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// Sleep for `duration`, returning early with a `CANCELLED` error if the
/// token fires first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<(), AppError> {
    if duration.is_zero() {
        return if cancel.is_cancelled() {
            Err(AppError::cancelled())
        } else {
            Ok(())
        };
    }

    tokio::select! {
        () = tokio::time::sleep(duration) => Ok(()),
        () = cancel.cancelled() => Err(AppError::cancelled()),
    }
}

/// Convert fractional milliseconds to a [`Duration`] rounded to the nearest
/// microsecond. Negative and non-finite values become zero.
pub fn duration_from_millis_f64(millis: f64) -> Duration {
    if millis.is_finite() && millis > 0.0 {
        Duration::from_micros((millis * 1000.0).round() as u64)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes() {
        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();
        sleep_or_cancel(Duration::from_millis(250), &cancel)
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_sleep_aborts_on_cancel() {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let handle =
            tokio::spawn(async move { sleep_or_cancel(Duration::from_secs(3600), &child).await });
        cancel.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.code, "CANCELLED");
    }

    #[tokio::test]
    async fn test_zero_sleep_respects_cancellation() {
        let cancel = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::ZERO, &cancel).await.is_ok());
        cancel.cancel();
        assert!(sleep_or_cancel(Duration::ZERO, &cancel).await.is_err());
    }

    #[test]
    fn test_duration_from_millis() {
        assert_eq!(duration_from_millis_f64(1500.0), Duration::from_millis(1500));
        assert_eq!(duration_from_millis_f64(0.9 * 1000.0), Duration::from_millis(900));
        assert_eq!(duration_from_millis_f64(-3.0), Duration::ZERO);
        assert_eq!(duration_from_millis_f64(f64::NAN), Duration::ZERO);
    }
}
