use futures::StreamExt;
use std::future::Future;

use super::events::Feed;
use super::retry::RetryPolicy;
use crate::entities::{Change, ChangeStream};
use crate::error::{subscription_error, timeout_error, Error};

/// Keeps a change feed subscribed, passing every change to `handle`.
///
/// A dropped or failed subscription is retried with the policy's backoff.
/// The failure count starts over whenever a subscription delivered at least
/// one change, so only consecutive dead subscriptions exhaust the policy.
/// Undecodable changes are skipped without counting as a failure.
#[tracing::instrument(skip(policy, subscribe, handle))]
pub async fn supervise<T, S, Fut, H>(
    feed: Feed,
    policy: &RetryPolicy,
    mut subscribe: S,
    mut handle: H,
) -> Result<(), Error>
where
    S: FnMut() -> Fut,
    Fut: Future<Output = Result<ChangeStream<T>, Error>>,
    H: FnMut(Change<T>),
{
    let mut failures = 0u32;

    loop {
        let subscribed = tokio::time::timeout(policy.timeout, subscribe())
            .await
            .unwrap_or_else(|_| Err(timeout_error()));

        match subscribed {
            Ok(mut stream) => {
                tracing::info!(%feed, "subscribed");

                let mut delivered = false;

                while let Some(item) = stream.next().await {
                    match item {
                        Ok(change) => {
                            delivered = true;
                            handle(change);
                        }
                        Err(err) if err.is_decode_error() => {
                            tracing::warn!(%feed, "skipping change: {}", err);
                        }
                        Err(err) => {
                            tracing::warn!(%feed, "feed broke: {}", err);
                            break;
                        }
                    }
                }

                if delivered {
                    failures = 0;
                }
            }
            Err(err) => tracing::warn!(%feed, "subscribe failed: {}", err),
        }

        failures += 1;

        if failures >= policy.max_attempts {
            tracing::error!(%feed, failures, "giving up on feed");
            return Err(subscription_error());
        }

        let delay = policy.backoff(failures);
        tracing::info!(%feed, failures, ?delay, "resubscribing");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::retry::Growth;
    use crate::error::{decode_error, upstream_error};
    use futures::stream;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(25),
            timeout: Duration::from_secs(8),
            growth: Growth::Linear,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let started = Instant::now();

        let result = supervise(
            Feed::Offers,
            &policy(),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<ChangeStream<i64>, _>(upstream_error())
            },
            |_| {},
        )
        .await;

        assert_eq!(result, Err(subscription_error()));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // 5 + 10 + 15 + 20 seconds of backoff
        assert!(started.elapsed() >= Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_resets_the_failure_count() {
        let calls = &AtomicU32::new(0);
        let mut seen = Vec::new();

        let result = supervise(
            Feed::CounterOffers,
            &policy(),
            move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 2 {
                    let items: Vec<Result<Change<i64>, Error>> = vec![
                        Ok(Change::Insert { record: 1 }),
                        Err(decode_error("garbled")),
                        Ok(Change::Delete { old_record: 1 }),
                    ];
                    Ok::<ChangeStream<i64>, Error>(stream::iter(items).boxed())
                } else {
                    Err(upstream_error())
                }
            },
            |change| seen.push(change),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(
            seen,
            vec![
                Change::Insert { record: 1 },
                Change::Delete { old_record: 1 }
            ]
        );
        // two failures, a stream that delivers then ends, four more failures
        assert_eq!(calls.load(Ordering::SeqCst), 7);
    }
}
