use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use crate::entities::{diff, ChangeStream};
use crate::error::{timeout_error, Error};

const BUFFER: usize = 256;

/// Builds a change feed out of repeated snapshots. The first snapshot is the
/// baseline and produces no changes; each later one is diffed against its
/// predecessor. A failed or timed-out fetch is passed on and ends the feed.
pub async fn poll<T, K, F, Fut, Key>(
    mut fetch: F,
    key: Key,
    interval: Duration,
    timeout: Duration,
) -> Result<ChangeStream<T>, Error>
where
    T: Clone + PartialEq + Send + 'static,
    K: Eq + Hash + Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<T>, Error>> + Send + 'static,
    Key: Fn(&T) -> K + Send + 'static,
{
    let baseline = bounded(fetch(), timeout).await?;
    let mut previous: HashMap<K, T> = baseline.into_iter().map(|row| (key(&row), row)).collect();

    let (sender, receiver) = async_channel::bounded(BUFFER);

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            if sender.is_closed() {
                tracing::debug!("feed receiver dropped, polling stopped");
                return;
            }

            match bounded(fetch(), timeout).await {
                Ok(rows) => {
                    let changes = diff(&previous, &rows, &key);
                    previous = rows.into_iter().map(|row| (key(&row), row)).collect();

                    for change in changes {
                        if sender.send(Ok(change)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!("poll failed: {}", err);
                    let _ = sender.send(Err(err)).await;
                    return;
                }
            }
        }
    });

    Ok(Box::pin(receiver))
}

async fn bounded<T, Fut>(fetch: Fut, timeout: Duration) -> Result<T, Error>
where
    Fut: Future<Output = Result<T, Error>>,
{
    tokio::time::timeout(timeout, fetch)
        .await
        .unwrap_or_else(|_| Err(timeout_error()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Change;
    use crate::error::upstream_error;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Debug, PartialEq)]
    struct Row {
        id: i64,
        status: &'static str,
    }

    fn row(id: i64, status: &'static str) -> Row {
        Row { id, status }
    }

    type Table = Arc<Mutex<Result<Vec<Row>, Error>>>;

    async fn feed(table: &Table, calls: &Arc<AtomicU32>) -> ChangeStream<Row> {
        let table = table.clone();
        let calls = calls.clone();

        poll(
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                let rows = table.lock().unwrap().clone();
                async move { rows }
            },
            |row: &Row| row.id,
            Duration::from_secs(2),
            Duration::from_secs(8),
        )
        .await
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn snapshots_become_changes() {
        let table: Table = Arc::new(Mutex::new(Ok(vec![row(1, "pending")])));
        let calls = Arc::new(AtomicU32::new(0));
        let mut changes = feed(&table, &calls).await;

        *table.lock().unwrap() = Ok(vec![row(1, "accepted"), row(2, "pending")]);

        assert_eq!(
            changes.next().await.unwrap(),
            Ok(Change::Update {
                old_record: Some(row(1, "pending")),
                record: row(1, "accepted"),
            })
        );
        assert_eq!(
            changes.next().await.unwrap(),
            Ok(Change::Insert {
                record: row(2, "pending")
            })
        );

        *table.lock().unwrap() = Ok(vec![row(2, "pending")]);

        assert_eq!(
            changes.next().await.unwrap(),
            Ok(Change::Delete {
                old_record: row(1, "accepted")
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_ends_the_feed() {
        let table: Table = Arc::new(Mutex::new(Ok(vec![])));
        let calls = Arc::new(AtomicU32::new(0));
        let mut changes = feed(&table, &calls).await;

        *table.lock().unwrap() = Err(upstream_error());

        assert_eq!(changes.next().await, Some(Err(upstream_error())));
        assert_eq!(changes.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_fetch_times_out_and_ends_the_feed() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut changes = poll(
            move || {
                let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
                async move {
                    if !first {
                        std::future::pending::<()>().await;
                    }
                    Ok(Vec::<Row>::new())
                }
            },
            |row: &Row| row.id,
            Duration::from_secs(2),
            Duration::from_secs(8),
        )
        .await
        .unwrap();

        assert_eq!(changes.next().await, Some(Err(timeout_error())));
        assert_eq!(changes.next().await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_stream_stops_polling() {
        let table: Table = Arc::new(Mutex::new(Ok(vec![])));
        let calls = Arc::new(AtomicU32::new(0));

        let changes = feed(&table, &calls).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(changes);

        let seen = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(seen, 3);
        assert_eq!(calls.load(Ordering::SeqCst), seen);
    }
}
