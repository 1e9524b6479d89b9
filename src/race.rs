//! Races a set of requests and yields the first usable reply.

use std::future::Future;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};

/// Drives all `attempts` concurrently, resolving to the first that yields a
/// value, or to `None` once `timeout` elapses or every attempt has come back
/// empty.
///
/// Individual failures are represented by attempts resolving to `None`, so a
/// single broken socket never ends the race early. Pending attempts (and any
/// sockets they own) are dropped as soon as the race resolves.
pub(crate) async fn race<T, F>(attempts: impl IntoIterator<Item = F>, timeout: Duration) -> Option<T>
where
    F: Future<Output = Option<T>>,
{
    let mut pending: FuturesUnordered<F> = attempts.into_iter().collect();
    if pending.is_empty() {
        return None;
    }

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => return None,
            resolved = pending.next() => match resolved {
                Some(Some(value)) => return Some(value),
                Some(None) => continue,
                None => return None,
            },
        }
    }
}
