//! correlates outstanding queries with inbound responses by transaction id

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use derive_more::{Display, Error, From};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

use crate::dns::protocol::DnsPacket;

#[derive(Debug, Display, From, Error)]
pub enum QueryError {
    Protocol(crate::dns::protocol::ProtocolError),
    Io(std::io::Error),
    TimedOut,
    Cancelled,
    #[display(fmt = "no pending query with id {}", _0)]
    UnknownQuery(#[error(not(source))] u16),
    ChannelClosed,
}

type Result<T> = std::result::Result<T, QueryError>;

/// Default time an outstanding query may wait for its first response
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Returned by a response callback to decide whether the query stays
/// registered for further responses (mDNS) or is done after this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackSignal {
    Continue,
    Done,
}

/// Future returned by a response callback, resolving to the signal that
/// decides the entry's fate.
pub type CallbackFuture = Pin<Box<dyn Future<Output = CallbackSignal> + Send>>;

/// Callback invoked on the driver task for every response matching a
/// query's transaction id. The returned future is awaited on the driver
/// before further datagrams are processed, so callbacks may suspend;
/// data they need from the response has to be cloned out before the
/// future is built.
pub type ResponseCallback = Box<dyn FnMut(&DnsPacket) -> CallbackFuture + Send>;

/// The default unicast callback: finish after the first response.
pub fn oneshot_callback() -> ResponseCallback {
    Box::new(|_| Box::pin(async { CallbackSignal::Done }))
}

/// Receiving side of a query's one-shot completion handle. It resolves
/// with the first matching response, or with the timeout, cancellation or
/// channel failure that ended the query.
pub type QueryHandle = oneshot::Receiver<Result<DnsPacket>>;

/// A query in progress: the originating packet, the one-shot completion
/// handle, the streaming callback and the timeout deadline.
struct SentQuery {
    packet: DnsPacket,
    handle: Option<oneshot::Sender<Result<DnsPacket>>>,
    callback: ResponseCallback,
    deadline: Instant,
}

/// Table of outstanding queries keyed by transaction id.
///
/// The registry is owned exclusively by one channel's driver task; callers
/// never touch it directly, they post commands to the driver instead, so
/// no locking is involved. Each entry's handle resolves exactly once: with
/// the first matching response, or with the timeout/cancel/channel error
/// that evicted it.
pub struct QueryRegistry {
    next_id: u16,
    pending: HashMap<u16, SentQuery>,
    timeout: Duration,
}

impl QueryRegistry {
    pub fn new(timeout: Duration) -> QueryRegistry {
        QueryRegistry {
            next_id: 0,
            pending: HashMap::new(),
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Allocate the next free transaction id, assign it into the packet
    /// header and store the entry. The id counter increments monotonically
    /// and wraps, skipping ids still in flight.
    pub fn register(
        &mut self,
        packet: &mut DnsPacket,
        callback: ResponseCallback,
        handle: oneshot::Sender<Result<DnsPacket>>,
    ) -> u16 {
        let id = loop {
            let candidate = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.pending.contains_key(&candidate) {
                break candidate;
            }
        };

        packet.header.id = id;
        self.pending.insert(
            id,
            SentQuery {
                packet: packet.clone(),
                handle: Some(handle),
                callback,
                deadline: Instant::now() + self.timeout,
            },
        );

        id
    }

    /// Deliver an inbound response to the matching entry.
    ///
    /// The first response resolves the one-shot handle; every response is
    /// handed to the callback and the returned future awaited, the one
    /// suspension point here (the table lookup itself never suspends).
    /// The resulting signal decides whether the entry survives for more
    /// (mDNS) responses.
    pub async fn dispatch(&mut self, response: DnsPacket) -> Result<()> {
        let id = response.header.id;

        let pending_signal = match self.pending.get_mut(&id) {
            Some(query) => {
                if let Some(tx) = query.handle.take() {
                    let _ = tx.send(Ok(response.clone()));
                }
                (query.callback)(&response)
            }
            None => return Err(QueryError::UnknownQuery(id)),
        };

        match pending_signal.await {
            CallbackSignal::Done => {
                self.pending.remove(&id);
            }
            CallbackSignal::Continue => {}
        }

        Ok(())
    }

    /// Fail and evict every entry whose deadline has passed. Returns the
    /// number of entries expired; firing with nothing due is a no-op.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, query)| query.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(mut query) = self.pending.remove(id) {
                log::debug!(
                    "query {} for {:?} timed out",
                    id,
                    query.packet.questions.first().map(|q| q.name.as_str())
                );
                if let Some(tx) = query.handle.take() {
                    let _ = tx.send(Err(QueryError::TimedOut));
                }
            }
        }

        expired.len()
    }

    /// Remove a single entry, failing its handle. Used when writing the
    /// encoded query to the transport fails after registration.
    pub fn fail(&mut self, id: u16, err: QueryError) {
        if let Some(mut query) = self.pending.remove(&id) {
            if let Some(tx) = query.handle.take() {
                let _ = tx.send(Err(err));
            }
        }
    }

    /// Drain the table, failing every outstanding handle with the error
    /// produced by `err`. Covers both cancellation and channel failure.
    pub fn fail_all<F>(&mut self, err: F) -> usize
    where
        F: Fn() -> QueryError,
    {
        let count = self.pending.len();
        for (_, mut query) in self.pending.drain() {
            if let Some(tx) = query.handle.take() {
                let _ = tx.send(Err(err()));
            }
        }

        count
    }

    pub fn cancel_all(&mut self) -> usize {
        self.fail_all(|| QueryError::Cancelled)
    }

    #[cfg(test)]
    fn set_next_id(&mut self, id: u16) {
        self.next_id = id;
    }
}
