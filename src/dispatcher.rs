//! Per-tick event pump.
//!
//! Every live connection is drained by exactly one dispatch unit. Batches of
//! slots are queued on a channel and pulled by a bounded set of scoped
//! worker threads, all joined before [`EventDispatcher::dispatch`] returns.

use crate::connection_table::{ConnectionHandle, Snapshot};
use crate::network::{ConnectionId, NetEvent, Transport};
use bytes::Bytes;
use std::iter::Sum;
use std::ops::AddAssign;
use std::thread;
use tracing::{debug, info, trace, warn};

/// Application callback for decoded traffic
///
/// Called concurrently for different connections, never concurrently for
/// the same one.
pub trait Handler: Send + Sync {
    /// Handle one `Data` payload. Errors are logged and isolated to `conn`.
    fn handle(&self, conn: ConnectionId, payload: Bytes) -> anyhow::Result<()>;

    fn on_connect(&self, _conn: ConnectionId) {}

    fn on_disconnect(&self, _conn: ConnectionId) {}
}

impl<F> Handler for F
where
    F: Fn(ConnectionId, Bytes) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, conn: ConnectionId, payload: Bytes) -> anyhow::Result<()> {
        self(conn, payload)
    }
}

/// Counters for one dispatch pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    /// Events popped from the transport
    pub events: usize,
    /// Payloads forwarded to the handler
    pub payloads: usize,
    /// Payloads dropped because they followed a disconnect
    pub discarded: usize,
    pub disconnects: usize,
    pub handler_errors: usize,
    /// Handles already invalid when their drain started
    pub skipped_invalid: usize,
}

impl AddAssign for DispatchStats {
    fn add_assign(&mut self, other: Self) {
        self.events += other.events;
        self.payloads += other.payloads;
        self.discarded += other.discarded;
        self.disconnects += other.disconnects;
        self.handler_errors += other.handler_errors;
        self.skipped_invalid += other.skipped_invalid;
    }
}

impl Sum for DispatchStats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |mut acc, s| {
            acc += s;
            acc
        })
    }
}

#[derive(Debug, Clone)]
pub struct EventDispatcher {
    workers: usize,
    batch_size: usize,
    max_events: Option<usize>,
}

impl EventDispatcher {
    pub fn new(workers: usize, batch_size: usize) -> Self {
        Self {
            workers: workers.max(1),
            batch_size: batch_size.max(1),
            max_events: None,
        }
    }

    /// Stop draining a connection after `limit` events in one tick
    pub fn with_max_events(mut self, limit: Option<usize>) -> Self {
        self.max_events = limit.filter(|&n| n > 0);
        self
    }

    /// Drain every connection in `snapshot`. Returns once all units finished.
    pub fn dispatch<T, H>(
        &self,
        snapshot: Snapshot<'_>,
        transport: &T,
        handler: &H,
    ) -> DispatchStats
    where
        T: Transport,
        H: Handler,
    {
        if snapshot.is_empty() {
            return DispatchStats::default();
        }

        let workers = self
            .workers
            .min(snapshot.len().div_ceil(self.batch_size));

        if workers <= 1 {
            return snapshot
                .into_slots()
                .map(|slot| self.drain(slot, transport, handler))
                .sum::<DispatchStats>();
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        for batch in snapshot.into_batches(self.batch_size) {
            // Receiver is alive in this scope
            let _ = tx.send(batch);
        }
        drop(tx);

        thread::scope(|scope| {
            let units: Vec<_> = (0..workers)
                .map(|_| {
                    let rx = rx.clone();
                    scope.spawn(move || {
                        let mut stats = DispatchStats::default();
                        for batch in rx.iter() {
                            for slot in batch.iter_mut() {
                                stats += self.drain(slot, transport, handler);
                            }
                        }
                        stats
                    })
                })
                .collect();

            units
                .into_iter()
                .map(|unit| {
                    unit.join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                })
                .sum::<DispatchStats>()
        })
    }

    /// One dispatch unit: drain `slot`'s backlog in delivery order
    fn drain<T, H>(
        &self,
        slot: &mut ConnectionHandle,
        transport: &T,
        handler: &H,
    ) -> DispatchStats
    where
        T: Transport,
        H: Handler,
    {
        let mut stats = DispatchStats::default();
        let conn = slot.id();

        if !slot.is_valid() {
            debug_assert!(false, "dispatch reached invalid connection {conn}");
            warn!(connection = %conn, "Skipping invalid connection during dispatch");
            stats.skipped_invalid += 1;
            return stats;
        }

        while let Some(event) = transport.poll_event(conn) {
            stats.events += 1;

            match event {
                NetEvent::Data(payload) if slot.is_valid() => {
                    stats.payloads += 1;
                    if let Err(e) = handler.handle(conn, payload) {
                        stats.handler_errors += 1;
                        warn!(connection = %conn, "Handler error: {:#}", e);
                    }
                }
                NetEvent::Data(payload) => {
                    stats.discarded += 1;
                    trace!(
                        connection = %conn,
                        len = payload.len(),
                        "Discarding data after disconnect"
                    );
                }
                NetEvent::Disconnect => {
                    if slot.invalidate() {
                        stats.disconnects += 1;
                        info!(connection = %conn, "Client disconnected from server");
                        handler.on_disconnect(conn);
                    }
                }
            }

            if self.max_events.is_some_and(|limit| stats.events >= limit) {
                debug!(
                    connection = %conn,
                    events = stats.events,
                    "Drain limit reached, deferring rest"
                );
                break;
            }
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_table::ConnectionTable;
    use crate::network::MemoryTransport;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        payloads: Mutex<Vec<(ConnectionId, Bytes)>>,
        disconnects: Mutex<Vec<ConnectionId>>,
    }

    impl Handler for Recorder {
        fn handle(&self, conn: ConnectionId, payload: Bytes) -> anyhow::Result<()> {
            if payload.as_ref() == b"bad" {
                anyhow::bail!("undecodable payload");
            }
            self.payloads.lock().push((conn, payload));
            Ok(())
        }

        fn on_disconnect(&self, conn: ConnectionId) {
            self.disconnects.lock().push(conn);
        }
    }

    fn setup(ids: &[u64]) -> (ConnectionTable, MemoryTransport) {
        let transport = MemoryTransport::new();
        let mut table = ConnectionTable::new();
        for &id in ids {
            table
                .add(ConnectionHandle::new(ConnectionId(id)))
                .expect("unique ids");
        }
        (table, transport)
    }

    #[test]
    fn drains_whole_burst_in_order() {
        let (mut table, transport) = setup(&[1]);
        let handle = transport.handle();
        for i in 0..50u8 {
            handle.push_data(ConnectionId(1), vec![i]);
        }

        let recorder = Recorder::default();
        let stats = EventDispatcher::new(1, 1).dispatch(table.snapshot(), &transport, &recorder);

        assert_eq!(stats.payloads, 50);
        let seen: Vec<u8> = recorder.payloads.lock().iter().map(|(_, p)| p[0]).collect();
        assert_eq!(seen, (0..50).collect::<Vec<u8>>());
        assert_eq!(handle.pending_events(ConnectionId(1)), 0);
    }

    #[test]
    fn data_after_disconnect_is_drained_but_not_forwarded() {
        let (mut table, transport) = setup(&[1]);
        let handle = transport.handle();
        handle.push_data(ConnectionId(1), b"first".to_vec());
        handle.push_disconnect(ConnectionId(1));
        handle.push_data(ConnectionId(1), b"garbage".to_vec());
        handle.push_disconnect(ConnectionId(1));

        let recorder = Recorder::default();
        let stats = EventDispatcher::new(1, 1).dispatch(table.snapshot(), &transport, &recorder);

        assert_eq!(stats.events, 4);
        assert_eq!(stats.payloads, 1);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.disconnects, 1);
        assert_eq!(recorder.disconnects.lock().len(), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.valid_count(), 0);
        assert_eq!(handle.pending_events(ConnectionId(1)), 0);
    }

    #[test]
    fn handler_error_is_isolated_to_its_event() {
        let (mut table, transport) = setup(&[1, 2]);
        let handle = transport.handle();
        handle.push_data(ConnectionId(1), b"bad".to_vec());
        handle.push_data(ConnectionId(1), b"ok".to_vec());
        handle.push_data(ConnectionId(2), b"ok".to_vec());

        let recorder = Recorder::default();
        let stats = EventDispatcher::new(2, 1).dispatch(table.snapshot(), &transport, &recorder);

        assert_eq!(stats.handler_errors, 1);
        assert_eq!(recorder.payloads.lock().len(), 2);
    }

    #[test]
    fn parallel_dispatch_reaches_every_connection() {
        let ids: Vec<u64> = (1..=40).collect();
        let (mut table, transport) = setup(&ids);
        let handle = transport.handle();
        for &id in &ids {
            for n in 0..5u8 {
                handle.push_data(ConnectionId(id), vec![n]);
            }
            if id % 4 == 0 {
                handle.push_disconnect(ConnectionId(id));
            }
        }

        let recorder = Recorder::default();
        let stats = EventDispatcher::new(4, 3).dispatch(table.snapshot(), &transport, &recorder);

        assert_eq!(stats.payloads, 200);
        assert_eq!(stats.disconnects, 10);
        assert_eq!(table.valid_count(), 30);

        // Per-connection order survives parallelism
        let payloads = recorder.payloads.lock();
        for &id in &ids {
            let seen: Vec<u8> = payloads
                .iter()
                .filter(|(c, _)| *c == ConnectionId(id))
                .map(|(_, p)| p[0])
                .collect();
            assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        }
    }

    #[test]
    fn drain_limit_defers_remaining_events() {
        let (mut table, transport) = setup(&[1]);
        let handle = transport.handle();
        for i in 0..10u8 {
            handle.push_data(ConnectionId(1), vec![i]);
        }

        let dispatcher = EventDispatcher::new(1, 1).with_max_events(Some(4));
        let recorder = Recorder::default();
        let stats = dispatcher.dispatch(table.snapshot(), &transport, &recorder);

        assert_eq!(stats.payloads, 4);
        assert_eq!(handle.pending_events(ConnectionId(1)), 6);
    }

    #[test]
    fn closure_handlers_are_accepted() {
        let (mut table, transport) = setup(&[3]);
        transport.handle().push_data(ConnectionId(3), b"hi".to_vec());

        let count = Mutex::new(0);
        let handler = |_conn: ConnectionId, _payload: Bytes| -> anyhow::Result<()> {
            *count.lock() += 1;
            Ok(())
        };
        EventDispatcher::new(1, 1).dispatch(table.snapshot(), &transport, &handler);

        assert_eq!(*count.lock(), 1);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "invalid connection"))]
    fn invalid_handle_at_drain_start_is_an_invariant_violation() {
        let (mut table, transport) = setup(&[1]);
        table.invalidate(0);

        let recorder = Recorder::default();
        let stats = EventDispatcher::new(1, 1).dispatch(table.snapshot(), &transport, &recorder);
        assert_eq!(stats.skipped_invalid, 1);
    }
}
