use crate::connection_table::{ConnectionHandle, ConnectionTable};
use crate::dispatcher::Handler;
use crate::network::Transport;
use tracing::{error, info};

/// Counters for one reaping pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapStats {
    /// Entries invalidated during the previous dispatch and now dropped
    pub removed: usize,
    pub accepted: usize,
    /// Accepts skipped because the identity was already in the table
    pub duplicates: usize,
}

/// Single-threaded table maintenance run at the start of every tick
///
/// Compacts first, so connections invalidated by the previous tick's
/// dispatch leave the table exactly one tick after their disconnect, then
/// accepts everything the transport has pending.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionReaper;

impl ConnectionReaper {
    pub fn new() -> Self {
        Self
    }

    pub fn reap<T, H>(
        &self,
        table: &mut ConnectionTable,
        transport: &mut T,
        handler: &H,
    ) -> ReapStats
    where
        T: Transport,
        H: Handler,
    {
        let mut stats = ReapStats {
            removed: table.compact(),
            ..Default::default()
        };

        while let Some(conn) = transport.poll_new_connection() {
            match table.add(ConnectionHandle::new(conn)) {
                Ok(()) => {
                    stats.accepted += 1;
                    info!(connection = %conn, "Accepted a connection");
                    handler.on_connect(conn);
                }
                Err(e) => {
                    stats.duplicates += 1;
                    error!(connection = %conn, "Skipping accept: {}", e);
                    debug_assert!(false, "transport accepted {conn} twice");
                }
            }
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ConnectionId, MemoryTransport};
    use bytes::Bytes;

    fn ignore(_: ConnectionId, _: Bytes) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn compacts_before_accepting() {
        let mut transport = MemoryTransport::new();
        let handle = transport.handle();
        let mut table = ConnectionTable::new();
        table
            .add(ConnectionHandle::new(ConnectionId(1)))
            .expect("empty table");
        table.invalidate(0);

        // Identity reuse only works because compaction ran first
        handle.accept(ConnectionId(1));
        handle.accept(ConnectionId(2));

        let stats = ConnectionReaper::new().reap(&mut table, &mut transport, &ignore);

        assert_eq!(stats.removed, 1);
        assert_eq!(stats.accepted, 2);
        assert_eq!(table.valid_count(), 2);
    }

    #[test]
    fn accepts_every_pending_connection() {
        let mut transport = MemoryTransport::new();
        let handle = transport.handle();
        for id in 1..=20 {
            handle.accept(ConnectionId(id));
        }

        let mut table = ConnectionTable::new();
        let stats = ConnectionReaper::new().reap(&mut table, &mut transport, &ignore);

        assert_eq!(stats.accepted, 20);
        assert_eq!(table.len(), 20);
        assert!(transport.poll_new_connection().is_none());
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "twice"))]
    fn duplicate_accept_is_skipped() {
        let mut transport = MemoryTransport::new();
        let handle = transport.handle();
        handle.accept(ConnectionId(5));
        handle.accept(ConnectionId(5));

        let mut table = ConnectionTable::new();
        let stats = ConnectionReaper::new().reap(&mut table, &mut transport, &ignore);

        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(table.len(), 1);
    }
}
