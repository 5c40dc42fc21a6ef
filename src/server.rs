use crate::connection_table::ConnectionTable;
use crate::dispatcher::{DispatchStats, EventDispatcher, Handler};
use crate::error::{Error, Result};
use crate::network::{ConnectionId, Transport};
use crate::reaper::{ConnectionReaper, ReapStats};
use crate::Config;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, trace};

/// Lifecycle of a [`ServerLoop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Constructed, not yet bound
    Idle,
    /// Bound and listening; `tick` is allowed
    Running,
    /// Resources released; terminal
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Idle => "idle",
            LoopState::Running => "running",
            LoopState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What one tick did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Sequence number of this tick, starting at 1
    pub tick: u64,
    pub removed: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub events: usize,
    pub payloads: usize,
    pub discarded: usize,
    pub disconnects: usize,
    pub handler_errors: usize,
    pub skipped_invalid: usize,
    /// Table size after the tick, invalidated entries included
    pub connections: usize,
}

impl TickReport {
    fn new(tick: u64, reap: ReapStats, dispatch: DispatchStats, connections: usize) -> Self {
        Self {
            tick,
            removed: reap.removed,
            accepted: reap.accepted,
            duplicates: reap.duplicates,
            events: dispatch.events,
            payloads: dispatch.payloads,
            discarded: dispatch.discarded,
            disconnects: dispatch.disconnects,
            handler_errors: dispatch.handler_errors,
            skipped_invalid: dispatch.skipped_invalid,
            connections,
        }
    }
}

/// Cloneable flag that asks [`ServerLoop::run`] to return
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Accept loop plus dispatch loop, driven one tick at a time
///
/// Each tick runs transport readiness poll, then reaping, then dispatch, and
/// returns only when all three are done. `tick` and `stop` both need
/// `&mut self`, so a stop can never overlap a tick in flight.
pub struct ServerLoop<T, H> {
    transport: T,
    handler: H,
    table: ConnectionTable,
    reaper: ConnectionReaper,
    dispatcher: EventDispatcher,
    state: LoopState,
    ticks: u64,
    tick_interval: Duration,
    shutdown: ShutdownHandle,
}

impl<T, H> ServerLoop<T, H>
where
    T: Transport,
    H: Handler,
{
    pub fn new(transport: T, handler: H, config: &Config) -> Self {
        let dispatcher = EventDispatcher::new(config.dispatch_threads, config.dispatch_batch_size)
            .with_max_events(config.max_events_per_tick);

        Self {
            transport,
            handler,
            table: ConnectionTable::with_capacity(config.initial_connections),
            reaper: ConnectionReaper::new(),
            dispatcher,
            state: LoopState::Idle,
            ticks: 0,
            tick_interval: config.tick_interval(),
            shutdown: ShutdownHandle::default(),
        }
    }

    /// Bind and listen on `addr`. Returns the address actually bound.
    ///
    /// On failure the loop stays `Idle`.
    pub fn start(&mut self, addr: SocketAddr) -> Result<SocketAddr> {
        self.expect_state(LoopState::Idle, "start")?;

        if let Err(e) = self
            .transport
            .bind(addr)
            .and_then(|()| self.transport.listen())
        {
            error!("Failed to bind to {}: {}", addr, e.source);
            return Err(Error::Bind(e));
        }

        let bound = self.transport.local_addr().unwrap_or(addr);
        self.state = LoopState::Running;
        info!("Server started on {}", bound);
        Ok(bound)
    }

    /// Run one full poll, reap, dispatch pass
    pub fn tick(&mut self) -> Result<TickReport> {
        self.expect_state(LoopState::Running, "tick")?;

        self.transport.update()?;

        let reap = self
            .reaper
            .reap(&mut self.table, &mut self.transport, &self.handler);

        let dispatch = self
            .dispatcher
            .dispatch(self.table.snapshot(), &self.transport, &self.handler);

        self.ticks += 1;
        let report = TickReport::new(self.ticks, reap, dispatch, self.table.len());
        trace!(?report, "Tick complete");
        Ok(report)
    }

    /// Tick at the configured interval until the shutdown handle fires, then stop
    pub fn run(&mut self) -> Result<()> {
        self.expect_state(LoopState::Running, "run")?;

        while !self.shutdown.is_triggered() {
            let started = Instant::now();

            if let Err(e) = self.tick() {
                self.stop();
                return Err(e);
            }

            if let Some(rest) = self.tick_interval.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }

        info!("Initiating server shutdown");
        self.stop();
        Ok(())
    }

    /// Release the table and transport. Idempotent.
    pub fn stop(&mut self) {
        if self.state == LoopState::Stopped {
            return;
        }

        let released = self.table.len();
        self.table.clear();
        self.transport.shutdown();
        self.state = LoopState::Stopped;
        info!(ticks = self.ticks, "Server stopped, released {} connections", released);
    }

    /// Send one message to `conn` through the transport
    pub fn send(&self, conn: ConnectionId, payload: &[u8]) -> Result<()> {
        self.expect_state(LoopState::Running, "send")?;
        self.transport.send(conn, payload)?;
        Ok(())
    }

    /// Ask the transport to close `conn`; its `Disconnect` arrives on a later tick
    pub fn disconnect(&self, conn: ConnectionId) -> Result<()> {
        self.expect_state(LoopState::Running, "disconnect")?;
        self.transport.disconnect(conn);
        Ok(())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    /// Table size, including entries invalidated this tick
    pub fn connection_count(&self) -> usize {
        self.table.len()
    }

    /// Identities of connections not yet seen disconnecting
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.table
            .iter()
            .filter(|h| h.is_valid())
            .map(|h| h.id())
            .collect()
    }

    pub fn table(&self) -> &ConnectionTable {
        &self.table
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    fn expect_state(&self, expected: LoopState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation,
                state: self.state,
            })
        }
    }
}
