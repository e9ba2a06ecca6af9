//! Task executor: one robot action at a time.
//!
//! An action is claimed with [`TaskExecutor::begin`], which hands out an
//! [`ActionGuard`] while no other action is in flight and fails with
//! [`ScError::Busy`] otherwise. The guard may execute several commands (an
//! unload followed by a load, a basket scan sample by sample) without
//! releasing the slot; dropping it frees the slot.
//!
//! # Command lifecycle
//!
//! 1. Wait up to `ready_timeout` for the device to be ready and its path
//!    idle; otherwise `DeviceTimeout { phase: "ready" }`.
//! 2. Dispatch. The device returns a task handle or nothing.
//! 3. With a handle: sleep `settle_delay` (busy flags lag the dispatch), then
//!    poll `path_running` every `poll_interval` until idle or until
//!    `action_timeout` elapses.
//!    Without a handle: poll the mapped raw state until it is no longer busy,
//!    under the same deadline (normally the first poll succeeds).
//! 4. An [`abort`](TaskExecutor::abort) issued meanwhile turns the result into
//!    `Aborted`; a `Fault` state afterwards into `ActionFailed`.
//!
//! Both deadlines are checked on every poll iteration.
//!
//! # Generations
//!
//! Claiming and releasing the slot each bump a generation counter. Work that
//! reads the device outside the slot (a resync tick) takes an
//! [`ExecutorSnapshot`] first and applies its readings through
//! [`TaskExecutor::if_unchanged`], which refuses once any action has started
//! or finished since the snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use sc_core::error::{ScError, ScResult};
use sc_core::state::{SampleChangerState, TaskKind};

use crate::config::{available, TimingSettings};
use crate::device::DeviceIo;

/// Serializes robot actions on one device.
#[derive(Debug)]
pub struct TaskExecutor {
    io: Arc<DeviceIo>,
    timing: TimingSettings,
    slot: Mutex<Slot>,
    abort_generation: AtomicU64,
}

#[derive(Debug, Default)]
struct Slot {
    in_flight: Option<TaskKind>,
    generation: u64,
}

/// Executor slot as seen at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSnapshot {
    /// Action owning the slot, if any.
    pub in_flight: Option<TaskKind>,
    /// Bumped on every claim and release.
    pub generation: u64,
}

impl TaskExecutor {
    /// Idle executor over `io`.
    pub fn new(io: Arc<DeviceIo>, timing: TimingSettings) -> Self {
        Self {
            io,
            timing,
            slot: Mutex::new(Slot::default()),
            abort_generation: AtomicU64::new(0),
        }
    }

    /// Deadlines in use.
    pub fn timing(&self) -> &TimingSettings {
        &self.timing
    }

    /// Action currently owning the slot.
    pub fn in_flight(&self) -> Option<TaskKind> {
        self.slot.lock().in_flight
    }

    /// Current owner and generation of the slot.
    pub fn snapshot(&self) -> ExecutorSnapshot {
        let slot = self.slot.lock();
        ExecutorSnapshot {
            in_flight: slot.in_flight,
            generation: slot.generation,
        }
    }

    /// Run `f` if no action has been claimed or released since `generation`.
    ///
    /// The slot stays locked while `f` runs, so no action can start
    /// meanwhile. `f` must not block.
    pub fn if_unchanged<R>(&self, generation: u64, f: impl FnOnce() -> R) -> Option<R> {
        let slot = self.slot.lock();
        if slot.generation != generation {
            return None;
        }
        let out = f();
        drop(slot);
        Some(out)
    }

    /// Claim the slot for `kind`.
    pub fn begin(&self, kind: TaskKind) -> ScResult<ActionGuard<'_>> {
        let mut slot = self.slot.lock();
        if let Some(in_flight) = slot.in_flight {
            debug!(requested = %kind, %in_flight, "rejecting action, executor busy");
            return Err(ScError::Busy { in_flight });
        }
        slot.in_flight = Some(kind);
        slot.generation += 1;
        trace!(%kind, "executor slot claimed");
        Ok(ActionGuard {
            executor: self,
            kind,
        })
    }

    /// Cancel the in-flight trajectory on the device.
    ///
    /// Does not take the slot. The waiting action still returns through its
    /// poll loop, with `Aborted`.
    pub async fn abort(&self) -> ScResult<()> {
        let command = available(&self.io.commands().abort)
            .ok_or_else(|| ScError::Unsupported("abort".to_string()))?
            .to_string();
        self.abort_generation.fetch_add(1, Ordering::SeqCst);
        info!(command = %command, in_flight = ?self.in_flight(), "aborting");
        self.io.dispatch(&command, &[]).await?;
        Ok(())
    }

    fn release(&self, kind: TaskKind) {
        let mut slot = self.slot.lock();
        if slot.in_flight == Some(kind) {
            slot.in_flight = None;
            slot.generation += 1;
        }
        trace!(%kind, "executor slot released");
    }

    // =========================================================================
    // Waits
    // =========================================================================

    async fn wait_ready(&self) -> ScResult<()> {
        let timeout = self.timing.ready_timeout;
        let deadline = Instant::now() + timeout;

        loop {
            match self.ready_now().await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => debug!(error = %e, "state read failed while waiting for ready"),
            }
            if Instant::now() >= deadline {
                warn!(?timeout, "device did not become ready");
                return Err(ScError::DeviceTimeout {
                    phase: "ready".to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(self.timing.poll_interval).await;
        }
    }

    async fn ready_now(&self) -> ScResult<bool> {
        let state = self.io.raw_state().await?;
        if !state.is_ready() {
            trace!(%state, "not ready");
            return Ok(false);
        }
        Ok(!self.io.path_running().await?)
    }

    async fn wait_idle(&self, command: &str, with_handle: bool) -> ScResult<()> {
        let timeout = self.timing.action_timeout;
        let deadline = Instant::now() + timeout;

        loop {
            let busy = if with_handle {
                self.io.path_running().await
            } else {
                self.io.raw_state().await.map(|s| s.is_busy())
            };
            match busy {
                Ok(false) => return Ok(()),
                Ok(true) => trace!(command, "action running"),
                Err(e) => debug!(command, error = %e, "busy read failed while waiting"),
            }
            if Instant::now() >= deadline {
                warn!(command, ?timeout, "action did not complete");
                return Err(ScError::DeviceTimeout {
                    phase: command.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(self.timing.poll_interval).await;
        }
    }
}

/// Exclusive right to run commands until dropped.
#[derive(Debug)]
pub struct ActionGuard<'a> {
    executor: &'a TaskExecutor,
    kind: TaskKind,
}

impl ActionGuard<'_> {
    /// Action this guard was claimed for.
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Run one command to completion.
    pub async fn execute(&self, command: &str, args: &[Value]) -> ScResult<()> {
        self.run(command, args, true).await
    }

    /// Run a recovery command (reset) without waiting for the device to be
    /// ready first.
    pub async fn execute_immediately(&self, command: &str, args: &[Value]) -> ScResult<()> {
        self.run(command, args, false).await
    }

    async fn run(&self, command: &str, args: &[Value], wait_ready: bool) -> ScResult<()> {
        let executor = self.executor;
        let started = Instant::now();

        if wait_ready {
            executor.wait_ready().await?;
        }

        let generation = executor.abort_generation.load(Ordering::SeqCst);
        info!(kind = %self.kind, command, ?args, "dispatching action");
        let handle = executor.io.dispatch(command, args).await?;

        match handle {
            Some(task) => {
                debug!(command, task, "waiting for action");
                tokio::time::sleep(executor.timing.settle_delay).await;
                executor.wait_idle(command, true).await?;
            }
            None => {
                debug!(command, "no task handle, checking busy state");
                executor.wait_idle(command, false).await?;
            }
        }

        if executor.abort_generation.load(Ordering::SeqCst) != generation {
            warn!(command, "action aborted");
            return Err(ScError::Aborted(command.to_string()));
        }

        if let Ok(SampleChangerState::Fault) = executor.io.raw_state().await {
            let message = executor
                .io
                .last_error()
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| "device reported a fault".to_string());
            warn!(command, %message, "action failed");
            return Err(ScError::ActionFailed {
                command: command.to_string(),
                message,
            });
        }

        info!(
            kind = %self.kind,
            command,
            elapsed = ?started.elapsed(),
            "action complete"
        );
        Ok(())
    }
}

impl Drop for ActionGuard<'_> {
    fn drop(&mut self) {
        self.executor.release(self.kind);
    }
}
