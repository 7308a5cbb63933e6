//! Simulated arena controller
//!
//! `MockArena` accepts every command, records it, and can be told to refuse or
//! error on specific operations. It backs `--arena mock`, dry runs on machines
//! without hardware, and the test suite.
//!
//! With `with_timing(true)` a trial that waits for completion sleeps for its
//! duration using `tokio::time::sleep`.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::time::{sleep, Duration};

use crate::hardware::controller::{ensure_drivable, ArenaController, ArenaGeneration, TrialStart};

/// One recorded controller call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArenaCall {
    Open(ArenaGeneration),
    AllOn,
    AllOff,
    StopDisplay,
    SetPositionX(u16),
    SetColorDepth(u8),
    StartTrial(TrialStart),
    Close,
}

impl ArenaCall {
    /// Operation name used by `fail_on` / `error_on`
    pub fn operation(&self) -> &'static str {
        match self {
            ArenaCall::Open(_) => "open",
            ArenaCall::AllOn => "all_on",
            ArenaCall::AllOff => "all_off",
            ArenaCall::StopDisplay => "stop_display",
            ArenaCall::SetPositionX(_) => "set_position_x",
            ArenaCall::SetColorDepth(_) => "set_color_depth",
            ArenaCall::StartTrial(_) => "start_trial",
            ArenaCall::Close => "close",
        }
    }
}

#[derive(Default)]
pub struct MockArena {
    calls: Mutex<Vec<ArenaCall>>,
    refuse: Mutex<HashSet<String>>,
    errors: Mutex<HashSet<String>>,
    opened: Mutex<Option<ArenaGeneration>>,
    close_count: AtomicUsize,
    simulate_timing: bool,
}

impl MockArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep through trials that wait for completion
    pub fn with_timing(mut self, enabled: bool) -> Self {
        self.simulate_timing = enabled;
        self
    }

    /// Make `operation` answer `false` (setters and `open` return an error instead)
    pub fn fail_on(self, operation: &str) -> Self {
        lock(&self.refuse).insert(operation.to_string());
        self
    }

    /// Make `operation` return an error
    pub fn error_on(self, operation: &str) -> Self {
        lock(&self.errors).insert(operation.to_string());
        self
    }

    /// Snapshot of every call so far, in order
    pub fn calls(&self) -> Vec<ArenaCall> {
        lock(&self.calls).clone()
    }

    /// Number of recorded calls excluding open/close
    pub fn command_count(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| !matches!(c, ArenaCall::Open(_) | ArenaCall::Close))
            .count()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        lock(&self.opened).is_some()
    }

    /// Record `call` and decide its outcome.
    fn record(&self, call: ArenaCall) -> Result<bool> {
        let op = call.operation();
        lock(&self.calls).push(call);
        if lock(&self.errors).contains(op) {
            return Err(anyhow!("simulated {} error", op));
        }
        Ok(!lock(&self.refuse).contains(op))
    }

    fn require_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(anyhow!("mock arena is not open"))
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl ArenaController for MockArena {
    fn describe(&self) -> String {
        "mock".to_string()
    }

    async fn open(&self, generation: ArenaGeneration) -> Result<()> {
        ensure_drivable(generation)?;
        if !self.record(ArenaCall::Open(generation))? {
            anyhow::bail!("simulated refusal to open arena");
        }
        *lock(&self.opened) = Some(generation);
        tracing::debug!(%generation, "Mock arena opened");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        let was_open = lock(&self.opened).take().is_some();
        if was_open {
            self.record(ArenaCall::Close)?;
        }
        Ok(())
    }

    async fn all_on(&self) -> Result<bool> {
        self.require_open()?;
        self.record(ArenaCall::AllOn)
    }

    async fn all_off(&self) -> Result<bool> {
        self.require_open()?;
        self.record(ArenaCall::AllOff)
    }

    async fn stop_display(&self) -> Result<bool> {
        self.require_open()?;
        self.record(ArenaCall::StopDisplay)
    }

    async fn set_position_x(&self, x: u16) -> Result<()> {
        self.require_open()?;
        if !self.record(ArenaCall::SetPositionX(x))? {
            anyhow::bail!("simulated refusal of set_position_x");
        }
        Ok(())
    }

    async fn set_color_depth(&self, depth: u8) -> Result<()> {
        self.require_open()?;
        if !self.record(ArenaCall::SetColorDepth(depth))? {
            anyhow::bail!("simulated refusal of set_color_depth");
        }
        Ok(())
    }

    async fn start_trial(&self, trial: TrialStart) -> Result<bool> {
        self.require_open()?;
        let accepted = self.record(ArenaCall::StartTrial(trial))?;
        if accepted && trial.wait_for_completion && self.simulate_timing {
            sleep(Duration::from_millis(u64::from(trial.duration_units) * 100)).await;
        }
        Ok(accepted)
    }
}
