//! Per-provider circuit breakers
//!
//! ```text
//! CLOSED ──[failure_threshold consecutive failures]──► OPEN
//!    ▲                                                  │
//!    │                                        [recovery_timeout]
//!    │                                                  ▼
//!    └────────────[probe succeeds]──────────────── HALF_OPEN
//!                                                       │
//!                       OPEN ◄──────[probe fails]───────┘
//! ```
//!
//! Each provider owns an independent lock-guarded cell in the registry. While
//! half-open exactly one caller holds the probe slot; every other caller sees
//! the circuit as open until the probe reports back.

use crate::config::CircuitBreakerSettings;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct CircuitCell {
    status: CircuitStatus,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    failure_threshold: u32,
    recovery_timeout: Duration,
    total_successes: u64,
    total_failures: u64,
}

impl CircuitCell {
    fn new(settings: &CircuitBreakerSettings) -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
            failure_threshold: settings.failure_threshold,
            recovery_timeout: settings.recovery_timeout(),
            total_successes: 0,
            total_failures: 0,
        }
    }

    fn recovery_elapsed(&self, now: Instant) -> bool {
        self.opened_at
            .map(|opened| now.duration_since(opened) >= self.recovery_timeout)
            .unwrap_or(true)
    }

    fn open(&mut self, now: Instant) {
        self.status = CircuitStatus::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
    }
}

/// Read-only view of one circuit for the admin surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub provider: String,
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    /// Seconds since the circuit last opened
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_secs_ago: Option<u64>,
    pub probe_in_flight: bool,
    pub total_successes: u64,
    pub total_failures: u64,
}

/// Registry of circuit cells keyed by provider name
#[derive(Debug)]
pub struct CircuitRegistry {
    cells: DashMap<String, Arc<Mutex<CircuitCell>>>,
    settings: RwLock<CircuitBreakerSettings>,
}

impl Default for CircuitRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerSettings::default())
    }
}

fn lock(cell: &Mutex<CircuitCell>) -> MutexGuard<'_, CircuitCell> {
    cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CircuitRegistry {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        Self {
            cells: DashMap::new(),
            settings: RwLock::new(settings),
        }
    }

    fn settings(&self) -> CircuitBreakerSettings {
        *self
            .settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cell(&self, provider: &str) -> Arc<Mutex<CircuitCell>> {
        if let Some(cell) = self.cells.get(provider) {
            return Arc::clone(cell.value());
        }
        let settings = self.settings();
        Arc::clone(
            self.cells
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(CircuitCell::new(&settings))))
                .value(),
        )
    }

    /// Consuming check made right before an attempt.
    ///
    /// Once the recovery timeout has elapsed the first caller moves the
    /// circuit to half-open and takes the probe slot.
    pub fn is_call_allowed(&self, provider: &str) -> bool {
        let cell = self.cell(provider);
        let mut cell = lock(&cell);
        let now = Instant::now();

        match cell.status {
            CircuitStatus::Closed => true,
            CircuitStatus::Open => {
                if cell.recovery_elapsed(now) {
                    cell.status = CircuitStatus::HalfOpen;
                    cell.probe_in_flight = true;
                    info!("Circuit for '{}' half-open, releasing probe", provider);
                    true
                } else {
                    false
                }
            }
            CircuitStatus::HalfOpen => {
                if cell.probe_in_flight {
                    false
                } else {
                    cell.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Non-consuming check used while building candidate lists
    pub fn peek_allowed(&self, provider: &str) -> bool {
        let Some(cell) = self.cells.get(provider).map(|c| Arc::clone(c.value())) else {
            return true;
        };
        let cell = lock(&cell);
        match cell.status {
            CircuitStatus::Closed => true,
            CircuitStatus::Open => cell.recovery_elapsed(Instant::now()),
            CircuitStatus::HalfOpen => !cell.probe_in_flight,
        }
    }

    /// Only a half-open probe closes the circuit. A success landing while the
    /// circuit is open (a call admitted before it tripped, or a health probe)
    /// clears the failure streak but leaves the recovery window running.
    pub fn record_success(&self, provider: &str) {
        let cell = self.cell(provider);
        let mut cell = lock(&cell);
        cell.consecutive_failures = 0;
        cell.total_successes += 1;

        if cell.status == CircuitStatus::HalfOpen {
            cell.status = CircuitStatus::Closed;
            cell.opened_at = None;
            cell.probe_in_flight = false;
            info!("Circuit for '{}' closed after successful probe", provider);
        }
    }

    pub fn record_failure(&self, provider: &str) {
        let cell = self.cell(provider);
        let mut cell = lock(&cell);
        let now = Instant::now();
        cell.consecutive_failures = cell.consecutive_failures.saturating_add(1);
        cell.total_failures += 1;

        match cell.status {
            CircuitStatus::Closed => {
                if cell.consecutive_failures >= cell.failure_threshold {
                    cell.open(now);
                    warn!(
                        "Circuit for '{}' opened after {} consecutive failures",
                        provider, cell.consecutive_failures
                    );
                }
            }
            CircuitStatus::HalfOpen => {
                cell.open(now);
                warn!("Circuit for '{}' re-opened, probe failed", provider);
            }
            CircuitStatus::Open => {}
        }
    }

    /// Give back a probe slot after an outcome that says nothing about health
    pub fn release_probe(&self, provider: &str) {
        if let Some(cell) = self.cells.get(provider).map(|c| Arc::clone(c.value())) {
            let mut cell = lock(&cell);
            if cell.status == CircuitStatus::HalfOpen {
                cell.probe_in_flight = false;
            }
        }
    }

    /// Administrative reset to closed; returns whether the provider was known
    pub fn reset(&self, provider: &str) -> bool {
        let Some(cell) = self.cells.get(provider).map(|c| Arc::clone(c.value())) else {
            return false;
        };
        let mut cell = lock(&cell);
        cell.status = CircuitStatus::Closed;
        cell.consecutive_failures = 0;
        cell.opened_at = None;
        cell.probe_in_flight = false;
        info!("Circuit for '{}' reset", provider);
        true
    }

    /// Make sure every named provider has a cell, so it shows up in snapshots
    pub fn register<'a>(&self, providers: impl IntoIterator<Item = &'a str>) {
        for provider in providers {
            self.cell(provider);
        }
    }

    /// Apply new thresholds to existing and future cells; state is kept
    pub fn apply_settings(&self, settings: CircuitBreakerSettings) {
        *self
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = settings;

        let now = Instant::now();
        for entry in self.cells.iter() {
            let mut cell = lock(entry.value());
            cell.failure_threshold = settings.failure_threshold;
            cell.recovery_timeout = settings.recovery_timeout();
            if cell.status == CircuitStatus::Closed
                && cell.consecutive_failures >= cell.failure_threshold
            {
                cell.open(now);
            }
        }
    }

    pub fn status(&self, provider: &str) -> CircuitStatus {
        self.cells
            .get(provider)
            .map(|c| lock(c.value()).status)
            .unwrap_or(CircuitStatus::Closed)
    }

    pub fn snapshot_of(&self, provider: &str) -> Option<CircuitSnapshot> {
        let cell = self.cells.get(provider).map(|c| Arc::clone(c.value()))?;
        let cell = lock(&cell);
        Some(Self::describe(provider, &cell, Instant::now()))
    }

    /// All circuits, sorted by provider name
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let now = Instant::now();
        let mut snapshots: Vec<CircuitSnapshot> = self
            .cells
            .iter()
            .map(|entry| Self::describe(entry.key(), &lock(entry.value()), now))
            .collect();
        snapshots.sort_by(|a, b| a.provider.cmp(&b.provider));
        snapshots
    }

    fn describe(provider: &str, cell: &CircuitCell, now: Instant) -> CircuitSnapshot {
        CircuitSnapshot {
            provider: provider.to_string(),
            status: cell.status,
            consecutive_failures: cell.consecutive_failures,
            failure_threshold: cell.failure_threshold,
            recovery_timeout_secs: cell.recovery_timeout.as_secs(),
            opened_secs_ago: cell
                .opened_at
                .map(|opened| now.duration_since(opened).as_secs()),
            probe_in_flight: cell.probe_in_flight,
            total_successes: cell.total_successes,
            total_failures: cell.total_failures,
        }
    }
}
