//! Strategy lifecycle state machine
//!
//! The controller is the only authority on whether a unit may receive ticks
//! (ACTIVE) or be registered again (not WARMING_UP).

use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

/// Default number of transitions kept per unit
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Offline,
    Staged,
    WarmingUp,
    Active,
    Paused,
    Stopping,
    Error,
}

impl LifecycleState {
    /// Legal targets from this state
    pub fn allowed_targets(self) -> &'static [LifecycleState] {
        use LifecycleState::*;
        match self {
            Offline => &[Staged, WarmingUp],
            Staged => &[WarmingUp, Offline],
            WarmingUp => &[Active, Error, Offline],
            Active => &[Paused, Stopping, Error, Offline],
            Paused => &[Active, Stopping, Offline],
            Stopping => &[Offline],
            Error => &[Staged, Offline, WarmingUp, Stopping],
        }
    }

    pub fn can_transition_to(self, target: LifecycleState) -> bool {
        self.allowed_targets().contains(&target)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Offline => "OFFLINE",
            LifecycleState::Staged => "STAGED",
            LifecycleState::WarmingUp => "WARMING_UP",
            LifecycleState::Active => "ACTIVE",
            LifecycleState::Paused => "PAUSED",
            LifecycleState::Stopping => "STOPPING",
            LifecycleState::Error => "ERROR",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One committed transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRecord {
    pub state: LifecycleState,
    pub meta: Value,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct UnitLifecycle {
    current: LifecycleState,
    history: VecDeque<TransitionRecord>,
}

impl Default for UnitLifecycle {
    fn default() -> Self {
        Self {
            current: LifecycleState::Offline,
            history: VecDeque::new(),
        }
    }
}

/// Per-unit FSM with bounded audit history
#[derive(Debug)]
pub struct LifecycleController {
    units: Mutex<HashMap<String, UnitLifecycle>>,
    history_limit: usize,
    events: Option<EventBus>,
}

impl LifecycleController {
    pub fn new(history_limit: usize) -> Self {
        Self {
            units: Mutex::new(HashMap::new()),
            history_limit: history_limit.max(1),
            events: None,
        }
    }

    /// Publish every committed transition on `events`
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn units(&self) -> MutexGuard<'_, HashMap<String, UnitLifecycle>> {
        self.units.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move `id` to `target`. Committing the current state is a no-op success;
    /// an illegal edge is logged and leaves the state untouched.
    pub fn commit(&self, id: &str, target: LifecycleState, meta: Value) -> bool {
        match self.transition(id, target, meta, false) {
            Ok(_) => true,
            Err(e) => {
                warn!(strategy_id = id, error = %e, "lifecycle transition rejected");
                false
            }
        }
    }

    /// Like [`Self::commit`] but requires a real edge: committing the current
    /// state is rejected. Returns the previous state.
    pub fn advance(&self, id: &str, target: LifecycleState, meta: Value) -> Result<LifecycleState> {
        self.transition(id, target, meta, true)
    }

    fn transition(
        &self,
        id: &str,
        target: LifecycleState,
        meta: Value,
        strict: bool,
    ) -> Result<LifecycleState> {
        let record = {
            let mut units = self.units();
            let unit = units.entry(id.to_string()).or_default();
            let from = unit.current;

            if from == target && !strict {
                return Ok(from);
            }
            if !from.can_transition_to(target) {
                return Err(EngineError::TransitionRejected {
                    id: id.to_string(),
                    from,
                    to: target,
                });
            }

            let record = TransitionRecord {
                state: target,
                meta,
                at: Utc::now(),
            };
            unit.current = target;
            if unit.history.len() == self.history_limit {
                unit.history.pop_front();
            }
            unit.history.push_back(record.clone());
            (from, record)
        };

        let (from, record) = record;
        info!(strategy_id = id, %from, to = %target, "lifecycle transition");
        if let Some(events) = &self.events {
            events.publish(EngineEvent::LifecycleChanged {
                strategy_id: id.to_string(),
                from,
                to: target,
                meta: record.meta,
                at: record.at,
            });
        }
        Ok(from)
    }

    /// Current state, OFFLINE for unknown ids
    pub fn status(&self, id: &str) -> LifecycleState {
        self.units()
            .get(id)
            .map_or(LifecycleState::Offline, |u| u.current)
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.status(id) == LifecycleState::Active
    }

    /// Committed transitions, oldest first
    pub fn history(&self, id: &str) -> Vec<TransitionRecord> {
        self.units()
            .get(id)
            .map(|u| u.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every known unit with its state
    pub fn snapshot(&self) -> Vec<(String, LifecycleState)> {
        let mut all: Vec<_> = self
            .units()
            .iter()
            .map(|(id, u)| (id.clone(), u.current))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}
