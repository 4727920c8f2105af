//! In-memory task registry.
//!
//! Registration happens once at startup, but enable/disable, manual triggers
//! and scheduled fires race with each other, so every access goes through one
//! `RwLock`. Critical sections never span an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::task::{TaskHandler, TaskSpec};
use super::trigger::Trigger;
use crate::error::{Result, SchedulerError};

struct TaskEntry {
    schedule: String,
    trigger: Trigger,
    handler: Arc<dyn TaskHandler>,
    enabled: bool,
    global: bool,
    timeout: Option<Duration>,
    last_run: Option<DateTime<Utc>>,
    next_fire: Option<DateTime<Utc>>,
    running: bool,
}

/// Point-in-time view of one registered task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub name: String,
    pub schedule: String,
    pub enabled: bool,
    pub global: bool,
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_fire: Option<DateTime<Utc>>,
}

/// What the engine needs to run a task once it has claimed the run slot.
pub(crate) struct RunTicket {
    pub handler: Arc<dyn TaskHandler>,
    pub global: bool,
    pub timeout: Option<Duration>,
}

pub(crate) enum BeginRun {
    Ready(RunTicket, RunSlot),
    Disabled,
    AlreadyRunning,
    Unknown,
}

#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<RwLock<HashMap<String, TaskEntry>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, TaskEntry>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, TaskEntry>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a task. The schedule is parsed here so a bad expression fails
    /// registration instead of silently never firing.
    pub fn register(&self, spec: TaskSpec, now: DateTime<Utc>) -> Result<()> {
        let trigger = Trigger::parse(&spec.schedule)?;
        let mut tasks = self.write();
        if tasks.contains_key(&spec.name) {
            return Err(SchedulerError::DuplicateTask { name: spec.name });
        }
        let next_fire = trigger.next_after(now);
        tasks.insert(
            spec.name,
            TaskEntry {
                schedule: spec.schedule,
                trigger,
                handler: spec.handler,
                enabled: spec.enabled,
                global: spec.global,
                timeout: spec.timeout,
                last_run: None,
                next_fire,
                running: false,
            },
        );
        Ok(())
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut tasks = self.write();
        let entry = tasks.get_mut(name).ok_or_else(|| SchedulerError::UnknownTask {
            name: name.to_string(),
        })?;
        entry.enabled = enabled;
        Ok(())
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.read().get(name).is_some_and(|e| e.enabled)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Names of tasks whose next fire is at or before `now`, advancing each
    /// one's next fire past `now`.
    ///
    /// Disabled tasks are returned as well; the engine decides to skip them.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut tasks = self.write();
        let mut due = Vec::new();
        for (name, entry) in tasks.iter_mut() {
            let Some(slot) = entry.next_fire else { continue };
            if slot > now {
                continue;
            }
            // Keep interval cadence anchored to the slot, but never queue a
            // backlog of missed slots.
            entry.next_fire = match entry.trigger.next_after(slot) {
                Some(next) if next > now => Some(next),
                _ => entry.trigger.next_after(now),
            };
            due.push(name.clone());
        }
        due.sort();
        due
    }

    /// Claim the run slot for `name`. Only one run per task may be in flight
    /// on this node; the returned [`RunSlot`] frees it on drop.
    pub(crate) fn begin_run(&self, name: &str) -> BeginRun {
        let mut tasks = self.write();
        let Some(entry) = tasks.get_mut(name) else {
            return BeginRun::Unknown;
        };
        if !entry.enabled {
            return BeginRun::Disabled;
        }
        if entry.running {
            return BeginRun::AlreadyRunning;
        }
        entry.running = true;
        BeginRun::Ready(
            RunTicket {
                handler: entry.handler.clone(),
                global: entry.global,
                timeout: entry.timeout,
            },
            RunSlot {
                registry: self.clone(),
                name: name.to_string(),
                ran_at: None,
            },
        )
    }

    fn finish_run(&self, name: &str, ran_at: Option<DateTime<Utc>>) {
        if let Some(entry) = self.write().get_mut(name) {
            entry.running = false;
            if ran_at.is_some() {
                entry.last_run = ran_at;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        let mut out: Vec<TaskSnapshot> = self
            .read()
            .iter()
            .map(|(name, e)| TaskSnapshot {
                name: name.clone(),
                schedule: e.schedule.clone(),
                enabled: e.enabled,
                global: e.global,
                running: e.running,
                last_run: e.last_run,
                next_fire: e.next_fire,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn get(&self, name: &str) -> Option<TaskSnapshot> {
        self.snapshot().into_iter().find(|s| s.name == name)
    }
}

/// Marks a task as running until dropped. Dropping it (normally or while
/// unwinding) clears the running flag and records the last run, if any.
pub(crate) struct RunSlot {
    registry: TaskRegistry,
    name: String,
    ran_at: Option<DateTime<Utc>>,
}

impl RunSlot {
    /// Record that the handler was invoked at `at`.
    pub fn mark_ran(&mut self, at: DateTime<Utc>) {
        self.ran_at = Some(at);
    }
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        self.registry.finish_run(&self.name, self.ran_at);
    }
}
