//! Lifecycle states and the shared service state table.
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::{EngineError, Result},
    events::{EngineEvent, EventBus},
};

/// Lifecycle state of a managed service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Error(String),
}

impl ServiceState {
    /// Whether `self -> next` is a legal lifecycle transition.
    pub fn can_transition_to(&self, next: &ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Stopped, Stopped)
                | (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error(_))
                | (Running, Error(_))
                | (Running, Stopped)
                | (Error(_), Stopped)
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ServiceState::Running)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ServiceState::Error(_))
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Mutable per-service record owned by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub exit_code: Option<i32>,
}

impl Default for ServiceEntry {
    fn default() -> Self {
        Self {
            state: ServiceState::Stopped,
            pid: None,
            started_at: None,
            last_error: None,
            exit_code: None,
        }
    }
}

/// Read-only snapshot of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub id: String,
    pub display_name: String,
    pub state: ServiceState,
    pub uptime_secs: Option<u64>,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub version: Option<String>,
    pub healthy: bool,
    pub last_error: Option<String>,
    pub exit_code: Option<i32>,
}

/// Snapshot of the whole stack plus chain metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub services: Vec<ServiceStatus>,
    pub block_height: Option<u64>,
    pub mempool_size: Option<u64>,
    pub is_ready: bool,
}

/// Shared table of [`ServiceEntry`] values.
///
/// Every state change goes through [`StateTable::transition`], which rejects
/// illegal moves and publishes a `StateChanged` event.
#[derive(Debug, Clone)]
pub struct StateTable {
    entries: Arc<RwLock<HashMap<String, ServiceEntry>>>,
    events: EventBus,
}

impl StateTable {
    pub fn new<I, S>(services: I, events: EventBus) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = services
            .into_iter()
            .map(|id| (id.into(), ServiceEntry::default()))
            .collect();
        Self {
            entries: Arc::new(RwLock::new(entries)),
            events,
        }
    }

    pub fn get(&self, service: &str) -> Result<ServiceEntry> {
        self.entries
            .read()?
            .get(service)
            .cloned()
            .ok_or_else(|| EngineError::UnknownService(service.to_string()))
    }

    pub fn state(&self, service: &str) -> Result<ServiceState> {
        Ok(self.get(service)?.state)
    }

    pub fn snapshot(&self) -> Result<HashMap<String, ServiceEntry>> {
        Ok(self.entries.read()?.clone())
    }

    /// Applies `next` if legal, then lets `update` adjust the entry.
    pub fn transition<F>(&self, service: &str, next: ServiceState, update: F) -> Result<()>
    where
        F: FnOnce(&mut ServiceEntry),
    {
        {
            let mut entries = self.entries.write()?;
            let entry = entries
                .get_mut(service)
                .ok_or_else(|| EngineError::UnknownService(service.to_string()))?;

            if !entry.state.can_transition_to(&next) {
                warn!(
                    "Rejected transition of '{service}' from {} to {next}",
                    entry.state
                );
                return Err(EngineError::Precondition(format!(
                    "service '{service}' cannot move from {} to {next}",
                    entry.state
                )));
            }

            if entry.state == next {
                update(entry);
                return Ok(());
            }

            debug!("Service '{service}': {} -> {next}", entry.state);
            entry.state = next.clone();
            update(entry);
        }

        self.events.publish(EngineEvent::StateChanged {
            service: service.to_string(),
            state: next,
        });
        Ok(())
    }

    /// Stopped -> Starting. Clears the record of the previous run.
    pub fn mark_starting(&self, service: &str) -> Result<()> {
        self.transition(service, ServiceState::Starting, |entry| {
            entry.pid = None;
            entry.started_at = None;
            entry.last_error = None;
            entry.exit_code = None;
        })
    }

    pub fn set_pid(&self, service: &str, pid: u32) -> Result<()> {
        let mut entries = self.entries.write()?;
        if let Some(entry) = entries.get_mut(service) {
            entry.pid = Some(pid);
        }
        Ok(())
    }

    pub fn mark_running(&self, service: &str) -> Result<()> {
        self.transition(service, ServiceState::Running, |entry| {
            entry.started_at = Some(Utc::now());
        })
    }

    pub fn mark_error(
        &self,
        service: &str,
        reason: impl Into<String>,
        exit_code: Option<i32>,
    ) -> Result<()> {
        let reason = reason.into();
        let recorded = reason.clone();
        self.transition(service, ServiceState::Error(reason), move |entry| {
            entry.last_error = Some(recorded);
            if exit_code.is_some() {
                entry.exit_code = exit_code;
            }
        })
    }

    /// Moves to Stopped. `last_error` and `exit_code` survive for reporting.
    pub fn mark_stopped(&self, service: &str) -> Result<()> {
        self.transition(service, ServiceState::Stopped, |entry| {
            entry.pid = None;
            entry.started_at = None;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions_follow_lifecycle() {
        use ServiceState::*;
        let error = Error("boom".into());

        assert!(Stopped.can_transition_to(&Starting));
        assert!(Starting.can_transition_to(&Running));
        assert!(Starting.can_transition_to(&error));
        assert!(Running.can_transition_to(&error));
        assert!(Running.can_transition_to(&Stopped));
        assert!(error.can_transition_to(&Stopped));

        assert!(!Stopped.can_transition_to(&Running));
        assert!(!Stopped.can_transition_to(&error));
        assert!(!Starting.can_transition_to(&Stopped));
        assert!(!error.can_transition_to(&Running));
        assert!(!Running.can_transition_to(&Starting));
    }

    #[test]
    fn transitions_publish_events_and_keep_last_error() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let table = StateTable::new(["bitcoind"], bus);

        table.mark_starting("bitcoind").unwrap();
        table.set_pid("bitcoind", 42).unwrap();
        table.mark_error("bitcoind", "exited with 1", Some(1)).unwrap();
        table.mark_stopped("bitcoind").unwrap();

        let entry = table.get("bitcoind").unwrap();
        assert_eq!(entry.state, ServiceState::Stopped);
        assert_eq!(entry.pid, None);
        assert_eq!(entry.last_error.as_deref(), Some("exited with 1"));
        assert_eq!(entry.exit_code, Some(1));

        let states: Vec<ServiceState> = rx
            .try_iter()
            .map(|event| match event {
                EngineEvent::StateChanged { state, .. } => state,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ServiceState::Starting,
                ServiceState::Error("exited with 1".into()),
                ServiceState::Stopped,
            ]
        );
    }

    #[test]
    fn illegal_transition_is_rejected_without_change() {
        let table = StateTable::new(["ord"], EventBus::new());
        let err = table.mark_running("ord").unwrap_err();
        assert!(matches!(err, EngineError::Precondition(_)));
        assert_eq!(table.state("ord").unwrap(), ServiceState::Stopped);
    }

    #[test]
    fn unknown_service_is_reported() {
        let table = StateTable::new(["ord"], EventBus::new());
        assert!(matches!(
            table.get("esplora"),
            Err(EngineError::UnknownService(_))
        ));
    }

    #[test]
    fn starting_clears_previous_error() {
        let table = StateTable::new(["ord"], EventBus::new());
        table.mark_starting("ord").unwrap();
        table.mark_error("ord", "timeout", None).unwrap();
        table.mark_stopped("ord").unwrap();
        table.mark_starting("ord").unwrap();

        let entry = table.get("ord").unwrap();
        assert_eq!(entry.state, ServiceState::Starting);
        assert!(entry.last_error.is_none());
    }
}
