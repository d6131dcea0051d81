// Request boundary: capability checks, load/engine/persist under the ticket lock

use crate::directory::UserDirectory;
use crate::engine::{AssigneeChange, AssigneeRef, EngineError, TicketTimeEngine, TimerAction};
use crate::store::Store;
use crate::ticket::{Ticket, TicketStatus};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Source of the current instant
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Side-effect sink for assignment events
pub trait Notifier {
    fn assigned(&self, ticket: &Ticket, assignee_id: &str);
}

/// Notifier that only records the event in the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn assigned(&self, ticket: &Ticket, assignee_id: &str) {
        info!(ticket_id = %ticket.id, assignee_id, title = %ticket.title, "Ticket assigned");
    }
}

/// The acting user behind a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: String,
}

impl Caller {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Status/assignment update body
///
/// A missing `assigneeId` leaves the assignee alone; `"assigneeId": null` unassigns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub assignee_id: Option<Option<String>>,
}

// Distinguishes an explicit null from an absent key
fn present_or_null<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

/// Timer toggle body: `{"action": "pause" | "resume"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerToggleRequest {
    pub action: String,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("actor {actor_id} lacks administrative capability")]
    Forbidden { actor_id: String },

    #[error("ticket not found: {ticket_id}")]
    NotFound { ticket_id: String },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("store error: {0:#}")]
    Store(eyre::Report),
}

// eyre::Report is not a std Error, so no #[from] here
impl From<eyre::Report> for ServiceError {
    fn from(report: eyre::Report) -> Self {
        ServiceError::Store(report)
    }
}

impl ServiceError {
    /// HTTP-class status code for this failure
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::Forbidden { .. } => 403,
            ServiceError::NotFound { .. } => 404,
            ServiceError::Engine(_) => 400,
            ServiceError::Store(_) => 500,
        }
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

// Replay keeps the line with the highest updated_at, so every revision must
// sort after the one it replaces even when the wall clock stepped back.
fn revision_stamp(current: &Ticket, now: DateTime<Utc>) -> DateTime<Utc> {
    now.max(current.updated_at + Duration::milliseconds(1))
}

// Ids that cannot name a lock file cannot name a stored ticket either
fn ensure_lookup_id(ticket_id: &str) -> ServiceResult<()> {
    if Store::is_lockable_id(ticket_id) {
        Ok(())
    } else {
        Err(ServiceError::NotFound {
            ticket_id: ticket_id.to_string(),
        })
    }
}

/// Drives the engine against stored tickets
pub struct TicketService<D, N = LogNotifier, C = SystemClock> {
    store: Store,
    directory: D,
    notifier: N,
    clock: C,
    engine: TicketTimeEngine,
}

impl<D: UserDirectory> TicketService<D> {
    pub fn new(store: Store, directory: D) -> Self {
        Self::with_parts(store, directory, LogNotifier, SystemClock)
    }
}

impl<D, N, C> TicketService<D, N, C>
where
    D: UserDirectory,
    N: Notifier,
    C: Clock,
{
    pub fn with_parts(store: Store, directory: D, notifier: N, clock: C) -> Self {
        Self {
            store,
            directory,
            notifier,
            clock,
            engine: TicketTimeEngine::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub fn get(&self, ticket_id: &str) -> ServiceResult<Ticket> {
        self.store
            .get::<Ticket>(ticket_id)?
            .ok_or_else(|| ServiceError::NotFound {
                ticket_id: ticket_id.to_string(),
            })
    }

    /// Apply a status/assignment update on behalf of `caller`
    ///
    /// Emits an assignment notification when the assignee changes to a new actor.
    pub fn update_status(
        &mut self,
        caller: &Caller,
        ticket_id: &str,
        request: &StatusUpdateRequest,
    ) -> ServiceResult<Ticket> {
        if !self.directory.is_admin(&caller.id)? {
            warn!(actor_id = %caller.id, ticket_id, "Status update refused");
            return Err(ServiceError::Forbidden {
                actor_id: caller.id.clone(),
            });
        }

        let status = request
            .status
            .as_deref()
            .map(str::parse::<TicketStatus>)
            .transpose()?;

        let assignee: AssigneeChange = match &request.assignee_id {
            None => None,
            Some(None) => Some(None),
            Some(Some(id)) => Some(Some(AssigneeRef {
                id: id.clone(),
                eligible: self.directory.is_eligible_assignee(id)?,
            })),
        };

        ensure_lookup_id(ticket_id)?;
        let engine = self.engine;
        let now = self.clock.now();

        let (before, after) = self.store.with_ticket_lock(ticket_id, |store| -> ServiceResult<_> {
            let current = store
                .get::<Ticket>(ticket_id)?
                .ok_or_else(|| ServiceError::NotFound {
                    ticket_id: ticket_id.to_string(),
                })?;

            let mut next = engine.apply_status_change(&current, status, assignee, now)?;
            if next != current {
                next.updated_at = revision_stamp(&current, now);
                store.update(next.clone())?;
            }
            Ok((current, next))
        })?;

        info!(
            ticket_id,
            actor_id = %caller.id,
            from = %before.status,
            to = %after.status,
            assignee_id = ?after.assignee_id,
            "Ticket status updated"
        );

        if let Some(assignee_id) = &after.assignee_id
            && before.assignee_id.as_ref() != Some(assignee_id)
        {
            self.notifier.assigned(&after, assignee_id);
        }

        Ok(after)
    }

    /// Pause or resume the work clock of a ticket
    pub fn toggle_timer(&mut self, ticket_id: &str, request: &TimerToggleRequest) -> ServiceResult<Ticket> {
        let action: TimerAction = request.action.parse()?;

        ensure_lookup_id(ticket_id)?;
        let engine = self.engine;
        let now = self.clock.now();

        let ticket = self.store.with_ticket_lock(ticket_id, |store| -> ServiceResult<_> {
            let current = store
                .get::<Ticket>(ticket_id)?
                .ok_or_else(|| ServiceError::NotFound {
                    ticket_id: ticket_id.to_string(),
                })?;

            let mut next = engine.apply_timer_toggle(&current, action, now)?;
            if next != current {
                next.updated_at = revision_stamp(&current, now);
                store.update(next.clone())?;
            }
            Ok(next)
        })?;

        info!(
            ticket_id,
            %action,
            timer_paused = ticket.timer_paused,
            total_paused_seconds = ticket.total_paused_seconds,
            "Ticket timer toggled"
        );

        Ok(ticket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::engine::TimerRejection;
    use chrono::{Duration, TimeZone};
    use std::cell::{Cell, RefCell};
    use tempfile::TempDir;

    struct TestClock(Cell<DateTime<Utc>>);

    impl TestClock {
        fn at(instant: DateTime<Utc>) -> Self {
            Self(Cell::new(instant))
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> DateTime<Utc> {
            self.0.get()
        }
    }

    #[derive(Default)]
    struct RecordingNotifier(RefCell<Vec<(String, String)>>);

    impl Notifier for RecordingNotifier {
        fn assigned(&self, ticket: &Ticket, assignee_id: &str) {
            self.0.borrow_mut().push((ticket.id.clone(), assignee_id.to_string()));
        }
    }

    type TestService = TicketService<StaticDirectory, RecordingNotifier, TestClock>;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap()
    }

    fn setup(temp: &TempDir) -> (TestService, String) {
        let mut store = Store::open(temp.path()).unwrap();
        let ticket = Ticket::new("Cannot reach intranet", "carol", t0() - Duration::hours(2));
        let id = store.create(ticket).unwrap();

        let directory = StaticDirectory::new().with_admin("ops").with_admin("lead").with_member("carol");
        let service = TicketService::with_parts(store, directory, RecordingNotifier::default(), TestClock::at(t0()));
        (service, id)
    }

    fn advance(service: &TestService, minutes: i64) {
        let clock = &service.clock;
        clock.0.set(clock.0.get() + Duration::minutes(minutes));
    }

    fn assign(to: &str) -> StatusUpdateRequest {
        StatusUpdateRequest {
            status: None,
            assignee_id: Some(Some(to.to_string())),
        }
    }

    fn set_status(status: &str) -> StatusUpdateRequest {
        StatusUpdateRequest {
            status: Some(status.to_string()),
            assignee_id: None,
        }
    }

    fn toggle(action: &str) -> TimerToggleRequest {
        TimerToggleRequest {
            action: action.to_string(),
        }
    }

    #[test]
    fn test_assignment_starts_clock_and_notifies() {
        let temp = TempDir::new().unwrap();
        let (mut service, id) = setup(&temp);
        let ops = Caller::new("ops");

        let ticket = service.update_status(&ops, &id, &assign("lead")).unwrap();
        assert_eq!(ticket.status, TicketStatus::InProgress);
        assert_eq!(ticket.in_progress_at, Some(t0()));
        assert_eq!(ticket.updated_at, t0());

        let stored = service.get(&id).unwrap();
        assert_eq!(stored, ticket);
        assert_eq!(*service.notifier().0.borrow(), vec![(id.clone(), "lead".to_string())]);

        // Re-assigning the same actor is not a new assignment
        service.update_status(&ops, &id, &assign("lead")).unwrap();
        assert_eq!(service.notifier().0.borrow().len(), 1);
    }

    #[test]
    fn test_full_lifecycle_reports_worked_minutes() {
        let temp = TempDir::new().unwrap();
        let (mut service, id) = setup(&temp);
        let ops = Caller::new("ops");

        service.update_status(&ops, &id, &set_status("IN_PROGRESS")).unwrap();
        advance(&service, 10);
        service.toggle_timer(&id, &toggle("pause")).unwrap();
        advance(&service, 4);
        service.toggle_timer(&id, &toggle("resume")).unwrap();
        advance(&service, 6);
        let resolved = service.update_status(&ops, &id, &set_status("RESOLVED")).unwrap();

        assert_eq!(resolved.time_spent_minutes, Some(16));
        assert_eq!(resolved.total_paused_seconds, 240);
        assert!(!resolved.timer_paused);
        assert_eq!(service.get(&id).unwrap(), resolved);
    }

    #[test]
    fn test_non_admin_is_forbidden() {
        let temp = TempDir::new().unwrap();
        let (mut service, id) = setup(&temp);

        let err = service
            .update_status(&Caller::new("carol"), &id, &set_status("CLOSED"))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden { .. }));
        assert_eq!(err.status_code(), 403);
        assert_eq!(service.get(&id).unwrap().status, TicketStatus::Open);
    }

    #[test]
    fn test_missing_ticket_is_not_found() {
        let temp = TempDir::new().unwrap();
        let (mut service, _) = setup(&temp);

        let err = service
            .update_status(&Caller::new("ops"), "no-such-ticket", &set_status("CLOSED"))
            .unwrap_err();
        assert_eq!(err.status_code(), 404);

        let err = service.toggle_timer("no-such-ticket", &toggle("pause")).unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { .. }));
    }

    #[test]
    fn test_unlockable_id_is_not_found() {
        let temp = TempDir::new().unwrap();
        let (mut service, _) = setup(&temp);

        let err = service
            .update_status(&Caller::new("ops"), "no.such.ticket", &set_status("CLOSED"))
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { .. }));
        assert_eq!(err.status_code(), 404);

        let err = service.toggle_timer("../no-such-ticket", &toggle("pause")).unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_resolution_survives_clock_step_back_and_rebuild() {
        let temp = TempDir::new().unwrap();
        let (mut service, id) = setup(&temp);
        let ops = Caller::new("ops");

        let started = service.update_status(&ops, &id, &set_status("IN_PROGRESS")).unwrap();
        advance(&service, -1);
        let resolved = service.update_status(&ops, &id, &set_status("RESOLVED")).unwrap();

        assert!(resolved.updated_at > started.updated_at);
        assert_eq!(resolved.time_spent_minutes, Some(0));
        assert_eq!(resolved.resolved_at, Some(t0() - Duration::minutes(1)));

        drop(service);
        std::fs::remove_file(temp.path().join(".helpdesk").join("helpdesk.db")).unwrap();

        let store = Store::open(temp.path()).unwrap();
        let rebuilt: Ticket = store.get(&id).unwrap().unwrap();
        assert_eq!(rebuilt.status, TicketStatus::Resolved);
        assert_eq!(rebuilt.time_spent_minutes, Some(0));
        assert_eq!(rebuilt.resolved_at, Some(t0() - Duration::minutes(1)));
        assert_eq!(rebuilt, resolved);
    }

    #[test]
    fn test_explicit_status_wins_over_assignment_start() {
        let temp = TempDir::new().unwrap();
        let (mut service, id) = setup(&temp);

        let request = StatusUpdateRequest {
            status: Some("RESOLVED".to_string()),
            assignee_id: Some(Some("lead".to_string())),
        };
        let ticket = service.update_status(&Caller::new("ops"), &id, &request).unwrap();

        assert_eq!(ticket.status, TicketStatus::Resolved);
        assert_eq!(ticket.assignee_id.as_deref(), Some("lead"));
        assert_eq!(ticket.in_progress_at, None);
        assert_eq!(ticket.time_spent_minutes, None);
        assert_eq!(ticket.resolved_at, Some(t0()));
        assert_eq!(service.get(&id).unwrap(), ticket);
        assert_eq!(*service.notifier().0.borrow(), vec![(id.clone(), "lead".to_string())]);
    }

    #[test]
    fn test_ineligible_assignee_is_bad_request() {
        let temp = TempDir::new().unwrap();
        let (mut service, id) = setup(&temp);

        let err = service.update_status(&Caller::new("ops"), &id, &assign("carol")).unwrap_err();
        assert!(matches!(err, ServiceError::Engine(EngineError::InvalidAssignee { .. })));
        assert_eq!(err.status_code(), 400);

        let stored = service.get(&id).unwrap();
        assert!(stored.assignee_id.is_none());
        assert_eq!(stored.status, TicketStatus::Open);
        assert!(service.notifier().0.borrow().is_empty());
    }

    #[test]
    fn test_unknown_status_is_bad_request() {
        let temp = TempDir::new().unwrap();
        let (mut service, id) = setup(&temp);

        let err = service
            .update_status(&Caller::new("ops"), &id, &set_status("ARCHIVED"))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Engine(EngineError::InvalidState(_))));
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_timer_rejected_on_open_ticket() {
        let temp = TempDir::new().unwrap();
        let (mut service, id) = setup(&temp);

        let err = service.toggle_timer(&id, &toggle("pause")).unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Engine(EngineError::InvalidTimerState {
                reason: TimerRejection::NotInProgress(TicketStatus::Open),
                ..
            })
        ));
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_noop_toggle_does_not_rewrite_ticket() {
        let temp = TempDir::new().unwrap();
        let (mut service, id) = setup(&temp);

        service.update_status(&Caller::new("ops"), &id, &assign("ops")).unwrap();
        advance(&service, 1);
        let resumed = service.toggle_timer(&id, &toggle("resume")).unwrap();

        // Nothing changed, so updated_at still reflects the assignment
        assert_eq!(resumed.updated_at, t0());
    }

    #[test]
    fn test_unassign_via_null() {
        let temp = TempDir::new().unwrap();
        let (mut service, id) = setup(&temp);
        let ops = Caller::new("ops");

        service.update_status(&ops, &id, &assign("lead")).unwrap();
        let request: StatusUpdateRequest = serde_json::from_str(r#"{"assigneeId": null}"#).unwrap();
        let ticket = service.update_status(&ops, &id, &request).unwrap();

        assert!(ticket.assignee_id.is_none());
        assert_eq!(ticket.status, TicketStatus::InProgress);
    }

    #[test]
    fn test_request_deserialization() {
        let absent: StatusUpdateRequest = serde_json::from_str(r#"{"status": "RESOLVED"}"#).unwrap();
        assert_eq!(absent.status.as_deref(), Some("RESOLVED"));
        assert_eq!(absent.assignee_id, None);

        let null: StatusUpdateRequest = serde_json::from_str(r#"{"assigneeId": null}"#).unwrap();
        assert_eq!(null.assignee_id, Some(None));

        let set: StatusUpdateRequest = serde_json::from_str(r#"{"assigneeId": "ops"}"#).unwrap();
        assert_eq!(set.assignee_id, Some(Some("ops".to_string())));

        let toggle: TimerToggleRequest = serde_json::from_str(r#"{"action": "pause"}"#).unwrap();
        assert_eq!(toggle.action, "pause");
    }
}
