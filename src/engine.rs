// Ticket lifecycle and time-tracking engine
//
// Pure decision logic: every call takes a snapshot plus an injected `now` and
// returns a new snapshot. Callers load, invoke, and persist; the engine never
// touches storage or the system clock.

use crate::ticket::{Ticket, TicketStatus, seconds_between};
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Why a pause/resume request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerRejection {
    /// Ticket is not IN_PROGRESS
    NotInProgress(TicketStatus),
    /// Ticket is IN_PROGRESS but its start instant was never recorded
    ClockNotStarted,
}

impl fmt::Display for TimerRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerRejection::NotInProgress(status) => write!(f, "ticket is {}, not IN_PROGRESS", status),
            TimerRejection::ClockNotStarted => write!(f, "work clock was never started"),
        }
    }
}

/// Errors produced by the engine. None of them are transient.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("cannot toggle timer on ticket {ticket_id}: {reason}")]
    InvalidTimerState { ticket_id: String, reason: TimerRejection },

    #[error("actor {assignee_id} is not eligible to be assigned ticket {ticket_id}")]
    InvalidAssignee { ticket_id: String, assignee_id: String },

    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Pause or resume the work clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    Pause,
    Resume,
}

impl TimerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerAction::Pause => "pause",
            TimerAction::Resume => "resume",
        }
    }
}

impl fmt::Display for TimerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TimerAction {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pause" => Ok(TimerAction::Pause),
            "resume" => Ok(TimerAction::Resume),
            _ => Err(EngineError::InvalidState(format!("unknown timer action: {}", s))),
        }
    }
}

/// An assignee reference whose eligibility was already resolved by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssigneeRef {
    pub id: String,
    pub eligible: bool,
}

impl AssigneeRef {
    pub fn eligible(id: impl Into<String>) -> Self {
        Self { id: id.into(), eligible: true }
    }

    pub fn ineligible(id: impl Into<String>) -> Self {
        Self { id: id.into(), eligible: false }
    }
}

/// Assignment part of a status change request
///
/// `None` leaves the assignee unchanged, `Some(None)` unassigns.
pub type AssigneeChange = Option<Option<AssigneeRef>>;

/// Status state machine and working-time bookkeeping for one ticket at a time
#[derive(Debug, Clone, Copy, Default)]
pub struct TicketTimeEngine;

impl TicketTimeEngine {
    pub fn new() -> Self {
        Self
    }

    /// Apply a status and/or assignee change
    ///
    /// Assigning a new actor to an OPEN ticket with no explicit status starts
    /// progress in the same call. Entering RESOLVED or CLOSED straight from
    /// IN_PROGRESS computes `time_spent_minutes`; any other entry into a
    /// terminal state only stamps the terminal timestamp.
    pub fn apply_status_change(
        &self,
        ticket: &Ticket,
        requested_status: Option<TicketStatus>,
        requested_assignee: AssigneeChange,
        now: DateTime<Utc>,
    ) -> Result<Ticket, EngineError> {
        ticket.check_invariants()?;

        if let Some(Some(assignee)) = &requested_assignee
            && !assignee.eligible
        {
            return Err(EngineError::InvalidAssignee {
                ticket_id: ticket.id.clone(),
                assignee_id: assignee.id.clone(),
            });
        }

        let previous = ticket.status;
        let assigns_new_actor = matches!(
            &requested_assignee,
            Some(Some(assignee)) if ticket.assignee_id.as_deref() != Some(assignee.id.as_str())
        );

        let target = match requested_status {
            Some(status) => status,
            None if assigns_new_actor && previous == TicketStatus::Open => TicketStatus::InProgress,
            None => previous,
        };

        let mut next = ticket.clone();

        if target == TicketStatus::InProgress && next.in_progress_at.is_none() {
            next.in_progress_at = Some(now);
        }

        if target.is_terminal() {
            if previous == TicketStatus::InProgress
                && let Some(worked) = ticket.worked_seconds_at(now)
            {
                next.time_spent_minutes = Some(worked / 60);
            }

            match target {
                TicketStatus::Resolved if next.resolved_at.is_none() => next.resolved_at = Some(now),
                TicketStatus::Closed if next.closed_at.is_none() => next.closed_at = Some(now),
                _ => {}
            }
        }

        next.status = target;

        if let Some(assignee) = requested_assignee {
            next.assignee_id = assignee.map(|a| a.id);
        }

        debug!(
            ticket_id = %ticket.id,
            from = %previous,
            to = %target,
            time_spent_minutes = ?next.time_spent_minutes,
            "apply_status_change"
        );

        Ok(next)
    }

    /// Pause or resume the work clock of an IN_PROGRESS ticket
    ///
    /// Pausing a paused clock and resuming a running one are no-ops.
    pub fn apply_timer_toggle(
        &self,
        ticket: &Ticket,
        action: TimerAction,
        now: DateTime<Utc>,
    ) -> Result<Ticket, EngineError> {
        ticket.check_invariants()?;

        if ticket.status != TicketStatus::InProgress {
            return Err(EngineError::InvalidTimerState {
                ticket_id: ticket.id.clone(),
                reason: TimerRejection::NotInProgress(ticket.status),
            });
        }
        if ticket.in_progress_at.is_none() {
            return Err(EngineError::InvalidTimerState {
                ticket_id: ticket.id.clone(),
                reason: TimerRejection::ClockNotStarted,
            });
        }

        let mut next = ticket.clone();

        match (action, ticket.timer_paused_at) {
            (TimerAction::Pause, None) => {
                next.timer_paused = true;
                next.timer_paused_at = Some(now);
            }
            (TimerAction::Resume, Some(paused_at)) => {
                let paused = seconds_between(paused_at, now);
                next.total_paused_seconds = next.total_paused_seconds.saturating_add(paused);
                next.timer_paused = false;
                next.timer_paused_at = None;
            }
            // Already in the requested state
            _ => {}
        }

        debug!(
            ticket_id = %ticket.id,
            %action,
            timer_paused = next.timer_paused,
            total_paused_seconds = next.total_paused_seconds,
            "apply_timer_toggle"
        );

        Ok(next)
    }
}
