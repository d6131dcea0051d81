// Ticket data model

use crate::engine::EngineError;
use crate::record::{IndexValue, Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Lifecycle stage of a ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Open,
    InProgress,
    Resolved,
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Open => "OPEN",
            TicketStatus::InProgress => "IN_PROGRESS",
            TicketStatus::Resolved => "RESOLVED",
            TicketStatus::Closed => "CLOSED",
        }
    }

    /// Resolved and closed tickets no longer accumulate working time
    pub fn is_terminal(&self) -> bool {
        matches!(self, TicketStatus::Resolved | TicketStatus::Closed)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "OPEN" => Ok(TicketStatus::Open),
            "IN_PROGRESS" => Ok(TicketStatus::InProgress),
            "RESOLVED" => Ok(TicketStatus::Resolved),
            "CLOSED" => Ok(TicketStatus::Closed),
            _ => Err(EngineError::InvalidState(format!("unknown ticket status: {}", s))),
        }
    }
}

/// A support ticket together with its time-tracking state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub title: String,
    pub created_by: String,
    pub status: TicketStatus,
    pub assignee_id: Option<String>,
    pub in_progress_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub timer_paused: bool,
    pub timer_paused_at: Option<DateTime<Utc>>,
    pub total_paused_seconds: u64,
    pub time_spent_minutes: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    /// Create a fresh OPEN ticket with an idle clock
    pub fn new(title: impl Into<String>, created_by: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            title: title.into(),
            created_by: created_by.into(),
            status: TicketStatus::Open,
            assignee_id: None,
            in_progress_at: None,
            resolved_at: None,
            closed_at: None,
            timer_paused: false,
            timer_paused_at: None,
            total_paused_seconds: 0,
            time_spent_minutes: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reject snapshots whose pause flag and pause timestamp disagree
    pub fn check_invariants(&self) -> Result<(), EngineError> {
        match (self.timer_paused, self.timer_paused_at) {
            (true, None) => Err(EngineError::InvalidState(format!(
                "ticket {} is paused without a pause timestamp",
                self.id
            ))),
            (false, Some(_)) => Err(EngineError::InvalidState(format!(
                "ticket {} has a pause timestamp but is not paused",
                self.id
            ))),
            _ => Ok(()),
        }
    }

    /// Seconds spent in the pause currently in flight, evaluated at `now`
    pub fn in_flight_pause_seconds(&self, now: DateTime<Utc>) -> u64 {
        match (self.timer_paused, self.timer_paused_at) {
            (true, Some(paused_at)) => seconds_between(paused_at, now),
            _ => 0,
        }
    }

    /// Working seconds between entering progress and `now`, minus every pause
    ///
    /// Returns `None` if the ticket never entered progress. Never negative.
    pub fn worked_seconds_at(&self, now: DateTime<Utc>) -> Option<u64> {
        let started = self.in_progress_at?;
        let elapsed = (now - started).num_seconds();
        let paused = self
            .total_paused_seconds
            .saturating_add(self.in_flight_pause_seconds(now));
        let paused = i64::try_from(paused).unwrap_or(i64::MAX);
        Some(elapsed.saturating_sub(paused).max(0) as u64)
    }
}

/// Whole seconds from `start` to `end`, clamped to zero when the clock runs backward
pub fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_seconds().max(0) as u64
}

impl Record for Ticket {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at.timestamp_millis()
    }

    fn collection_name() -> &'static str {
        "tickets"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(self.status.as_str().to_string()));
        if let Some(assignee) = &self.assignee_id {
            fields.insert("assignee_id".to_string(), IndexValue::String(assignee.clone()));
        }
        fields.insert("timer_paused".to_string(), IndexValue::Bool(self.timer_paused));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_new_ticket_is_open_and_idle() {
        let ticket = Ticket::new("Printer on fire", "alice", t0());
        assert_eq!(ticket.status, TicketStatus::Open);
        assert!(ticket.in_progress_at.is_none());
        assert!(!ticket.timer_paused);
        assert_eq!(ticket.total_paused_seconds, 0);
        assert!(ticket.time_spent_minutes.is_none());
        assert!(ticket.check_invariants().is_ok());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TicketStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");

        let status: TicketStatus = serde_json::from_str("\"CLOSED\"").unwrap();
        assert_eq!(status, TicketStatus::Closed);
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!("open".parse::<TicketStatus>().unwrap(), TicketStatus::Open);
        assert_eq!("in-progress".parse::<TicketStatus>().unwrap(), TicketStatus::InProgress);
        assert_eq!("RESOLVED".parse::<TicketStatus>().unwrap(), TicketStatus::Resolved);

        let err = "archived".parse::<TicketStatus>().unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[test]
    fn test_check_invariants_rejects_mismatched_pause() {
        let mut ticket = Ticket::new("t", "alice", t0());
        ticket.timer_paused = true;
        assert!(ticket.check_invariants().is_err());

        ticket.timer_paused = false;
        ticket.timer_paused_at = Some(t0());
        assert!(ticket.check_invariants().is_err());
    }

    #[test]
    fn test_worked_seconds_clamps_to_zero() {
        let mut ticket = Ticket::new("t", "alice", t0());
        assert_eq!(ticket.worked_seconds_at(t0()), None);

        // Start recorded in the future relative to `now`
        ticket.in_progress_at = Some(t0() + Duration::minutes(5));
        assert_eq!(ticket.worked_seconds_at(t0()), Some(0));

        ticket.in_progress_at = Some(t0());
        ticket.total_paused_seconds = 10_000;
        assert_eq!(ticket.worked_seconds_at(t0() + Duration::minutes(1)), Some(0));
    }

    #[test]
    fn test_worked_seconds_counts_in_flight_pause() {
        let mut ticket = Ticket::new("t", "alice", t0());
        ticket.status = TicketStatus::InProgress;
        ticket.in_progress_at = Some(t0());
        ticket.total_paused_seconds = 60;
        ticket.timer_paused = true;
        ticket.timer_paused_at = Some(t0() + Duration::minutes(8));

        // 10 minutes elapsed, 1 banked + 2 in flight
        assert_eq!(ticket.worked_seconds_at(t0() + Duration::minutes(10)), Some(7 * 60));
    }

    #[test]
    fn test_indexed_fields() {
        let mut ticket = Ticket::new("t", "alice", t0());
        let fields = ticket.indexed_fields();
        assert_eq!(fields.get("status"), Some(&IndexValue::String("OPEN".to_string())));
        assert!(!fields.contains_key("assignee_id"));

        ticket.assignee_id = Some("bob".to_string());
        let fields = ticket.indexed_fields();
        assert_eq!(fields.get("assignee_id"), Some(&IndexValue::String("bob".to_string())));
        assert_eq!(fields.get("timer_paused"), Some(&IndexValue::Bool(false)));
    }
}
