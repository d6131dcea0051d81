// Helpdesk - ticket lifecycle and time tracking over a SQLite+JSONL store

pub mod config;
pub mod directory;
pub mod engine;
pub mod filter;
pub mod jsonl;
pub mod record;
pub mod service;
pub mod store;
pub mod ticket;
pub mod user;

// Re-export main types for convenience
pub use config::Config;
pub use directory::{StaticDirectory, StoreDirectory, UserDirectory};
pub use engine::{AssigneeChange, AssigneeRef, EngineError, TicketTimeEngine, TimerAction, TimerRejection};
pub use filter::{Filter, FilterOp};
pub use record::{IndexValue, Record};
pub use service::{
    Caller, Clock, LogNotifier, Notifier, ServiceError, StatusUpdateRequest, SystemClock, TicketService,
    TimerToggleRequest,
};
pub use store::{Store, now_ms};
pub use ticket::{Ticket, TicketStatus};
pub use user::{Role, User};
