pub mod agent_run;
pub mod artifact;
pub mod event;
pub mod governance;
pub mod job;
pub mod month;
pub mod operator;
pub mod robot;
pub mod settlement;
pub mod wallet;

use thiserror::Error;

/// Errors produced while folding an event stream into an aggregate.
#[derive(Debug, Error)]
pub enum ReduceError {
    #[error("empty stream")]
    EmptyStream,

    #[error("stream must start with {expected}, got {got}")]
    BadFirstEvent { expected: &'static str, got: String },

    #[error("event {event_type} is illegal in status {status}")]
    IllegalTransition { event_type: String, status: String },

    #[error("event {event_type} does not belong to this aggregate")]
    WrongAggregate { event_type: String },

    #[error("heartbeat from robot {got}, reservation holds {expected}")]
    WrongRobot { expected: String, got: String },

    #[error("job already holds reservation {reservation_id}")]
    DuplicateReservation { reservation_id: String },

    #[error("{what} required before {event_type}")]
    MissingPrerequisite {
        what: &'static str,
        event_type: String,
    },
}

impl ReduceError {
    pub fn code(&self) -> &'static str {
        match self {
            ReduceError::EmptyStream => "EMPTY_STREAM",
            ReduceError::BadFirstEvent { .. } => "BAD_FIRST_EVENT",
            ReduceError::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            ReduceError::WrongAggregate { .. } => "WRONG_AGGREGATE",
            ReduceError::WrongRobot { .. } => "WRONG_ROBOT",
            ReduceError::DuplicateReservation { .. } => "DUPLICATE_RESERVATION",
            ReduceError::MissingPrerequisite { .. } => "MISSING_PREREQUISITE",
        }
    }
}
