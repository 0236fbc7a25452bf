//! MonthClose aggregate. Stream id format `month:{YYYY-MM}:{basis}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::Event;
use crate::model::ReduceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MonthStatus {
    Closed,
    Reopened,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthClose {
    pub month: String,
    pub basis: String,
    pub status: MonthStatus,
    pub statement_hash: Option<String>,
    pub finance_pack_hash: Option<String>,
    pub disclosure: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
}

pub fn stream_id(month: &str, basis: &str) -> String {
    format!("month:{month}:{basis}")
}

pub fn reduce(events: &[Event]) -> Result<MonthClose, ReduceError> {
    use crate::model::event::EventBody as B;

    let first = events.first().ok_or(ReduceError::EmptyStream)?;
    let B::MonthClosed {
        month,
        basis,
        statement_hash,
        finance_pack_hash,
        disclosure,
    } = &first.body
    else {
        return Err(ReduceError::BadFirstEvent {
            expected: "MONTH_CLOSED",
            got: first.type_str(),
        });
    };

    let mut mc = MonthClose {
        month: month.clone(),
        basis: basis.clone(),
        status: MonthStatus::Closed,
        statement_hash: Some(statement_hash.clone()),
        finance_pack_hash: Some(finance_pack_hash.clone()),
        disclosure: disclosure.clone(),
        closed_at: Some(first.at),
    };

    for event in &events[1..] {
        match &event.body {
            B::MonthClosed {
                statement_hash,
                finance_pack_hash,
                disclosure,
                ..
            } => {
                if mc.status != MonthStatus::Reopened {
                    return Err(ReduceError::IllegalTransition {
                        event_type: event.type_str(),
                        status: "CLOSED".into(),
                    });
                }
                mc.status = MonthStatus::Closed;
                mc.statement_hash = Some(statement_hash.clone());
                mc.finance_pack_hash = Some(finance_pack_hash.clone());
                mc.disclosure = disclosure.clone();
                mc.closed_at = Some(event.at);
            }
            B::MonthCloseReopened { .. } => {
                if mc.status != MonthStatus::Closed {
                    return Err(ReduceError::IllegalTransition {
                        event_type: event.type_str(),
                        status: "REOPENED".into(),
                    });
                }
                mc.status = MonthStatus::Reopened;
            }
            _ => {
                return Err(ReduceError::WrongAggregate {
                    event_type: event.type_str(),
                });
            }
        }
    }
    Ok(mc)
}
