//! Operator aggregate: identity, shift, coverage capacity.

use serde::{Deserialize, Serialize};

use crate::chain::Event;
use crate::model::ReduceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorStatus {
    Active,
    Suspended,
    Retired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operator {
    pub operator_id: String,
    pub zones: Vec<String>,
    pub signer_key_id: String,
    pub public_key: String,
    pub status: OperatorStatus,
    pub on_shift: bool,
    pub shift_zone: Option<String>,
    pub max_concurrent: u32,
    pub hourly_rate_cents: i64,
}

impl Operator {
    pub fn covers_zone(&self, zone: &str) -> bool {
        self.on_shift && self.shift_zone.as_deref() == Some(zone) && self.zones.iter().any(|z| z == zone)
    }
}

pub fn reduce(events: &[Event]) -> Result<Operator, ReduceError> {
    use crate::model::event::EventBody as B;

    let first = events.first().ok_or(ReduceError::EmptyStream)?;
    let B::OperatorRegistered {
        operator_id,
        zones,
        signer_key_id,
        public_key,
        max_concurrent,
        hourly_rate_cents,
    } = &first.body
    else {
        return Err(ReduceError::BadFirstEvent {
            expected: "OPERATOR_REGISTERED",
            got: first.type_str(),
        });
    };

    let mut op = Operator {
        operator_id: operator_id.clone(),
        zones: zones.clone(),
        signer_key_id: signer_key_id.clone(),
        public_key: public_key.clone(),
        status: OperatorStatus::Active,
        on_shift: false,
        shift_zone: None,
        max_concurrent: *max_concurrent,
        hourly_rate_cents: *hourly_rate_cents,
    };

    for event in &events[1..] {
        match &event.body {
            B::OperatorRegistered { .. } => {
                return Err(ReduceError::IllegalTransition {
                    event_type: event.type_str(),
                    status: "registered".into(),
                });
            }
            B::OperatorShiftStarted { zone } => {
                if op.on_shift {
                    return Err(ReduceError::IllegalTransition {
                        event_type: event.type_str(),
                        status: "on_shift".into(),
                    });
                }
                op.on_shift = true;
                op.shift_zone = Some(zone.clone());
            }
            B::OperatorShiftEnded {} => {
                if !op.on_shift {
                    return Err(ReduceError::IllegalTransition {
                        event_type: event.type_str(),
                        status: "off_shift".into(),
                    });
                }
                op.on_shift = false;
                op.shift_zone = None;
            }
            B::OperatorStatusChanged { status } => {
                op.status = match status.as_str() {
                    "active" => OperatorStatus::Active,
                    "suspended" => OperatorStatus::Suspended,
                    "retired" => OperatorStatus::Retired,
                    _ => {
                        return Err(ReduceError::IllegalTransition {
                            event_type: event.type_str(),
                            status: status.clone(),
                        });
                    }
                };
            }
            _ => {
                return Err(ReduceError::WrongAggregate {
                    event_type: event.type_str(),
                });
            }
        }
    }
    Ok(op)
}
