//! Robot aggregate: identity, signer key, zone, availability, health.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::Event;
use crate::model::ReduceError;
use crate::model::event::TimeWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotStatus {
    Active,
    Quarantined,
    Retired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Robot {
    pub robot_id: String,
    pub zone: String,
    pub signer_key_id: String,
    pub public_key: String,
    pub status: RobotStatus,
    pub trust_score: i64,
    pub available: bool,
    pub availability_window: Option<TimeWindow>,
    /// Timestamps of recent stall attributions, for the health worker's
    /// stalls-per-hour rule.
    pub recent_stalls: Vec<DateTime<Utc>>,
    pub incident_severities: Vec<u8>,
    pub safety_incident_count: u32,
}

impl Robot {
    pub fn stalls_within_hour(&self, now: DateTime<Utc>) -> usize {
        self.recent_stalls
            .iter()
            .filter(|t| (now - **t).num_minutes() < 60)
            .count()
    }
}

pub fn reduce(events: &[Event]) -> Result<Robot, ReduceError> {
    use crate::model::event::EventBody as B;

    let first = events.first().ok_or(ReduceError::EmptyStream)?;
    let B::RobotRegistered {
        robot_id,
        zone,
        signer_key_id,
        public_key,
        trust_score,
    } = &first.body
    else {
        return Err(ReduceError::BadFirstEvent {
            expected: "ROBOT_REGISTERED",
            got: first.type_str(),
        });
    };

    let mut robot = Robot {
        robot_id: robot_id.clone(),
        zone: zone.clone(),
        signer_key_id: signer_key_id.clone(),
        public_key: public_key.clone(),
        status: RobotStatus::Active,
        trust_score: *trust_score,
        available: false,
        availability_window: None,
        recent_stalls: Vec::new(),
        incident_severities: Vec::new(),
        safety_incident_count: 0,
    };

    for event in &events[1..] {
        match &event.body {
            B::RobotRegistered { .. } => {
                return Err(ReduceError::IllegalTransition {
                    event_type: event.type_str(),
                    status: "registered".into(),
                });
            }
            B::RobotAvailabilitySet { available, window } => {
                robot.available = *available;
                robot.availability_window = *window;
            }
            B::RobotStatusChanged { status } => {
                robot.status = match status.as_str() {
                    "active" => RobotStatus::Active,
                    "quarantined" => RobotStatus::Quarantined,
                    "retired" => RobotStatus::Retired,
                    _ => {
                        return Err(ReduceError::IllegalTransition {
                            event_type: event.type_str(),
                            status: status.clone(),
                        });
                    }
                };
            }
            B::RobotQuarantined { .. } => {
                robot.status = RobotStatus::Quarantined;
                robot.available = false;
            }
            B::RobotReinstated { .. } => {
                if robot.status != RobotStatus::Quarantined {
                    return Err(ReduceError::IllegalTransition {
                        event_type: event.type_str(),
                        status: "active".into(),
                    });
                }
                robot.status = RobotStatus::Active;
            }
            // Health-relevant job facts are mirrored onto the robot stream by
            // the workers that observe them.
            B::JobExecutionStalled { .. } => {
                robot.recent_stalls.push(event.at);
            }
            B::IncidentReported { severity, kind, .. } => {
                robot.incident_severities.push(*severity);
                if kind.starts_with("safety") {
                    robot.safety_incident_count += 1;
                }
            }
            _ => {
                return Err(ReduceError::WrongAggregate {
                    event_type: event.type_str(),
                });
            }
        }
    }
    Ok(robot)
}
