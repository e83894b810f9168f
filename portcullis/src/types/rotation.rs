use crate::error::{AuthorityError, AuthorityResult};

use serde::{Deserialize, Serialize};

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationState {
    Standby,
    InProgress,
    Rollback,
}

/// Phases of a rotation. The order here is the order a rotation moves
/// through; rollback may be entered from any in-progress phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationPhase {
    /// No rotation is happening. Only the active keys are used.
    Standby,
    /// New keys are generated and trusted for verification only.
    Init,
    /// New keys sign, old keys are still trusted so clients can refresh.
    UpdateClients,
    /// Servers pick up certificates from the new keys. Old keys are still
    /// trusted.
    UpdateServers,
    /// The old keys are signing again and the new keys are trusted until
    /// the rollback completes.
    Rollback,
}

impl RotationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationPhase::Standby => "standby",
            RotationPhase::Init => "init",
            RotationPhase::UpdateClients => "update_clients",
            RotationPhase::UpdateServers => "update_servers",
            RotationPhase::Rollback => "rollback",
        }
    }

    /// The phase an automatic rotation moves to after this one.
    pub fn next(&self) -> Option<RotationPhase> {
        match self {
            RotationPhase::Init => Some(RotationPhase::UpdateClients),
            RotationPhase::UpdateClients => Some(RotationPhase::UpdateServers),
            RotationPhase::UpdateServers => Some(RotationPhase::Standby),
            RotationPhase::Rollback => Some(RotationPhase::Standby),
            RotationPhase::Standby => None,
        }
    }

    /// Whether moving from `self` to `to` is a legal transition.
    pub fn can_transition_to(&self, to: RotationPhase) -> bool {
        matches!(
            (self, to),
            (RotationPhase::Standby, RotationPhase::Init)
                | (RotationPhase::Init, RotationPhase::UpdateClients)
                | (RotationPhase::UpdateClients, RotationPhase::UpdateServers)
                | (RotationPhase::UpdateServers, RotationPhase::Standby)
                | (RotationPhase::Init, RotationPhase::Rollback)
                | (RotationPhase::UpdateClients, RotationPhase::Rollback)
                | (RotationPhase::UpdateServers, RotationPhase::Rollback)
                | (RotationPhase::Rollback, RotationPhase::Standby)
        )
    }
}

impl fmt::Display for RotationPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    Manual,
    Auto,
}

/// Unix timestamps at which an automatic rotation advances.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationSchedule {
    pub update_clients: u64,
    pub update_servers: u64,
    pub standby: u64,
}

impl RotationSchedule {
    /// Evenly split the grace period over the three phases.
    pub fn generate(started: u64, grace_period_seconds: u64) -> Self {
        let step = grace_period_seconds / 3;
        Self {
            update_clients: started + step,
            update_servers: started + 2 * step,
            standby: started + grace_period_seconds,
        }
    }

    pub fn check(&self) -> AuthorityResult<()> {
        if self.update_clients == 0 || self.update_servers == 0 || self.standby == 0 {
            return Err(AuthorityError::bad_parameter(
                "rotation schedule must set every phase",
            ));
        }
        if self.update_clients > self.update_servers || self.update_servers > self.standby {
            return Err(AuthorityError::bad_parameter(
                "rotation schedule phases must be in order",
            ));
        }
        Ok(())
    }

    /// When the given phase should be left.
    pub fn deadline(&self, phase: RotationPhase) -> Option<u64> {
        match phase {
            RotationPhase::Init => Some(self.update_clients),
            RotationPhase::UpdateClients => Some(self.update_servers),
            RotationPhase::UpdateServers => Some(self.standby),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rotation {
    pub state: RotationState,
    pub phase: RotationPhase,
    pub mode: RotationMode,
    /// Identifies the rotation in progress. Empty in standby.
    #[serde(default)]
    pub current_id: String,
    #[serde(default)]
    pub started: u64,
    #[serde(default)]
    pub grace_period_seconds: u64,
    #[serde(default)]
    pub last_rotated: u64,
    #[serde(default)]
    pub schedule: RotationSchedule,
}

impl Default for Rotation {
    fn default() -> Self {
        Self {
            state: RotationState::Standby,
            phase: RotationPhase::Standby,
            mode: RotationMode::Manual,
            current_id: String::new(),
            started: 0,
            grace_period_seconds: 0,
            last_rotated: 0,
            schedule: RotationSchedule::default(),
        }
    }
}

impl Rotation {
    pub fn is_in_progress(&self) -> bool {
        self.state != RotationState::Standby
    }

    /// Set the phase and derive the state from it.
    pub fn set_phase(&mut self, phase: RotationPhase) {
        self.phase = phase;
        self.state = match phase {
            RotationPhase::Standby => RotationState::Standby,
            RotationPhase::Rollback => RotationState::Rollback,
            _ => RotationState::InProgress,
        };
    }

    pub fn check(&self) -> AuthorityResult<()> {
        let consistent = match self.state {
            RotationState::Standby => self.phase == RotationPhase::Standby,
            RotationState::Rollback => self.phase == RotationPhase::Rollback,
            RotationState::InProgress => matches!(
                self.phase,
                RotationPhase::Init | RotationPhase::UpdateClients | RotationPhase::UpdateServers
            ),
        };
        if !consistent {
            return Err(AuthorityError::bad_parameter(format!(
                "rotation state {:?} does not match phase {}",
                self.state, self.phase
            )));
        }
        if self.is_in_progress() && self.current_id.is_empty() {
            return Err(AuthorityError::bad_parameter(
                "rotation in progress is missing its id",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_only_move_forward_or_roll_back() {
        use RotationPhase::*;
        assert!(Standby.can_transition_to(Init));
        assert!(!Standby.can_transition_to(UpdateClients));
        assert!(!UpdateServers.can_transition_to(Init));
        assert!(!Standby.can_transition_to(Rollback));
        assert!(UpdateClients.can_transition_to(Rollback));
        assert!(Rollback.can_transition_to(Standby));
    }

    #[test]
    fn state_follows_phase() {
        let mut rotation = Rotation::default();
        rotation.current_id = "r1".to_string();
        rotation.set_phase(RotationPhase::Rollback);
        assert_eq!(rotation.state, RotationState::Rollback);
        assert!(rotation.check().is_ok());
        rotation.state = RotationState::InProgress;
        assert!(rotation.check().is_err());
    }

    #[test]
    fn generated_schedule_is_ordered() {
        let schedule = RotationSchedule::generate(1_000, 3_000);
        assert!(schedule.check().is_ok());
        assert_eq!(schedule.standby, 4_000);
        assert_eq!(schedule.deadline(RotationPhase::Init), Some(2_000));
    }
}
