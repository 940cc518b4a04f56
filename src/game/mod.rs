//! Game simulation modules

pub mod combat;
pub mod r#match;
pub mod physics;
pub mod pickup;
pub mod projectile;
pub mod simulation;
pub mod snapshot;
pub mod world;

pub use r#match::{GameMatch, MatchHandle, MatchRegistry};

use crate::ws::protocol::ClientMsg;
use world::MoveInput;

/// Opaque player identifier, stable for the life of a connection
pub type PlayerId = String;

/// Validated player request queued for the tick loop
#[derive(Debug, Clone)]
pub struct Intent {
    pub player_id: PlayerId,
    pub kind: IntentKind,
    pub received_at: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntentKind {
    Join,
    Leave,
    Move(MoveInput),
    Shoot { aim_angle: f32 },
    Reload,
    DodgeRoll,
    Pickup { crate_id: String },
}

impl IntentKind {
    /// Convert a parsed client message into an intent.
    /// Messages with non-finite angles, and pings, produce nothing.
    pub fn from_client(msg: ClientMsg) -> Option<Self> {
        match msg {
            ClientMsg::Input {
                seq,
                up,
                down,
                left,
                right,
                sprint,
                aim_angle,
            } => aim_angle.is_finite().then_some(IntentKind::Move(MoveInput {
                up,
                down,
                left,
                right,
                sprint,
                aim_angle,
                seq,
            })),
            ClientMsg::Shoot { aim_angle } => {
                aim_angle.is_finite().then_some(IntentKind::Shoot { aim_angle })
            }
            ClientMsg::Reload => Some(IntentKind::Reload),
            ClientMsg::DodgeRoll => Some(IntentKind::DodgeRoll),
            ClientMsg::PickupAttempt { crate_id } => Some(IntentKind::Pickup { crate_id }),
            ClientMsg::LeaveMatch => Some(IntentKind::Leave),
            ClientMsg::Ping { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_finite_aim_is_dropped() {
        assert_eq!(IntentKind::from_client(ClientMsg::Shoot { aim_angle: f32::NAN }), None);
        assert_eq!(
            IntentKind::from_client(ClientMsg::Shoot { aim_angle: 0.5 }),
            Some(IntentKind::Shoot { aim_angle: 0.5 })
        );
    }

    #[test]
    fn pings_stay_at_the_boundary() {
        assert_eq!(IntentKind::from_client(ClientMsg::Ping { t: 1 }), None);
        assert_eq!(IntentKind::from_client(ClientMsg::LeaveMatch), Some(IntentKind::Leave));
    }
}
