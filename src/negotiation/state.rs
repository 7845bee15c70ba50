use serde::{Deserialize, Serialize};

/// Состояние слота единственного пира.
///
/// `Idle → AwaitingLocalMedia → Offering → AwaitingAnswer → Established` для
/// offerer'а, `Idle → Answering → Established` для answerer'а, и
/// `Closing → Closed` из любого состояния при уходе пира или выходе.
/// `Closed` принимает новый peer-joined так же, как `Idle`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationState {
    #[default]
    Idle,
    AwaitingLocalMedia,
    Offering,
    AwaitingAnswer,
    Answering,
    Established,
    Closing,
    Closed,
}

impl NegotiationState {
    /// Слот свободен для нового рукопожатия
    pub fn is_vacant(self) -> bool {
        matches!(self, NegotiationState::Idle | NegotiationState::Closed)
    }
}
