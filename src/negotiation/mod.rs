pub mod coordinator;
pub mod state;

pub use coordinator::{LinkChange, NegotiationCoordinator};
pub use state::NegotiationState;
