//! The Assistant Turn Controller and its state machine (spec.md §4.1).

pub mod controller;
pub mod state;

pub use controller::AssistantTurnController;
pub use state::{StreamingState, SubmitOptions, TurnPhase};
