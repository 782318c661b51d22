//! Piece model, loading, and normalization (§4.2)

mod loader;
mod model;

pub use loader::{reachable_movements, PieceError, PieceLoader, PieceSource};
pub use model::{
    AggregateMode, Movement, MovementCommon, NextMovement, Piece, ProviderOptions, ReportSpec, Rule, RuleKind, Terminal,
};
