//! Swap coordination
//!
//! - `coordinator`: the lifecycle operations (register, sign, finalize, reconcile)
//! - `engine`: timers that run the sweep, reconciliation and co-signing passes

pub mod coordinator;
pub mod engine;

pub use coordinator::{
    FinalizeOutcome, PassReport, ReconcileOutcome, RegisterOutcome, SignatureOutcome,
    SwapCoordinator,
};
pub use engine::{CoordinationEngine, LocalSigner};
