//! Signal-driven reconciliation strategy.
//!
//! - Signal parsing against a configurable action vocabulary
//! - Margin split and isolated subaccount assignment
//! - Safety close of unsignaled positions, then opening new ones
//! - Single-flight cycle orchestration

mod allocator;
mod cycle;
mod reconciler;
mod signal;

pub use allocator::{
    margin_per_trade, AllocationPlan, PlanStep, PlannedOrder, SkipReason, SubaccountAllocator,
};
pub use cycle::{CycleOutcome, CycleReport, CycleRunner};
pub use reconciler::{
    closing_side, ItemOutcome, ItemReport, Phase, PhaseReport, ReconciliationEngine,
};
pub use signal::{
    ActionVocabulary, ParseRejection, ParsedBatch, Rejection, Signal, SignalAction, SignalParser,
};
