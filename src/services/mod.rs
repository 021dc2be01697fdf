pub mod inference;
pub mod ledger;
pub mod memory;
pub mod orchestrator;
pub mod queue;
pub mod storage;
pub mod validation;
