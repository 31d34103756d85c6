//! Shared framework for the per-project validators: the bounded worker
//! pool, workflow subprocess execution, execution-trace interpretation,
//! record submission and lifecycle helpers, artifact publication with
//! rollback, and result reporting. Each project validator wires these
//! pieces into its own state machine.

pub mod exec;
pub mod pool;
pub mod publish;
pub mod report;
pub mod submit;
pub mod trace;
