//! Durable store for the colony orchestration core.
//!
//! Owns the sqlite schema (tasks, runs, workers, plans, the unified
//! migration side tables), the row models, and the query functions the
//! service layer composes into transactions.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
