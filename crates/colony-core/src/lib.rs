//! Task orchestration core for an autonomous multi-agent platform.
//!
//! Accepts units of work (tasks), routes them to capability-matched workers,
//! coordinates dependency-aware execution plans, drives phase-based
//! workflows through registered agents, and broadcasts lifecycle events.
//!
//! Components, leaves first: the store lives in `colony-db`; this crate adds
//! the event bus ([`event`]), the agent registry ([`agent`]), the task
//! repository ([`task`]), the worker service ([`worker`]), the plan engine
//! ([`plan`]), the workflow executor ([`workflow`]), and the [`client`]
//! facade application code talks to.
//!
//! # Dispatch rule
//!
//! A claim's `capability_filter` matches a task when it equals the task's
//! `task_type` or appears in its `tags`. The rule is deterministic: among
//! matching ready tasks the highest `(priority desc, created_at asc)` wins.
//!
//! # Delivery contract
//!
//! Execution is at-least-once: a worker that dies mid-run has its task
//! requeued, and the next claimant gets a fresh run number. Agents either
//! execute idempotently or deduplicate on the run number handed to them.

pub mod agent;
pub mod client;
pub mod error;
pub mod event;
pub mod plan;
pub mod task;
pub mod worker;
pub mod workflow;

pub use client::{Client, ClientOptions};
pub use error::{Error, ErrorKind, Result};
