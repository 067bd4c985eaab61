//! Dispatcher implementations for Runtime
//!
//! - `orchestration`: locks instances and commits replay turns
//! - `worker`: executes activities with retries
//! - `timer`: releases due timers back to the orchestrator queue

mod orchestration;
mod timer;
mod worker;
