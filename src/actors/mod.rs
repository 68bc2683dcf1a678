//! Actor-based monitoring pipeline
//!
//! Every long-running part of the headend is an independent async task
//! communicating via Tokio channels. The only shared mutable state is the
//! [`crate::registry::DeviceRegistry`] with its per-device locks.
//!
//! ## Architecture Overview
//!
//! ```text
//!                      ┌─────────────────┐
//!                      │ Headend (main)  │
//!                      └────────┬────────┘
//!                               │ spawns
//!        ┌──────────────┬───────┴───────┬────────────────┐
//!        │              │               │                │
//! ┌──────▼───────┐ ┌────▼─────────┐ ┌───▼──────────┐ ┌───▼──────────┐
//! │ ProbeWorkers │ │Reconstructor │ │  Scheduler   │ │  Listeners   │
//! │ (1 per range)│ │ (flow table) │ │ (rank+fetch) │ │(upload, ctl) │
//! └──────┬───────┘ └────┬─────▲───┘ └───┬──────▲───┘ └───┬──────────┘
//!        │              │     │         │      │         │
//!        │ active       │     │ packets │      │ focus / │
//!        │ metrics      │     │ uploads │      │ stop    │
//!        │              │     └─────────┼──────┴─────────┘
//!        │   passive    │               │ reads availability,
//!        │   metrics    │               │ marks fetched/unavailable
//!        │              │               │
//!      ┌─▼──────────────▼───────────────▼─┐
//!      │          DeviceRegistry          │
//!      │        (per-device locks)        │
//!      └──────────────────────────────────┘
//! ```
//!
//! ## Actor Types
//!
//! - **ProbeEngine**: fixed worker tasks, each probing a disjoint slice of
//!   the device list
//! - **ReconstructorActor**: folds captured traffic into per-flow
//!   accumulators and derives passive metrics on upload events
//! - **SchedulerActor**: ranks devices by data staleness and link quality,
//!   then fetches their data
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: Each actor has an mpsc command channel for control messages
//! 2. **Events**: Successful fetches are announced on a broadcast channel
//! 3. **Request/Response**: oneshot channels for synchronous queries
//! 4. **Shutdown**: a shared watch flag observed by every loop

pub mod messages;
pub mod prober;
pub mod reconstructor;
pub mod scheduler;
