//! bbxfer Tests - Simulation, stress and integration tests for the work queues.
//!
//! Tests are organized by type:
//!
//! ## Test Organization
//!
//! **DST Tests** (`simulation_tests`): Seeded single-threaded dispatch
//! simulation with simulated time, checked against FIFO, throttle and
//! suspend properties.
//!
//! **Stress Tests** (`stress_tests`): Producers and transfer threads on real
//! OS threads contending for the same queues.
//!
//! **Integration Tests** (`manager_tests`): Manager, replenish task and
//! transfer threads running together in real time.
//!
//! **Support Modules**:
//! - `properties`: Property definitions (`FifoChecker`, rate bound, throttle flags)
//! - `scenarios`: `DispatchSimulation`, seeds and tracing setup
//!
//! ## Naming Conventions
//!
//! - DST tests: `test_dst_<component>_<scenario>`
//! - Stress tests: `test_stress_<scenario>`
//! - Integration tests: `test_<component>_<scenario>`
//! - Unit tests: Inline in each crate under `#[cfg(test)]`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod properties;
pub mod scenarios;


// Stress and integration test modules.
#[cfg(test)]
mod manager_tests;
