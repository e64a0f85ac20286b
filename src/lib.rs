//! ACARS datalink medium-access simulator.
//!
//! Aircraft and a ground station contend for a shared VHF datalink with
//! p-persistence CSMA, acknowledge each other's messages and fail over to a
//! backup channel. Agents can run autonomously on the embassy executor, be
//! stepped one discrete action at a time, or be replayed deterministically in
//! virtual time.

pub mod common;
pub mod simulation;
pub mod time_driver;
