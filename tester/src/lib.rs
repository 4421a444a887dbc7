//! Smoke-test runner
//!
//! Loads a topology document and drives named scenarios against a live test
//! environment. Scenarios are ordinary async functions over a
//! [`harness::TestEnvironment`], so the same code runs from the binary and
//! from tests with stubbed collaborators.

pub mod scenarios;

pub use scenarios::{run_scenario, Scenario, ScenarioOutcome};
