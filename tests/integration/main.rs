//! Integration tests against the simulated broker

mod support;

mod chase_test;
mod emergency_test;
mod engine_test;
mod exit_test;
mod liquidation_test;
mod recovery_test;
