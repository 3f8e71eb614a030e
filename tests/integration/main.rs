//! Integration test suite entry point.

mod backup_tests;
mod cli_tests;
mod fixture;
mod orchestrator_tests;
