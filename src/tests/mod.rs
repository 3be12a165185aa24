//! Cross-component tests: the planner client against a mock HTTP server,
//! and end-to-end translation scenarios that span adapter + models.

mod planner_client_tests;
mod scenario_tests;
mod test_helpers;
