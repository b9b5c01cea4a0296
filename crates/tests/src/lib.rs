//! End-to-end tests for Patchbay

#[cfg(test)]
mod router_integration;
