//! Utility functions shared across the relay.

pub mod bootstrap;
pub mod retry;
