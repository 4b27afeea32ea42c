//! Meter Agent: remote worker for meter portal automation.

pub mod agent;
pub mod channels;
pub mod config;
pub mod error;
pub mod identity;
pub mod logic;
pub mod worker;
