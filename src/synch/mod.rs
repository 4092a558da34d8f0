//! Synchronization primitives

pub mod queue;
