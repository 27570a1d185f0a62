//! Runtime system
//!
//! This module contains the cooperative job scheduler.

pub mod scheduler;
