//! Sim Supervisor: run-directory job supervision for simulation backends.

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod job;
pub mod protocol;
pub mod runner;
