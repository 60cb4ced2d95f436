//! Realization level job scheduling for ensemble experiments.
//!
//! A [`scheduler::Scheduler`] supervises every realization of an ensemble on a
//! compute backend reached through a [`drivers::Driver`]: local processes, LSF,
//! OpenPBS or Slurm.

pub mod config;
pub mod drivers;
pub mod event;
pub mod realization;
pub mod scheduler;
