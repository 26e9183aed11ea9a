//! Sextant: a survey scheduler for a wide-field telescope.
//!
//! The [`driver::Driver`] is fed time, telemetry and conditions, ranks the
//! pointings its science proposals ask for against the cost of slewing the
//! observatory to them, and hands out one target at a time.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod driver;
pub mod logbook;
pub mod lookahead;
pub mod model;
pub mod observatory;
pub mod proposals;
pub mod sequencer;
pub mod sky;

#[cfg(test)]
mod testing;
