//! Redis hot-key observation engine.
//!
//! Two cooperating components on a single host: a packet-capture probe that
//! extracts `(command, first_argument)` per Redis request on a live
//! interface, and an analyzer that drives probe runs over an observation
//! window, folds the produced record files into bounded top-K aggregates,
//! and reports the result to the control-plane API.

pub mod analyzer;
pub mod config;
pub mod probe;
pub mod report;
