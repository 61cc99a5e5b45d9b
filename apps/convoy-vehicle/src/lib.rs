//! Vehicle node: streams telemetry and video toward the cockpit, applies
//! operator commands to the chassis, and falls back to an emergency stop
//! whenever connectivity degrades past the liveness threshold.

pub mod app;
pub mod config;
pub mod controller;
pub mod sensors;
