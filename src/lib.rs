//! Core library for the shot engine.
//!
//! Coordinates independently running hardware-device controllers through a
//! multi-phase experiment cycle: arm each device for a buffered run, trigger
//! the run, wait for completion, return every device to manual mode, then
//! hand the shot off for analysis and optionally repeat.

pub mod callbacks;
pub mod config;
pub mod controller;
pub mod error;
pub mod mode;
pub mod pipeline;
pub mod queue;
pub mod shot;
pub mod sim;
pub mod worker;
