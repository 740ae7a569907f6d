//! tutor-narrator-rs: paced transcript delivery with synchronized narration.

pub mod api;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod gate;
pub mod history;
pub mod merge;
pub mod message;
pub mod narration;
pub mod pacing;
pub mod playback;
pub mod queue;
pub mod synth;
pub mod watchdog;

#[cfg(test)]
mod testing;
