//! Command handling for the relay
//!
//! This module handles:
//! - Evaluating cloud commands against the sensor mode
//! - Writing the matching opcode to the sensor
//! - Generating acknowledgements for the cloud

mod dispatcher;

pub use dispatcher::CommandDispatcher;
