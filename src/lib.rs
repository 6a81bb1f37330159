#[macro_use]
extern crate rocket;

pub mod actions;
pub mod agent;
pub mod api;
pub mod approximator;
pub mod checkpoint;
pub mod clock;
pub mod coach;
pub mod config;
pub mod error;
pub mod features;
pub mod pending;
pub mod policy;
pub mod replay;
pub mod risk;
pub mod sweeper;

pub use crate::coach::Coach;
pub use crate::config::CoachConfig;
pub use crate::error::{CheckpointError, CoachError};
