//! Shared domain types for the Vigil monitoring pipeline.

pub mod config;
pub mod detection;
pub mod events;
pub mod frame;
pub mod shared;
pub mod status;

mod errors;

pub use errors::{Result, VigilError};
