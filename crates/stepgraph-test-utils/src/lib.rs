//! Stub text generators and config fixtures shared by stepgraph tests.

pub mod fixtures;
pub mod generators;

pub use fixtures::{sample_config, temp_config, SAMPLE_CONFIG};
pub use generators::{Call, FailingGenerator, ScriptedGenerator};
