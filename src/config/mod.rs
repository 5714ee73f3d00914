//! Configuration module for callscribe
//!
//! Handles loading settings from TOML files and per-stage environment variables.

mod settings;

pub use settings::{
    GeneralSettings, QueueSettings, RecognitionSettings, ServerSettings, Settings, StageRoute,
    StorageSettings, TaggingSettings,
};
