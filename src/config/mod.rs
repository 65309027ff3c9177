// src/config/mod.rs

//! Configuration loading: JSON profiles, selection, validation.

pub mod loader;
pub mod model;

pub use loader::{load_from_path, load_profile};
pub use model::{AuthToken, ListenConfig, Profile, RawConfigFile, TlsConfig};
