//! Mixdown infrastructure: the cpal hardware backend

pub mod audio;

pub use audio::{CpalBackend, CpalStream};
