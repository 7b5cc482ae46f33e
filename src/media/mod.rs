//! Stateless media helpers: source fingerprints and encoder command lines

pub mod fingerprint;
pub mod transcoder;

pub use fingerprint::{Fingerprint, MANIFEST_EXTENSION};
pub use transcoder::{CommandError, DEFAULT_ENCODER_COMMAND, TranscodeCommand};
