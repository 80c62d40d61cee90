//! AST labeler - speech/music/noise labelling with an Audio Spectrogram Transformer
//!
//! The library backs the three `ast-labeler` subcommands: exporting a pretrained
//! checkpoint to a self-describing artifact, serving that artifact over HTTP,
//! and labelling audio files against the service.

/// Pretrained checkpoint download and state dict handling
pub mod checkpoint;
/// Directory walking and per-file labelling client
pub mod client;
/// Configuration management
pub mod config;
/// Checkpoint to artifact export pipeline
pub mod export;
/// Audio decoding and filter-bank features
pub mod features;
/// AST network, labels and artifact format
pub mod model;
/// Batched HTTP labelling service
pub mod service;
/// Logging setup
pub mod telemetry;
