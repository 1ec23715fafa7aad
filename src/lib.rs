//! Filer Core Library
//!
//! Stages a batch task's inputs in before it runs and its outputs out after
//! it finishes. A manifest lists the entities; each one names a local path,
//! a remote URL and whether it is a file or a directory tree.
//!
//! # Architecture
//!
//! - [`manifest`] - Annotation-file parsing into a typed [`TransferSet`]
//! - [`filer`] - Orchestration: markers, missing-output skips, mount retry
//! - [`transport`] - The per-scheme backends behind one [`Transport`] trait
//! - [`bandwidth`] - Adaptive rate control for object storage
//! - [`credentials`] - Static and rotating object storage credentials
//! - [`config`] - Environment and INI configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bandwidth;
pub mod checker;
pub mod config;
pub mod credentials;
pub mod error;
pub mod filer;
pub mod manifest;
pub mod marker;
pub mod retry;
pub mod transport;

#[cfg(test)]
pub mod test_support;

// Re-export commonly used types
pub use bandwidth::AdaptiveRateController;
pub use config::FilerConfig;
pub use error::{FilerError, FilerErrorKind};
pub use filer::{Filer, TransferStats};
pub use manifest::{RemoteUrl, Scheme, TransferEntity, TransferMode, TransferSet};
pub use marker::CompletionMarker;
pub use retry::MountRetryPolicy;
pub use transport::{
    DefaultTransportFactory, TransferContext, TransferError, Transport, TransportFactory,
    TransportRegistry,
};
