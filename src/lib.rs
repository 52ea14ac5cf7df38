//! Extract Cisco refplat images and build vrnetlab containers from them.
//!
//! Cisco ships its virtual platform images inside reference-platform
//! containers (ZIP archives holding ISO 9660 images). This crate opens those
//! containers, classifies each member by platform and version, stages the
//! images into an output tree and into the vrnetlab checkout, and runs
//! `make docker-image` per platform.
//!
//! # Architecture
//!
//! ```text
//! pipeline
//!     │
//!     ├── archive    Container / MemberEntry over ZIP and ISO 9660
//!     ├── classify   ordered rule table -> PlatformIdentity
//!     ├── plan       ExtractionTask per classified member, latest wins
//!     ├── stage      .partial copy + sha256, builder hardlinks, manifest
//!     ├── build      BuildOrchestrator on a rayon pool, BuildOutcome per platform
//!     ├── lifecycle  LifecycleGuard: scratch dirs, cancellation, signals
//!     └── report     RunReport
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use refplat_builder::{pipeline, LifecycleGuard, RunConfig};
//!
//! let config = RunConfig::load(None)?;
//! let guard = LifecycleGuard::new();
//! let report = pipeline::run(&config, &guard)?;
//! print!("{}", report.summary());
//! ```

pub mod archive;
pub mod build;
pub mod classify;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod lifecycle;
pub mod pipeline;
pub mod plan;
pub mod preflight;
pub mod report;
pub mod stage;

pub use archive::{Container, ContainerFormat, MemberEntry, MemberPath};
pub use build::{BuildOutcome, BuildSkip, BuilderMap};
pub use classify::{ClassificationResult, Classifier, Platform, PlatformIdentity};
pub use config::RunConfig;
pub use error::Error;
pub use lifecycle::LifecycleGuard;
pub use report::RunReport;
