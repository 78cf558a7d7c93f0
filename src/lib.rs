//! A sidecar that bridges container-orchestrator pods onto a Slurm cluster.
//!
//! The sidecar accepts pod descriptors over HTTP, synthesizes one batch
//! script per pod that runs every container through `singularity exec`
//! inside a single Slurm allocation, submits it with `sbatch`, and projects
//! the scheduler's job state back as per-container statuses.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(missing_debug_implementations)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod exec;
pub mod pod;
pub mod registry;
pub mod script;
pub mod server;
pub mod slurm;
pub mod status;
pub mod timestamp;
pub mod volume;
pub mod workdir;
