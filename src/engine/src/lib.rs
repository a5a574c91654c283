//! zeroimage engine - content-addressable OCI image composition.
//!
//! This crate builds OCI-compliant container images for single-binary
//! programs without a container runtime. It provides:
//!
//! - Deterministic tar construction with canonical headers
//! - Gzipped layer building with on-the-fly digest computation
//! - OCI Image Layout archive reading and writing
//! - A polymorphic image loader over archives and remote registries
//! - Registry pull and push over the OCI Distribution API
//!
//! # Architecture
//!
//! ```text
//! archive / registry ──▶ loader ──▶ Image ──▶ archive / registry
//!                                    ▲
//!                        tarbuild ──▶ layer
//! ```

pub mod archive;
pub mod digest;
pub mod error;
pub mod image;
pub mod layer;
pub mod loader;
pub mod platform;
pub mod registry;
pub mod spec;
pub mod tarbuild;

pub use digest::{Algorithm, Digest};
pub use error::{ImageError, Result};
pub use image::{BlobReader, BlobSource, Image, Index, IndexEntry, Layer};
pub use layer::LayerBuilder;
pub use loader::{load, Loader};
pub use registry::ImageReference;
pub use spec::{Descriptor, ImageConfig, MediaType, Platform};
