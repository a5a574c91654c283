//! Gzipped layer construction with on-the-fly digest computation.
//!
//! A [`LayerBuilder`] wraps the tar builder so that the bytes of the
//! uncompressed archive and of its gzip encoding are hashed while they are
//! written, producing both the layer digest and the diff ID without a
//! second pass over the data.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::digest::{Algorithm, Hasher};
use crate::error::Result;
use crate::image::{Layer, MemoryBlob};
use crate::spec::{Descriptor, MediaType};
use crate::tarbuild::{self, Dir, File};

/// Forwards writes to a primary sink and mirrors them into a secondary one.
struct TeeWriter<A, B> {
    primary: A,
    secondary: B,
}

impl<A: Write, B: Write> TeeWriter<A, B> {
    fn new(primary: A, secondary: B) -> TeeWriter<A, B> {
        TeeWriter { primary, secondary }
    }

    fn into_parts(self) -> (A, B) {
        (self.primary, self.secondary)
    }
}

impl<A: Write, B: Write> Write for TeeWriter<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.primary.write(buf)?;
        self.secondary.write_all(&buf[..n])?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.primary.flush()?;
        self.secondary.flush()
    }
}

// The tar stream is teed into the diff-ID hash and the gzip encoder; the
// encoder's output is teed into the layer-digest hash and an in-memory
// buffer that later backs the layer's blob source.
type LayerSink = TeeWriter<GzEncoder<TeeWriter<Vec<u8>, Hasher>>, Hasher>;

/// Builds one compressed filesystem layer in memory.
pub struct LayerBuilder {
    tar: tarbuild::Builder<LayerSink>,
}

impl LayerBuilder {
    pub fn new() -> LayerBuilder {
        let gzip_hash = Algorithm::CANONICAL.hasher();
        let tar_hash = Algorithm::CANONICAL.hasher();
        let encoder = GzEncoder::new(
            TeeWriter::new(Vec::new(), gzip_hash),
            Compression::default(),
        );
        LayerBuilder {
            tar: tarbuild::Builder::new(TeeWriter::new(encoder, tar_hash)),
        }
    }

    /// See [`tarbuild::Builder::set_default_mod_time`].
    pub fn set_default_mod_time(&mut self, mod_time: SystemTime) {
        self.tar.set_default_mod_time(mod_time);
    }

    /// See [`tarbuild::Builder::add`].
    pub fn add<R: Read>(&mut self, path: &str, file: File<R>) -> Result<()> {
        self.tar.add(path, file)
    }

    /// See [`tarbuild::Builder::add_dir`].
    pub fn add_dir(&mut self, path: &str, dir: Dir) -> Result<()> {
        self.tar.add_dir(path, dir)
    }

    /// See [`tarbuild::Builder::add_content`].
    pub fn add_content(&mut self, path: &str, content: &[u8]) -> Result<()> {
        self.tar.add_content(path, content)
    }

    /// Close the tar stream, then the gzip stream, finalize both hashes,
    /// and return the finished layer.
    pub fn finish(self) -> Result<Layer> {
        let mut tar = self.tar;
        tar.finish()?;
        let sink = tar.into_inner()?;

        let (encoder, tar_hash) = sink.into_parts();
        let compressed = encoder.finish()?;
        let (buffer, gzip_hash) = compressed.into_parts();

        let digest = gzip_hash.finalize();
        let size = buffer.len() as i64;
        Ok(Layer::new(
            Descriptor {
                media_type: MediaType::ImageLayerGzip,
                digest,
                size,
                platform: None,
                annotations: None,
            },
            tar_hash.finalize(),
            Arc::new(MemoryBlob::new(Bytes::from(buffer))),
        ))
    }
}

impl Default for LayerBuilder {
    fn default() -> Self {
        LayerBuilder::new()
    }
}
