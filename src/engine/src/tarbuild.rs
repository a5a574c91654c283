//! An opinionated tape archive builder.
//!
//! All entries in the archive have clean relative paths and are owned by UID
//! and GID 0. Before writing an entry, the builder adds every parent
//! directory of the entry that has not yet been added, with mode 755 and the
//! builder's default modification time.
//!
//! If an operation fails, no more entries are written and the error is
//! returned again from [`Builder::finish`]. After a successful `finish` the
//! builder is closed and every further operation fails.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use tar::EntryType;

use crate::error::{ImageError, Result};

/// A regular file entry: a reader plus the header fields to record for it.
pub struct File<R> {
    pub reader: R,
    pub size: u64,
    pub mode: u32,
    pub mod_time: SystemTime,
}

/// An empty directory entry.
pub struct Dir {
    pub mode: u32,
    pub mod_time: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Regular,
    Directory,
}

/// Streaming tar builder over an arbitrary byte sink.
pub struct Builder<W: Write> {
    default_mod_time: SystemTime,
    inner: tar::Builder<W>,
    entries: HashMap<String, EntryKind>,
    err: Option<ImageError>,
    closed: bool,
}

impl<W: Write> Builder<W> {
    /// Create a builder writing a tar stream to `w`. The default
    /// modification time starts as the current time.
    pub fn new(w: W) -> Builder<W> {
        Builder {
            default_mod_time: SystemTime::now(),
            inner: tar::Builder::new(w),
            entries: HashMap::new(),
            err: None,
            closed: false,
        }
    }

    /// Modification time used for synthesized parent directories and for
    /// entries added with [`Builder::add_content`].
    pub fn set_default_mod_time(&mut self, mod_time: SystemTime) {
        self.default_mod_time = mod_time;
    }

    pub fn default_mod_time(&self) -> SystemTime {
        self.default_mod_time
    }

    /// Add a regular file at `path`, creating missing parent directories.
    ///
    /// The file's size, mode, and modification time are recorded as given;
    /// ownership is normalized to UID/GID 0.
    pub fn add<R: Read>(&mut self, path: &str, file: File<R>) -> Result<()> {
        self.check_open()?;
        self.try_add(path, file).map_err(|e| self.latch(e))
    }

    /// Add an empty directory entry at `path`.
    pub fn add_dir(&mut self, path: &str, dir: Dir) -> Result<()> {
        self.check_open()?;
        self.try_add_dir(path, dir).map_err(|e| self.latch(e))
    }

    /// Add `content` as a regular file with mode 644 and the builder's
    /// default modification time.
    pub fn add_content(&mut self, path: &str, content: &[u8]) -> Result<()> {
        let mod_time = self.default_mod_time;
        self.add(
            path,
            File {
                reader: content,
                size: content.len() as u64,
                mode: 0o644,
                mod_time,
            },
        )
    }

    /// Write the tar footer and close the builder. If any prior add failed,
    /// that error is returned instead.
    pub fn finish(&mut self) -> Result<()> {
        if self.closed {
            return Err(ImageError::BuilderClosed);
        }
        self.closed = true;
        if let Some(err) = self.err.take() {
            return Err(err);
        }
        self.inner.finish().map_err(ImageError::from)
    }

    /// Finish the archive if needed and return the underlying writer.
    pub fn into_inner(mut self) -> Result<W> {
        if !self.closed {
            self.finish()?;
        }
        self.inner.into_inner().map_err(ImageError::from)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(ImageError::BuilderClosed);
        }
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        Ok(())
    }

    fn latch(&mut self, err: ImageError) -> ImageError {
        self.err = Some(err.clone());
        err
    }

    fn try_add<R: Read>(&mut self, path: &str, file: File<R>) -> Result<()> {
        let np = normalize_path(path)?;
        if self.entries.contains_key(&np) {
            return Err(ImageError::DuplicateEntry { path: np });
        }
        self.entries.insert(np.clone(), EntryKind::Regular);
        self.ensure_parent_directory(&np)?;

        let mut limited = file.reader.take(file.size);
        self.write_header_and_data(
            &np,
            EntryType::Regular,
            file.size,
            file.mode,
            file.mod_time,
            &mut limited,
        )?;
        if limited.limit() > 0 {
            return Err(ImageError::Io(std::sync::Arc::new(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short read while adding {np}"),
            ))));
        }
        Ok(())
    }

    fn try_add_dir(&mut self, path: &str, dir: Dir) -> Result<()> {
        let np = normalize_path(path)?;
        if self.entries.contains_key(&np) {
            return Err(ImageError::DuplicateEntry { path: np });
        }
        self.entries.insert(np.clone(), EntryKind::Directory);
        self.ensure_parent_directory(&np)?;

        let name = format!("{np}/");
        self.write_header_and_data(
            &name,
            EntryType::Directory,
            0,
            dir.mode,
            dir.mod_time,
            &mut io::empty(),
        )
    }

    /// Write directory entries for every missing ancestor of `np`,
    /// shallowest first.
    fn ensure_parent_directory(&mut self, np: &str) -> Result<()> {
        let parent = match np.rfind('/') {
            Some(i) => &np[..i],
            None => return Ok(()),
        };

        if let Some(kind) = self.entries.get(parent) {
            if *kind != EntryKind::Directory {
                return Err(ImageError::DuplicateEntry {
                    path: parent.to_string(),
                });
            }
            // Whoever added this parent filled out the rest of the chain.
            return Ok(());
        }

        self.ensure_parent_directory(parent)?;

        let name = format!("{parent}/");
        let mod_time = self.default_mod_time;
        self.write_header_and_data(
            &name,
            EntryType::Directory,
            0,
            0o755,
            mod_time,
            &mut io::empty(),
        )?;
        self.entries.insert(parent.to_string(), EntryKind::Directory);
        Ok(())
    }

    fn write_header_and_data<R: Read>(
        &mut self,
        name: &str,
        entry_type: EntryType,
        size: u64,
        mode: u32,
        mod_time: SystemTime,
        data: &mut R,
    ) -> Result<()> {
        if name.len() > 100 {
            return Err(ImageError::SchemaViolation(format!(
                "path {name:?} does not fit in a ustar header"
            )));
        }

        let mut header = tar::Header::new_ustar();
        // The name is written directly so directory names keep their
        // trailing slash, which Header::set_path would strip.
        header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
        header.set_entry_type(entry_type);
        header.set_size(size);
        header.set_mode(mode);
        header.set_mtime(unix_seconds(mod_time));
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();

        self.inner.append(&header, data)?;
        Ok(())
    }
}

/// Lexically clean a slash-separated path into a relative form: collapse
/// `.` and `..`, drop duplicate separators, strip the leading slash, and
/// map an empty result to `.`.
fn clean_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut stack: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => match stack.last() {
                Some(&"..") => stack.push(".."),
                Some(_) => {
                    stack.pop();
                }
                None => {
                    if !absolute {
                        stack.push("..");
                    }
                }
            },
            other => stack.push(other),
        }
    }
    if stack.is_empty() {
        ".".to_string()
    } else {
        stack.join("/")
    }
}

/// Normalize an entry path, rejecting the archive root and anything that
/// escapes it.
fn normalize_path(path: &str) -> Result<String> {
    let np = clean_path(path);
    if np == "." || np == ".." || np.starts_with("../") {
        return Err(ImageError::EntryOutsideArchive {
            path: path.to_string(),
        });
    }
    Ok(np)
}

fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    fn test_mod_time() -> SystemTime {
        let secs = chrono::DateTime::parse_from_rfc3339("2021-10-24T02:36:42Z")
            .unwrap()
            .timestamp() as u64;
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[derive(Debug, PartialEq)]
    struct RawHeader {
        name: String,
        entry_type: EntryType,
        size: u64,
        mode: u32,
        mtime: u64,
        uid: u64,
        gid: u64,
    }

    fn read_headers(archive: &[u8]) -> Vec<RawHeader> {
        let mut ar = tar::Archive::new(archive);
        ar.entries()
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                let header = entry.header();
                RawHeader {
                    name: String::from_utf8_lossy(&entry.path_bytes()).into_owned(),
                    entry_type: header.entry_type(),
                    size: header.size().unwrap(),
                    mode: header.mode().unwrap(),
                    mtime: header.mtime().unwrap(),
                    uid: header.uid().unwrap(),
                    gid: header.gid().unwrap(),
                }
            })
            .collect()
    }

    fn dir_header(name: &str, mode: u32) -> RawHeader {
        RawHeader {
            name: name.to_string(),
            entry_type: EntryType::Directory,
            size: 0,
            mode,
            mtime: unix_seconds(test_mod_time()),
            uid: 0,
            gid: 0,
        }
    }

    fn file_header(name: &str, size: u64, mode: u32) -> RawHeader {
        RawHeader {
            name: name.to_string(),
            entry_type: EntryType::Regular,
            size,
            mode,
            mtime: unix_seconds(test_mod_time()),
            uid: 0,
            gid: 0,
        }
    }

    fn new_builder() -> Builder<Vec<u8>> {
        let mut builder = Builder::new(Vec::new());
        builder.set_default_mod_time(test_mod_time());
        builder
    }

    #[test]
    fn test_parent_synthesis_and_canonical_headers() {
        let mut builder = new_builder();

        builder
            .add_content("etc/hostname", b"test.example.com")
            .unwrap();
        builder
            .add(
                "etc/passwd",
                File {
                    reader: &b"root:x:0:0:root:/root:/bin/sh"[..],
                    size: 29,
                    mode: 0o644,
                    mod_time: test_mod_time(),
                },
            )
            .unwrap();
        builder
            .add_dir(
                "tmp",
                Dir {
                    mode: 0o1777,
                    mod_time: test_mod_time(),
                },
            )
            .unwrap();
        let archive = builder.into_inner().unwrap();

        assert_eq!(
            read_headers(&archive),
            vec![
                dir_header("etc/", 0o755),
                file_header("etc/hostname", 16, 0o644),
                file_header("etc/passwd", 29, 0o644),
                dir_header("tmp/", 0o1777),
            ]
        );
    }

    #[test]
    fn test_path_normalization() {
        let mut builder = new_builder();

        builder.add_content("etc/test1.conf", b"test1").unwrap();
        builder.add_content("/etc/test2.conf", b"test2").unwrap();
        builder
            .add_content("./home/../etc/test3/.././test3.conf", b"test3")
            .unwrap();
        builder
            .add_dir(
                "/home/./",
                Dir {
                    mode: 0o755,
                    mod_time: test_mod_time(),
                },
            )
            .unwrap();
        let archive = builder.into_inner().unwrap();

        assert_eq!(
            read_headers(&archive),
            vec![
                dir_header("etc/", 0o755),
                file_header("etc/test1.conf", 5, 0o644),
                file_header("etc/test2.conf", 5, 0o644),
                file_header("etc/test3.conf", 5, 0o644),
                dir_header("home/", 0o755),
            ]
        );
    }

    #[test]
    fn test_rejects_paths_outside_archive() {
        for path in ["/", "../", "..", "../../etc/passwd"] {
            let mut builder = new_builder();
            let err = builder.add_content(path, b"test").unwrap_err();
            assert!(
                matches!(err, ImageError::EntryOutsideArchive { .. }),
                "expected EntryOutsideArchive for {path:?}, got {err:?}"
            );
        }
    }

    #[test]
    fn test_rejects_duplicate_file() {
        let mut builder = new_builder();
        builder.add_content("test.txt", b"test").unwrap();
        let err = builder.add_content("test.txt", b"oops").unwrap_err();
        assert!(matches!(err, ImageError::DuplicateEntry { .. }));
    }

    #[test]
    fn test_rejects_file_as_parent_directory() {
        let mut builder = new_builder();
        builder
            .add_content("etc/conf.d", b"whoops, i am a file")
            .unwrap();
        let err = builder
            .add_content("etc/conf.d/tarbuild/50-default.conf", b"this will not work")
            .unwrap_err();
        assert!(matches!(err, ImageError::DuplicateEntry { .. }));
    }

    #[test]
    fn test_explicit_directory_is_usable_as_parent() {
        let mut builder = new_builder();
        builder
            .add_dir(
                "opt",
                Dir {
                    mode: 0o700,
                    mod_time: test_mod_time(),
                },
            )
            .unwrap();
        builder.add_content("opt/app", b"binary").unwrap();
        let archive = builder.into_inner().unwrap();

        assert_eq!(
            read_headers(&archive),
            vec![dir_header("opt/", 0o700), file_header("opt/app", 6, 0o644)],
        );
    }

    #[test]
    fn test_operations_after_finish_fail() {
        let mut builder = new_builder();
        builder.add_content("a.txt", b"a").unwrap();
        builder.finish().unwrap();

        assert!(matches!(
            builder.add_content("b.txt", b"b").unwrap_err(),
            ImageError::BuilderClosed
        ));
        assert!(matches!(builder.finish().unwrap_err(), ImageError::BuilderClosed));
    }

    #[test]
    fn test_finish_propagates_latched_error() {
        let mut builder = new_builder();
        builder.add_content("../escape.txt", b"x").unwrap_err();

        // Later adds keep failing with the original error.
        assert!(matches!(
            builder.add_content("ok.txt", b"x").unwrap_err(),
            ImageError::EntryOutsideArchive { .. }
        ));
        assert!(matches!(
            builder.finish().unwrap_err(),
            ImageError::EntryOutsideArchive { .. }
        ));
    }

    #[test]
    fn test_file_content_is_copied_verbatim() {
        let mut builder = new_builder();
        builder.add_content("data/blob.bin", &[0xde, 0xad, 0xbe, 0xef]).unwrap();
        let archive = builder.into_inner().unwrap();

        let mut ar = tar::Archive::new(&archive[..]);
        let mut found = false;
        for entry in ar.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.header().entry_type() == EntryType::Regular {
                let mut content = Vec::new();
                entry.read_to_end(&mut content).unwrap();
                assert_eq!(content, [0xde, 0xad, 0xbe, 0xef]);
                found = true;
            }
        }
        assert!(found);
    }

    #[test]
    fn test_short_reader_is_an_error() {
        let mut builder = new_builder();
        let err = builder
            .add(
                "short.bin",
                File {
                    reader: &b"abc"[..],
                    size: 10,
                    mode: 0o644,
                    mod_time: test_mod_time(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, ImageError::Io(_)));
    }
}
