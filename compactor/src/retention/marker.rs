// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! On-disk marker files: chunk keys slated for deletion.
//!
//! A table run appends keys to a scratch file in its working dir, fsyncs it,
//! and publishes it into the period markers dir only once the whole run
//! succeeded. Published files are named `<millis>-<pid>`; the leading stamp
//! decides when the sweeper may consume them.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use common_util::{define_result, time::Timestamp};
use log::warn;
use snafu::{ResultExt, Snafu};

/// Directory below a period retention workdir holding published markers.
pub const MARKERS_DIR: &str = "markers";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to create marker file, path:{}, err:{}", path, source))]
    CreateMarker { path: String, source: std::io::Error },

    #[snafu(display("Failed to append chunk marker, path:{}, err:{}", path, source))]
    AppendMarker { path: String, source: std::io::Error },

    #[snafu(display("Failed to sync marker file, path:{}, err:{}", path, source))]
    SyncMarker { path: String, source: std::io::Error },

    #[snafu(display("Failed to publish marker file, path:{}, err:{}", path, source))]
    PublishMarker { path: String, source: std::io::Error },

    #[snafu(display("Failed to list marker files, dir:{}, err:{}", dir, source))]
    ListMarkers { dir: String, source: std::io::Error },

    #[snafu(display("Failed to read marker file, path:{}, err:{}", path, source))]
    ReadMarker { path: String, source: std::io::Error },

    #[snafu(display("Failed to rewrite marker file, path:{}, err:{}", path, source))]
    RewriteMarker { path: String, source: std::io::Error },

    #[snafu(display("Failed to migrate markers, from:{}, to:{}, err:{}", from, to, source))]
    MigrateMarkers {
        from: String,
        to: String,
        source: std::io::Error,
    },
}

define_result!(Error);

/// Buffered writer for the scratch marker file of one table run.
pub struct MarkerWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    count: usize,
}

impl MarkerWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context(CreateMarker {
                path: path.display().to_string(),
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .context(CreateMarker {
                path: path.display().to_string(),
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            count: 0,
        })
    }

    pub fn mark(&mut self, chunk_key: &str) -> Result<()> {
        writeln!(self.writer, "{chunk_key}").context(AppendMarker {
            path: self.path.display().to_string(),
        })?;
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Flush and fsync, returning the scratch path and the number of marked
    /// chunks.
    pub fn finish(mut self) -> Result<(PathBuf, usize)> {
        self.writer.flush().context(SyncMarker {
            path: self.path.display().to_string(),
        })?;
        self.writer.get_ref().sync_all().context(SyncMarker {
            path: self.path.display().to_string(),
        })?;
        Ok((self.path, self.count))
    }
}

/// A published marker file.
#[derive(Clone, Debug, PartialEq)]
pub struct MarkerFile {
    pub path: PathBuf,
    /// Publication time encoded in the file name.
    pub created_at: Timestamp,
}

/// The period specific markers directory.
#[derive(Clone, Debug)]
pub struct MarkerStorage {
    dir: PathBuf,
}

impl MarkerStorage {
    /// Open (and create) the markers dir below a period retention workdir.
    pub fn new(retention_workdir: &Path) -> Result<Self> {
        let dir = retention_workdir.join(MARKERS_DIR);
        fs::create_dir_all(&dir).context(CreateMarker {
            path: dir.display().to_string(),
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Move a finished scratch file into the markers dir, stamped with `now`.
    pub fn publish(&self, scratch: &Path, now: Timestamp) -> Result<PathBuf> {
        let mut stamp = now.as_i64();
        let dest = loop {
            let candidate = self.dir.join(format!("{}-{}", stamp, std::process::id()));
            if !candidate.exists() {
                break candidate;
            }
            stamp += 1;
        };

        fs::rename(scratch, &dest).context(PublishMarker {
            path: dest.display().to_string(),
        })?;
        Ok(dest)
    }

    /// All published marker files, oldest first. Files without a parseable
    /// stamp are skipped with a warning.
    pub fn marker_files(&self) -> Result<Vec<MarkerFile>> {
        let entries = fs::read_dir(&self.dir).context(ListMarkers {
            dir: self.dir.display().to_string(),
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.context(ListMarkers {
                dir: self.dir.display().to_string(),
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".tmp") {
                continue;
            }
            match name.split('-').next().and_then(|s| s.parse::<i64>().ok()) {
                Some(ms) => files.push(MarkerFile {
                    path,
                    created_at: Timestamp::new(ms),
                }),
                None => {
                    warn!("Skipping marker file without stamp, path:{}", path.display());
                }
            }
        }

        files.sort_by_key(|f| f.created_at);
        Ok(files)
    }

    /// Marker files old enough to be swept.
    pub fn eligible_files(&self, now: Timestamp, delete_delay: Duration) -> Result<Vec<MarkerFile>> {
        Ok(self
            .marker_files()?
            .into_iter()
            .filter(|f| now.millis_since(f.created_at) >= delete_delay.as_millis() as u64)
            .collect())
    }

    /// Replace a marker file with the keys that still need deleting; remove
    /// it when none remain.
    pub fn rewrite(&self, path: &Path, remaining: &[String]) -> Result<()> {
        if remaining.is_empty() {
            return fs::remove_file(path).context(RewriteMarker {
                path: path.display().to_string(),
            });
        }

        let tmp = path.with_extension("tmp");
        let mut data = remaining.join("\n");
        data.push('\n');
        fs::write(&tmp, data).context(RewriteMarker {
            path: tmp.display().to_string(),
        })?;
        fs::rename(&tmp, path).context(RewriteMarker {
            path: path.display().to_string(),
        })
    }
}

/// Chunk keys recorded in a marker file.
pub fn read_marker_keys(path: &Path) -> Result<Vec<String>> {
    let data = fs::read_to_string(path).context(ReadMarker {
        path: path.display().to_string(),
    })?;
    Ok(data
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string())
        .collect())
}

/// Migrate legacy marker files from `src_dir/markers` into the markers dir
/// below `dst_workdir`. Files already present at the destination are left
/// alone; the legacy files stay behind for the caller to clean up.
pub fn copy_markers(src_dir: &Path, dst_workdir: &Path) -> Result<()> {
    let src = src_dir.join(MARKERS_DIR);
    if !src.is_dir() {
        return Ok(());
    }
    let dst = dst_workdir.join(MARKERS_DIR);
    fs::create_dir_all(&dst).context(MigrateMarkers {
        from: src.display().to_string(),
        to: dst.display().to_string(),
    })?;

    let entries = fs::read_dir(&src).context(MigrateMarkers {
        from: src.display().to_string(),
        to: dst.display().to_string(),
    })?;
    for entry in entries {
        let entry = entry.context(MigrateMarkers {
            from: src.display().to_string(),
            to: dst.display().to_string(),
        })?;
        if !entry.path().is_file() {
            continue;
        }
        let target = dst.join(entry.file_name());
        if target.exists() {
            continue;
        }
        fs::copy(entry.path(), &target).context(MigrateMarkers {
            from: entry.path().display().to_string(),
            to: target.display().to_string(),
        })?;
    }

    Ok(())
}
