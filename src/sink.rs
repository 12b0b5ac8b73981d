//! Output files for captured profiles.

use crate::error::{Error, Result};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Prefix of the temp folder used when the configured folder cannot be created
const TEMP_PREFIX: &str = "profiler";

/// A buffered, writable profile file
pub struct Sink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Sink {
    /// Create (or truncate) `name` under `folder`, creating the folder tree.
    ///
    /// If the folder cannot be created a uniquely named temp folder is used
    /// instead. Only a failure to create that folder or the file is an error.
    pub fn create(folder: &Path, name: &str) -> Result<Self> {
        let folder = match fs::create_dir_all(folder) {
            Ok(()) => folder.to_path_buf(),
            Err(err) => {
                let fallback = temp_folder()?;
                tracing::warn!(
                    folder = %folder.display(),
                    fallback = %fallback.display(),
                    error = %err,
                    "cannot create profile folder, writing to temp folder"
                );
                fallback
            }
        };

        let path = folder.join(name);
        let file = File::create(&path).map_err(|source| Error::ProfileFile {
            path: path.clone(),
            source,
        })?;
        Ok(Sink {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush buffered data and sync the file to disk.
    pub fn close(self) -> Result<()> {
        let file = self.writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink").field("path", &self.path).finish()
    }
}

fn temp_folder() -> Result<PathBuf> {
    let dir = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempdir()
        .map_err(Error::TempFolder)?;
    Ok(dir.keep())
}
