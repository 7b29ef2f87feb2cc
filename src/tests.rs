//! Shared code for tests

#![allow(clippy::unwrap_used)]

use std::{
    fs::OpenOptions,
    io::Write as _,
    os::unix::prelude::OpenOptionsExt as _,
    path::{Path, PathBuf},
};

/// An executable shell script in a temporary directory, for exercising
/// exec hooks without touching PATH
pub(crate) struct ScriptMock {
    /// Directory holding the script, removed on drop
    _dir: tempfile::TempDir,
    /// Script path
    path: PathBuf,
}

impl ScriptMock {
    /// Create a script with the given body
    pub(crate) fn new(name: &str, body: &str) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(name);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o700)
            .open(&path)?
            .write_all(format!("#!/bin/sh\n{body}\n").as_bytes())?;
        Ok(Self { _dir: dir, path })
    }

    /// Path to invoke the script at
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}
