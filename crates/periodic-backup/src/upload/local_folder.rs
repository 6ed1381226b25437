use std::{
    fs::{self, File},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use shared::CancellationToken;

use crate::{config::DestinationKind, naming};

use super::{RemoteSink, SinkError};

/// Copies artifacts into another local folder, such as a mounted share.
#[derive(Debug, Clone)]
pub struct LocalFolderSink {
    root: PathBuf,
}

impl LocalFolderSink {
    /// A sink rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn list(&self, prefix: &str, directories: bool) -> Result<Vec<String>, SinkError> {
        let directory = match fs::read_dir(self.root.join(prefix)) {
            Ok(directory) => directory,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(SinkError::Io(error, "read a folder")),
        };

        let mut names = Vec::new();
        for entry in directory {
            let entry = entry.map_err(|e| SinkError::Io(e, "read a folder entry"))?;
            let file_type = entry
                .file_type()
                .map_err(|e| SinkError::Io(e, "get an entry's type"))?;

            if file_type.is_dir() == directories {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }

        Ok(names)
    }
}

impl RemoteSink for LocalFolderSink {
    fn kind(&self) -> DestinationKind {
        DestinationKind::LocalFolder
    }

    fn upload(
        &self,
        key: &str,
        source: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), SinkError> {
        let target = self.root.join(key);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| SinkError::Io(e, "create the target folder"))?;
        }

        let in_progress = naming::in_progress_path(&target);
        let copy = || -> Result<(), SinkError> {
            let mut reader = File::open(source).map_err(|e| SinkError::Io(e, "open the artifact"))?;
            let mut writer =
                File::create(&in_progress).map_err(|e| SinkError::Io(e, "create the copy"))?;

            let mut buffer = vec![0u8; 64 * 1024];
            loop {
                if cancel.is_cancelled() {
                    return Err(SinkError::Cancelled);
                }

                let read = reader
                    .read(&mut buffer)
                    .map_err(|e| SinkError::Io(e, "read the artifact"))?;
                if read == 0 {
                    break;
                }

                writer
                    .write_all(&buffer[..read])
                    .map_err(|e| SinkError::Io(e, "write the copy"))?;
            }

            writer
                .sync_all()
                .map_err(|e| SinkError::Io(e, "sync the copy"))?;

            fs::rename(&in_progress, &target).map_err(|e| SinkError::Io(e, "rename the copy"))
        };

        let result = copy();
        if result.is_err() {
            let _ = fs::remove_file(&in_progress);
        }

        result
    }

    fn supports_listing(&self) -> bool {
        true
    }

    fn list_folders(&self, prefix: &str) -> Result<Vec<String>, SinkError> {
        self.list(prefix, true)
    }

    fn list_objects(&self, prefix: &str) -> Result<Vec<String>, SinkError> {
        self.list(prefix, false)
    }

    fn delete_object(&self, key: &str) -> Result<(), SinkError> {
        match fs::remove_file(self.root.join(key)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(SinkError::Io(error, "delete a file")),
        }
    }

    fn delete_folder(&self, prefix: &str) -> Result<(), SinkError> {
        match fs::remove_dir(self.root.join(prefix)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(SinkError::Io(error, "delete a folder")),
        }
    }
}
