use super::error::PipelineError;
use crate::domain::Task;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Append-only JSON-lines file of task records.
#[derive(Debug, Clone)]
pub struct TaskStore {
    path: PathBuf,
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every record. A missing file holds no tasks.
    pub fn load(&self) -> Result<Vec<Task>, PipelineError> {
        let Some(reader) = self.open_reader()? else {
            return Ok(Vec::new());
        };

        let mut tasks = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| self.io_error(source))?;
            if line.trim().is_empty() {
                continue;
            }
            let task = serde_json::from_str(&line).map_err(|source| PipelineError::Parse {
                path: self.path.clone(),
                line: index + 1,
                source,
            })?;
            tasks.push(task);
        }
        Ok(tasks)
    }

    /// Ids already written. Unreadable lines (e.g. a record cut short by a
    /// crash) are skipped so the step can resume.
    pub fn existing_ids(&self) -> Result<HashSet<String>, PipelineError> {
        let Some(reader) = self.open_reader()? else {
            return Ok(HashSet::new());
        };

        let mut ids = HashSet::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| self.io_error(source))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Task>(&line) {
                Ok(task) => {
                    ids.insert(task.id);
                }
                Err(err) => warn!(
                    path = %self.path.display(),
                    line = index + 1,
                    %err,
                    "skipping unreadable task record"
                ),
            }
        }
        Ok(ids)
    }

    /// Appends one record and flushes it to disk before returning.
    pub fn append(&self, task: &Task) -> Result<(), PipelineError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }

        let line = serde_json::to_string(task).map_err(|source| PipelineError::Serialize {
            id: task.id.clone(),
            source,
        })?;

        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.io_error(source))?;
        // A record cut short by a crash must stay on its own line.
        if ends_mid_line(&mut file).map_err(|source| self.io_error(source))? {
            warn!(path = %self.path.display(), "terminating truncated task record");
            writeln!(file).map_err(|source| self.io_error(source))?;
        }
        writeln!(file, "{line}").map_err(|source| self.io_error(source))?;
        file.sync_data().map_err(|source| self.io_error(source))?;
        Ok(())
    }

    fn open_reader(&self) -> Result<Option<BufReader<File>>, PipelineError> {
        match File::open(&self.path) {
            Ok(file) => Ok(Some(BufReader::new(file))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(self.io_error(source)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> PipelineError {
        PipelineError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn ends_mid_line(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}
