//! Background file writer
//!
//! Owns one file on a named thread and applies writes in the order they were
//! queued. Callers only pay for a channel send, so async paths never block
//! on disk.

use crossbeam_channel::{Receiver, Sender};
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::thread;
use tracing::{debug, warn};

enum Target {
    /// Each write appends a line
    Append(File),
    /// Each write replaces the whole file
    Replace(PathBuf),
}

enum Job {
    Write(String),
    Flush(Sender<()>),
}

/// Handle to a writer thread; the thread exits when every handle is dropped
#[derive(Clone)]
pub(crate) struct FileSink {
    jobs: Sender<Job>,
}

impl FileSink {
    /// Append lines to an already opened file
    pub fn append(name: &str, file: File) -> io::Result<Self> {
        Self::spawn(name, Target::Append(file))
    }

    /// Rewrite `path` with the latest content on every write
    pub fn replace(name: &str, path: PathBuf) -> io::Result<Self> {
        Self::spawn(name, Target::Replace(path))
    }

    fn spawn(name: &str, target: Target) -> io::Result<Self> {
        let (jobs, rx) = crossbeam_channel::unbounded();
        let thread_name = name.to_string();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                run(target, rx);
                debug!("File writer {} stopped", thread_name);
            })?;
        Ok(Self { jobs })
    }

    /// Queue a write
    pub fn write(&self, content: String) {
        if self.jobs.send(Job::Write(content)).is_err() {
            warn!("File writer is gone, dropping write");
        }
    }

    /// Wait until every queued write has reached the file
    pub fn flush(&self) {
        let (done, wait) = crossbeam_channel::bounded(1);
        if self.jobs.send(Job::Flush(done)).is_ok() {
            let _ = wait.recv();
        }
    }
}

fn run(mut target: Target, jobs: Receiver<Job>) {
    for job in jobs {
        match job {
            Job::Write(content) => {
                if let Err(e) = target.write(&content) {
                    warn!("{}", e);
                }
            }
            Job::Flush(done) => {
                if let Target::Append(file) = &mut target {
                    let _ = file.flush();
                }
                let _ = done.send(());
            }
        }
    }
}

impl Target {
    fn write(&mut self, content: &str) -> Result<(), String> {
        match self {
            Target::Append(file) => {
                writeln!(file, "{}", content).map_err(|e| format!("Log file write failed: {}", e))
            }
            Target::Replace(path) => std::fs::write(&*path, content)
                .map_err(|e| format!("Failed to write {}: {}", path.display(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appends_in_queue_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = File::create(&path).unwrap();
        let sink = FileSink::append("test-append", file).unwrap();

        for i in 0..50 {
            sink.write(format!("line {}", i));
        }
        sink.flush();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 50);
        assert_eq!(lines[0], "line 0");
        assert_eq!(lines[49], "line 49");
    }

    #[test]
    fn test_replace_keeps_latest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.toml");
        let sink = FileSink::replace("test-replace", path.clone()).unwrap();

        sink.write("a = 1".to_string());
        sink.write("a = 2".to_string());
        sink.flush();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a = 2");
    }

    #[test]
    fn test_write_failure_does_not_stop_writer() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::replace("test-missing", dir.path().join("no/such/dir/x")).unwrap();

        sink.write("lost".to_string());
        sink.flush();
        sink.write("also lost".to_string());
        sink.flush();
    }
}
