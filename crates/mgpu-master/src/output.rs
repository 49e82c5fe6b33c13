//! The per-job output buffer: an append-only line log served
//! incrementally to polling clients via a `from_line` offset.

use std::collections::HashMap;

use mgpu_proto::JobId;

/// Ordered output lines for every job the master has ever accepted,
/// retained for the master's lifetime.
#[derive(Debug, Default)]
pub struct OutputStore {
    lines: HashMap<JobId, Vec<String>>,
}

impl OutputStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            lines: HashMap::new(),
        }
    }

    /// Append one line to a job's buffer.
    pub fn append(&mut self, job_id: JobId, line: String) {
        self.lines.entry(job_id).or_default().push(line);
    }

    /// Append several lines at once, e.g. a diagnosis.
    pub fn extend(&mut self, job_id: JobId, lines: impl IntoIterator<Item = String>) {
        self.lines.entry(job_id).or_default().extend(lines);
    }

    /// Lines from `from_line` (0-based, inclusive) onward, empty if the
    /// job has no buffer yet or `from_line` is past the end.
    #[must_use]
    pub fn from_line(&self, job_id: JobId, from_line: usize) -> Vec<String> {
        self.lines
            .get(&job_id)
            .map(|lines| lines.iter().skip(from_line).cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_from_offset() {
        let mut store = OutputStore::new();
        let id = JobId::new();
        store.append(id, "one".to_string());
        store.append(id, "two".to_string());
        store.append(id, "three".to_string());
        assert_eq!(store.from_line(id, 0), vec!["one", "two", "three"]);
        assert_eq!(store.from_line(id, 1), vec!["two", "three"]);
        assert_eq!(store.from_line(id, 10), Vec::<String>::new());
    }

    #[test]
    fn unknown_job_returns_empty() {
        let store = OutputStore::new();
        assert_eq!(store.from_line(JobId::new(), 0), Vec::<String>::new());
    }
}
