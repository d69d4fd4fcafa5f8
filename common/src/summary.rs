use std::path::PathBuf;

use crate::error::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Copy,
    Delete,
}

impl Operation {
    pub fn glyph(self) -> &'static str {
        match self {
            Operation::Copy => "📋",
            Operation::Delete => "🗑️",
        }
    }

    pub fn past_tense(self) -> &'static str {
        match self {
            Operation::Copy => "Copied",
            Operation::Delete => "Deleted",
        }
    }

    pub fn progressive(self) -> &'static str {
        match self {
            Operation::Copy => "Copying",
            Operation::Delete => "Deleting",
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub bytes: u64,
    pub files: usize,
    pub symlinks: usize,
    pub directories: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Summary {
    /// Files and symlinks, the entries the final count line reports as "files".
    pub fn entries(&self) -> usize {
        self.files + self.symlinks
    }
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes: self.bytes + other.bytes,
            files: self.files + other.files,
            symlinks: self.symlinks + other.symlinks,
            directories: self.directories + other.directories,
            skipped: self.skipped + other.skipped,
            failed: self.failed + other.failed,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes: {}\n\
            files: {}\n\
            symlinks: {}\n\
            directories: {}\n\
            skipped: {}\n\
            failed: {}",
            bytesize::ByteSize(self.bytes),
            self.files,
            self.symlinks,
            self.directories,
            self.skipped,
            self.failed,
        )
    }
}

/// A work item that did not complete, with the reason.
#[derive(Debug)]
pub struct Failure {
    pub path: PathBuf,
    pub error: Error,
}

impl Failure {
    pub fn new(path: impl Into<PathBuf>, error: Error) -> Self {
        Self {
            path: path.into(),
            error,
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.error)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Abort {
    /// Interrupt signal.
    Interrupted,
    /// "quit" answered to an overwrite question.
    Quit,
    /// A fatal failure at this path; the failure itself is in [`Report::failures`].
    Fatal(PathBuf),
}

impl std::fmt::Display for Abort {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Abort::Interrupted => write!(f, "operation cancelled by user"),
            Abort::Quit => write!(f, "operation cancelled by user (quit)"),
            Abort::Fatal(path) => write!(f, "operation aborted after fatal error at {path:?}"),
        }
    }
}

/// Outcome of a copy or delete run.
#[derive(Debug, Default)]
pub struct Report {
    pub summary: Summary,
    pub failures: Vec<Failure>,
    pub aborted: Option<Abort>,
}

impl Report {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.aborted.is_none()
    }

    pub fn record_failure(&mut self, failure: Failure) {
        self.summary.failed += 1;
        if failure.error.is_fatal() && self.aborted.is_none() {
            self.aborted = Some(Abort::Fatal(failure.path.clone()));
        }
        self.failures.push(failure);
    }

    /// Merges walk warnings into the failure list so they are listed with the rest.
    pub fn extend_warnings(&mut self, warnings: Vec<Failure>) {
        for warning in warnings {
            self.record_failure(warning);
        }
    }

    /// Final count line, e.g. `Copied: 12 files (1.5 MiB) (Skipped: 1)`.
    pub fn headline(&self, operation: Operation) -> String {
        let mut line = format!(
            "{}: {} files ({})",
            operation.past_tense(),
            self.summary.entries(),
            bytesize::ByteSize(self.summary.bytes)
        );
        if self.summary.directories > 0 {
            line.push_str(&format!(" in {} directories", self.summary.directories));
        }
        if self.summary.skipped > 0 {
            line.push_str(&format!(" (Skipped: {})", self.summary.skipped));
        }
        if self.summary.failed > 0 {
            line.push_str(&format!(" (Failed: {})", self.summary.failed));
        }
        line
    }

    pub fn render(&self, operation: Operation) -> String {
        let mark = if self.is_success() { "✅" } else { "⚠️" };
        let mut text = format!("{mark} {}", self.headline(operation));
        if let Some(abort) = &self.aborted {
            text.push_str(&format!("\n{abort}"));
        }
        if !self.failures.is_empty() {
            text.push_str("\nFailures:");
            for failure in &self.failures {
                text.push_str(&format!("\n  ✗ {failure}"));
            }
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headline_reports_optional_counts() {
        let mut report = Report {
            summary: Summary {
                bytes: 2048,
                files: 3,
                symlinks: 1,
                skipped: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            report.headline(Operation::Copy),
            format!(
                "Copied: 4 files ({}) (Skipped: 2)",
                bytesize::ByteSize(2048)
            )
        );
        report.record_failure(Failure::new(
            "a/b",
            Error::NotFound {
                path: "a/b".into(),
            },
        ));
        assert!(report.headline(Operation::Delete).ends_with("(Failed: 1)"));
        assert!(!report.is_success());
        assert!(report.aborted.is_none());
        assert!(report.render(Operation::Delete).contains("✗ a/b"));
    }

    #[test]
    fn fatal_failure_marks_report_aborted() {
        let mut report = Report::default();
        report.record_failure(Failure::new(
            "/ro/x",
            Error::from_io(
                std::path::Path::new("/ro/x"),
                std::io::Error::from_raw_os_error(libc::EROFS),
            ),
        ));
        assert_eq!(report.aborted, Some(Abort::Fatal("/ro/x".into())));
    }

    #[test]
    fn summaries_add_fieldwise() {
        let a = Summary {
            bytes: 10,
            files: 1,
            ..Default::default()
        };
        let b = Summary {
            bytes: 5,
            directories: 2,
            failed: 1,
            ..Default::default()
        };
        let total = a + b;
        assert_eq!(total.bytes, 15);
        assert_eq!(total.files, 1);
        assert_eq!(total.directories, 2);
        assert_eq!(total.failed, 1);
    }
}
