//! Scan progress tracking with an opaque, per-source resume token.

use serde::{Deserialize, Serialize};

/// A snapshot of how far a source has gotten through its work.
///
/// `encoded_resume_info` is opaque to everything except the source that
/// wrote it: the git source stores the comma-separated list of repo URLs it
/// has not finished, the GCS source stores the comma-separated set of object
/// fingerprints it has already processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub sections_completed: i32,
    pub sections_remaining: i32,
    pub percent_complete: i64,
    pub message: String,
    pub encoded_resume_info: String,
}

impl Progress {
    /// Record that `completed` of `total` sections are done.
    ///
    /// `sections_completed` never regresses: a stale writer loses to the
    /// furthest point already recorded. Percent is floored, 0 while nothing
    /// is known, 100 once completed reaches total.
    pub fn set_progress_complete(
        &mut self,
        completed: usize,
        total: usize,
        message: String,
        encoded_resume_info: String,
    ) {
        let completed = completed as i32;
        if completed < self.sections_completed {
            return;
        }
        self.sections_completed = completed;
        self.sections_remaining = total as i32;
        self.message = message;
        self.encoded_resume_info = encoded_resume_info;
        self.percent_complete = if self.sections_remaining > 0 {
            (100 * self.sections_completed as i64) / self.sections_remaining as i64
        } else {
            0
        };
    }

    /// Mark the source fully complete.
    pub fn finish(&mut self, message: String) {
        let total = self.sections_remaining.max(self.sections_completed);
        self.sections_completed = total;
        self.sections_remaining = total;
        self.percent_complete = 100;
        self.message = message;
        self.encoded_resume_info = String::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_floored() {
        let mut p = Progress::default();
        p.set_progress_complete(1, 3, "scanning".into(), String::new());
        assert_eq!(p.percent_complete, 33);
        p.set_progress_complete(2, 3, "scanning".into(), String::new());
        assert_eq!(p.percent_complete, 66);
        p.set_progress_complete(3, 3, "scanning".into(), String::new());
        assert_eq!(p.percent_complete, 100);
    }

    #[test]
    fn zero_total_reports_zero_percent() {
        let mut p = Progress::default();
        p.set_progress_complete(0, 0, "starting".into(), String::new());
        assert_eq!(p.percent_complete, 0);
    }

    #[test]
    fn completed_sections_never_regress() {
        let mut p = Progress::default();
        p.set_progress_complete(5, 10, "ahead".into(), "a,b".into());
        p.set_progress_complete(3, 10, "stale".into(), "x".into());
        assert_eq!(p.sections_completed, 5);
        assert_eq!(p.message, "ahead");
        assert_eq!(p.encoded_resume_info, "a,b");
    }

    #[test]
    fn finish_clears_resume_info() {
        let mut p = Progress::default();
        p.set_progress_complete(2, 4, "half".into(), "pending".into());
        p.finish("done".into());
        assert_eq!(p.percent_complete, 100);
        assert_eq!(p.sections_completed, 4);
        assert!(p.encoded_resume_info.is_empty());
    }
}
