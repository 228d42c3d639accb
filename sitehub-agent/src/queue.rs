use std::collections::VecDeque;
use std::time::Duration;
use parking_lot::Mutex;
use shared::protocol::ERROR_QUEUE_WINDOW_SECS;
use shared::types::ErrorReport;
use tokio::time::Instant;

/// Reports kept while the hub is unreachable; beyond this the oldest go first
pub const MAX_QUEUED_REPORTS: usize = 500;

/// What the caller should do with a report handed to the queue
#[derive(Debug)]
pub enum Routing {
    /// Critical: send now and open a ticket
    Immediate(ErrorReport),
    Queued,
}

struct Pending {
    reports: VecDeque<ErrorReport>,
    /// When the oldest report still waiting was queued
    since: Option<Instant>,
}

/// Holds non-critical error reports for a window and releases them as one batch
pub struct ErrorQueue {
    window: Duration,
    pending: Mutex<Pending>,
}

impl Default for ErrorQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(ERROR_QUEUE_WINDOW_SECS))
    }
}

impl ErrorQueue {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Mutex::new(Pending {
                reports: VecDeque::new(),
                since: None,
            }),
        }
    }

    pub fn push(&self, mut report: ErrorReport) -> Routing {
        fill_missing_message(&mut report);
        if report.kind.is_critical_by_default() {
            return Routing::Immediate(report);
        }

        let mut pending = self.pending.lock();
        if pending.reports.len() >= MAX_QUEUED_REPORTS {
            pending.reports.pop_front();
            tracing::warn!(limit = MAX_QUEUED_REPORTS, "Error queue full; dropped oldest report");
        }
        pending.reports.push_back(report);
        pending.since.get_or_insert_with(Instant::now);
        Routing::Queued
    }

    /// True once the oldest waiting report has been held for the whole window
    pub fn is_due(&self) -> bool {
        let pending = self.pending.lock();
        pending.since.is_some_and(|since| since.elapsed() >= self.window)
    }

    /// Everything waiting, oldest first. Empties the queue.
    pub fn take(&self) -> Vec<ErrorReport> {
        let mut pending = self.pending.lock();
        pending.since = None;
        std::mem::take(&mut pending.reports).into()
    }

    /// Put back a batch the hub did not accept, ahead of anything newer
    pub fn requeue(&self, reports: Vec<ErrorReport>) {
        if reports.is_empty() {
            return;
        }
        let mut pending = self.pending.lock();
        let mut merged: VecDeque<ErrorReport> = reports.into();
        merged.append(&mut pending.reports);
        if merged.len() > MAX_QUEUED_REPORTS {
            let excess = merged.len() - MAX_QUEUED_REPORTS;
            merged.drain(..excess);
        }
        pending.reports = merged;
        pending.since.get_or_insert_with(Instant::now);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The hub skips reports without a message; give them one naming the kind
fn fill_missing_message(report: &mut ErrorReport) {
    if report.message.trim().is_empty() {
        report.message = format!("{} error reported without a message", report.kind.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::ErrorKind;
    use uuid::Uuid;

    fn report(kind: ErrorKind, message: &str) -> ErrorReport {
        ErrorReport::new(Uuid::new_v4(), kind, message)
    }

    #[test]
    fn test_critical_kinds_bypass_queue() {
        let queue = ErrorQueue::default();
        for kind in [ErrorKind::Fatal, ErrorKind::Parse, ErrorKind::Core, ErrorKind::Database] {
            assert!(matches!(queue.push(report(kind, "boom")), Routing::Immediate(_)));
        }
        assert!(matches!(queue.push(report(ErrorKind::Notice, "meh")), Routing::Queued));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_empty_message_is_filled_in() {
        let queue = ErrorQueue::default();
        queue.push(report(ErrorKind::Notice, "  "));
        let Routing::Immediate(critical) = queue.push(report(ErrorKind::Database, "")) else {
            panic!("database errors bypass the queue");
        };

        assert_eq!(queue.take()[0].message, "notice error reported without a message");
        assert_eq!(critical.message, "database error reported without a message");
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_after_window() {
        let queue = ErrorQueue::new(Duration::from_secs(300));
        assert!(!queue.is_due());

        queue.push(report(ErrorKind::Warning, "first"));
        tokio::time::advance(Duration::from_secs(200)).await;
        queue.push(report(ErrorKind::Warning, "second"));
        assert!(!queue.is_due());

        // The window runs from the oldest report
        tokio::time::advance(Duration::from_secs(100)).await;
        assert!(queue.is_due());

        let batch = queue.take();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].message, "first");
        assert!(!queue.is_due());
    }

    #[test]
    fn test_requeue_keeps_order_and_bound() {
        let queue = ErrorQueue::default();
        queue.push(report(ErrorKind::Warning, "newer"));
        queue.requeue(vec![report(ErrorKind::Warning, "older")]);

        let batch = queue.take();
        assert_eq!(batch[0].message, "older");
        assert_eq!(batch[1].message, "newer");

        for i in 0..MAX_QUEUED_REPORTS + 5 {
            queue.push(report(ErrorKind::Notice, &i.to_string()));
        }
        assert_eq!(queue.len(), MAX_QUEUED_REPORTS);
        assert_eq!(queue.take()[0].message, "5");
    }
}
