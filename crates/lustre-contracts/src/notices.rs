use std::time::{Duration, Instant};

/// Banners auto-dismiss after this window; the driver sweeps on its own
/// cadence.
pub const DISMISS_AFTER: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Success,
    Error,
}

#[derive(Debug, Clone)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
    posted_at: Instant,
}

impl Notice {
    pub fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.posted_at) >= DISMISS_AFTER
    }
}

/// At most one success and one error banner at a time; a new post of the
/// same kind replaces the previous one, resetting its dismiss window.
#[derive(Debug, Default)]
pub struct NoticeBoard {
    success: Option<Notice>,
    error: Option<Notice>,
}

impl NoticeBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post_success(&mut self, message: impl Into<String>) {
        self.post_at(NoticeKind::Success, message.into(), Instant::now());
    }

    pub fn post_error(&mut self, message: impl Into<String>) {
        self.post_at(NoticeKind::Error, message.into(), Instant::now());
    }

    pub fn post_at(&mut self, kind: NoticeKind, message: String, posted_at: Instant) {
        let notice = Notice {
            kind,
            message,
            posted_at,
        };
        match kind {
            NoticeKind::Success => self.success = Some(notice),
            NoticeKind::Error => self.error = Some(notice),
        }
    }

    pub fn success(&self) -> Option<&Notice> {
        self.success.as_ref()
    }

    pub fn error(&self) -> Option<&Notice> {
        self.error.as_ref()
    }

    /// Drops banners whose dismiss window elapsed as of `now`.
    pub fn sweep(&mut self, now: Instant) {
        if self.success.as_ref().is_some_and(|n| n.expired(now)) {
            self.success = None;
        }
        if self.error.as_ref().is_some_and(|n| n.expired(now)) {
            self.error = None;
        }
    }

    pub fn dismiss(&mut self, kind: NoticeKind) {
        match kind {
            NoticeKind::Success => self.success = None,
            NoticeKind::Error => self.error = None,
        }
    }
}
