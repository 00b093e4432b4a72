/// Progress events emitted by discovery runs.
///
/// The core carries no global logging or progress state; callers that want
/// visibility pass a callback and render the events however they like.
#[derive(Debug, Clone)]
pub enum Progress {
    ScanStart { total_stages: u64 },
    StageStart { name: String },
    StageFinish,
    Message(String),
}

pub type ProgressCallback<'a> = Box<dyn Fn(Progress) + Send + Sync + 'a>;

#[derive(Default)]
pub struct ProgressReporter<'a> {
    callback: Option<ProgressCallback<'a>>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(callback: ProgressCallback<'a>) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    #[inline]
    pub fn report(&self, event: Progress) {
        if let Some(cb) = &self.callback {
            cb(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn silent_reporter_swallows_events() {
        let reporter = ProgressReporter::new();
        reporter.report(Progress::Message("nobody listening".to_string()));
    }

    #[test]
    fn callback_receives_every_event() {
        let seen = AtomicUsize::new(0);
        let reporter = ProgressReporter::with_callback(Box::new(|_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        reporter.report(Progress::ScanStart { total_stages: 2 });
        reporter.report(Progress::StageStart {
            name: "prod".to_string(),
        });
        reporter.report(Progress::StageFinish);
        drop(reporter);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
