//! Fixed-capacity ring buffer for log lines.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

type LineObserver = Arc<dyn Fn(&str) + Send + Sync>;

struct RingInner {
    lines: VecDeque<String>,
    /// Incomplete trailing line carried between writes.
    partial: String,
}

/// Thread-safe circular store of newline-delimited log lines with an
/// optional per-line observer.
///
/// The observer is invoked after the buffer lock is released, so an observer
/// that itself logs (or takes application locks) cannot deadlock against a
/// concurrent writer.
pub struct RingBuffer {
    capacity: usize,
    inner: Mutex<RingInner>,
    on_line: Mutex<Option<LineObserver>>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(RingInner {
                lines: VecDeque::with_capacity(capacity),
                partial: String::new(),
            }),
            on_line: Mutex::new(None),
        }
    }

    /// Split `buf` into lines, append each complete line to the ring and
    /// invoke the observer for it. An incomplete final line is carried until
    /// the next write completes it.
    pub fn write(&self, buf: &[u8]) {
        let text = String::from_utf8_lossy(buf);

        let completed = {
            let mut inner = self.inner.lock().unwrap();
            let mut data = std::mem::take(&mut inner.partial);
            data.push_str(&text);

            let mut completed = Vec::new();
            while let Some(idx) = data.find('\n') {
                let rest = data.split_off(idx + 1);
                data.truncate(idx); // drop the newline
                completed.push(std::mem::replace(&mut data, rest));
            }
            inner.partial = data;

            for line in &completed {
                if inner.lines.len() == self.capacity {
                    inner.lines.pop_front();
                }
                inner.lines.push_back(line.clone());
            }
            completed
        };

        if completed.is_empty() {
            return;
        }
        let observer = self.on_line.lock().unwrap().clone();
        if let Some(observer) = observer {
            for line in &completed {
                observer(line);
            }
        }
    }

    /// Snapshot of the stored lines in chronological order.
    pub fn lines(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.lines.iter().cloned().collect()
    }

    /// Register a callback invoked for each new complete line.
    pub fn set_on_line<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_line.lock().unwrap() = Some(Arc::new(f));
    }
}
