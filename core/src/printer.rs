// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The "async print mutex" (`spec.md` §4.G/§4.I/§5): a single point all
//! terminal output funnels through, so the delta engine's progress line and
//! the release-notes editor bridge never interleave output.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

const FALLBACK_WIDTH: usize = 100;
const WIDTH_FAILURE_BUDGET: usize = 10;

pub struct Printer {
    lock: Mutex<()>,
    consecutive_width_failures: AtomicUsize,
}

impl Printer {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            consecutive_width_failures: AtomicUsize::new(0),
        }
    }

    /// Overwrites the current progress line. Suppressed while another
    /// holder (typically the editor bridge) has the lock for longer than a
    /// single call.
    pub async fn progress_line(&self, text: &str) {
        let _guard = self.lock.lock().await;
        let width = self.terminal_width();
        let truncated: String = text.chars().take(width).collect();
        print!("\r{truncated:<width$}");
        let _ = std::io::stdout().flush();
    }

    pub async fn warn(&self, text: &str) {
        let _guard = self.lock.lock().await;
        println!("\nwarning: {text}");
    }

    pub async fn error(&self, text: &str) {
        let _guard = self.lock.lock().await;
        eprintln!("\nerror: {text}");
    }

    pub async fn finish_progress_line(&self) {
        let _guard = self.lock.lock().await;
        println!();
    }

    /// Acquires the print mutex for the duration of `f`, used by the editor
    /// bridge to keep delta progress output from interleaving with the
    /// editor's own terminal session.
    pub async fn hold<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.lock.lock().await;
        f()
    }

    /// Synchronous variant of [`Printer::hold`], for the one call site (the
    /// release-notes editor bridge) that can't `.await` because it runs
    /// inside a synchronous store-transaction body. `block_in_place` hands
    /// this worker thread's other tasks off to the rest of the pool for the
    /// duration, since `Mutex::blocking_lock` otherwise panics if called
    /// from within the async runtime.
    pub fn hold_blocking<T>(&self, f: impl FnOnce() -> T) -> T {
        tokio::task::block_in_place(|| {
            let _guard = self.lock.blocking_lock();
            f()
        })
    }

    /// After 10 consecutive polling failures, gives up and reports a fixed
    /// default width (`spec.md` §5's terminal-width poller failure budget).
    fn terminal_width(&self) -> usize {
        if self.consecutive_width_failures.load(Ordering::Relaxed) >= WIDTH_FAILURE_BUDGET {
            return FALLBACK_WIDTH;
        }
        match terminal_size::terminal_size() {
            Some((terminal_size::Width(w), _)) => {
                self.consecutive_width_failures.store(0, Ordering::Relaxed);
                w as usize
            }
            None => {
                self.consecutive_width_failures.fetch_add(1, Ordering::Relaxed);
                FALLBACK_WIDTH
            }
        }
    }
}

impl Default for Printer {
    fn default() -> Self {
        Self::new()
    }
}
