// Copyright 2020 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The console stream: renders the live workunit tree to a terminal, or falls back to
//! line-oriented straggler logging when stdout is not a tty (or the dynamic UI was disabled).
//!
//! Simplified relative to a full-featured console renderer: one `indicatif` progress bar per
//! currently-running workunit, keyed by `SpanId`, refreshed on an interval the caller drives.
//! There is no tree indentation or heavy-hitter summarization; `indicatif::MultiProgress` draws
//! each bar on its own line and removes it once the workunit finishes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;

use workunit_store::{SpanId, WorkunitStore};

/// How often a `Session` should call `render`/`log_stragglers` while a dynamic UI is attached.
pub fn render_interval() -> Duration {
    Duration::from_millis(100)
}

/// Workunits that have been running longer than this are worth calling out in the non-dynamic
/// fallback, so a user watching plain logs still gets a sense of what is taking a while.
const STRAGGLER_THRESHOLD: Duration = Duration::from_secs(30);

struct Bars {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: HashMap<SpanId, ProgressBar>,
}

/// Renders the workunit tree to a terminal as a set of live progress bars.
pub struct ConsoleUI {
    workunit_store: WorkunitStore,
    bars: Mutex<Bars>,
}

impl ConsoleUI {
    pub fn new(workunit_store: WorkunitStore) -> ConsoleUI {
        let style = ProgressStyle::with_template("{spinner:.green} {elapsed_precise} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        ConsoleUI {
            workunit_store,
            bars: Mutex::new(Bars {
                multi: MultiProgress::new(),
                style,
                bars: HashMap::new(),
            }),
        }
    }

    /// Adds a bar for every newly-running workunit and finishes (and removes) bars for workunits
    /// that are no longer running. Should be called on `render_interval` while a session is live.
    pub fn render(&self) {
        let running = self.workunit_store.running();
        let mut bars = self.bars.lock();

        let mut seen: std::collections::HashSet<SpanId> =
            std::collections::HashSet::with_capacity(running.len());
        for workunit in &running {
            seen.insert(workunit.span_id);
            let style = bars.style.clone();
            let bar = bars.bars.entry(workunit.span_id).or_insert_with(|| {
                let bar = bars.multi.add(ProgressBar::new_spinner());
                bar.set_style(style);
                bar.enable_steady_tick(Duration::from_millis(100));
                bar
            });
            bar.set_message(workunit.name.clone());
        }

        bars.bars.retain(|span_id, bar| {
            if seen.contains(span_id) {
                true
            } else {
                bar.finish_and_clear();
                false
            }
        });
    }

    /// Clears every remaining bar. Called once a session completes.
    pub fn teardown(&self) {
        let mut bars = self.bars.lock();
        for (_, bar) in bars.bars.drain() {
            bar.finish_and_clear();
        }
    }
}

/// The non-dynamic fallback: rather than drawing bars, periodically logs workunits that have
/// been running for longer than `STRAGGLER_THRESHOLD`, so a plain log stream still surfaces slow
/// operations.
pub struct StragglerLogger {
    workunit_store: WorkunitStore,
    last_logged: Mutex<HashMap<SpanId, Instant>>,
}

impl StragglerLogger {
    pub fn new(workunit_store: WorkunitStore) -> StragglerLogger {
        StragglerLogger {
            workunit_store,
            last_logged: Mutex::new(HashMap::new()),
        }
    }

    /// Logs (at most once every `render_interval` tick) any workunit older than the threshold.
    pub fn log_stragglers(&self) {
        let now = Instant::now();
        let mut last_logged = self.last_logged.lock();
        last_logged.retain(|span_id, _| {
            self.workunit_store
                .running()
                .iter()
                .any(|w| w.span_id == *span_id)
        });
        for workunit in self.workunit_store.running() {
            let age = match &workunit.state {
                workunit_store::WorkunitState::Started { start_time } => start_time.elapsed(),
                _ => continue,
            };
            if age < STRAGGLER_THRESHOLD {
                continue;
            }
            let should_log = last_logged
                .get(&workunit.span_id)
                .is_none_or(|prev| now.duration_since(*prev) >= STRAGGLER_THRESHOLD);
            if should_log {
                log::info!("still running after {:.1}s: {}", age.as_secs_f64(), workunit.name);
                last_logged.insert(workunit.span_id, now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn render_adds_and_removes_bars_as_workunits_finish() {
        let store = WorkunitStore::new();
        let ui = ConsoleUI::new(store.clone());

        let id = store.start_workunit("compile", Level::Info, None);
        ui.render();
        assert_eq!(ui.bars.lock().bars.len(), 1);

        store.complete_workunit(id);
        ui.render();
        assert_eq!(ui.bars.lock().bars.len(), 0);
    }

    #[test]
    fn straggler_logger_ignores_fresh_workunits() {
        let store = WorkunitStore::new();
        let logger = StragglerLogger::new(store.clone());
        store.start_workunit("quick", Level::Info, None);
        // Freshly started workunits are well under the threshold, so nothing is logged (and
        // nothing panics trying to).
        logger.log_stragglers();
    }
}
