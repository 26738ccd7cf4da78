// 🔁 Incremental Batch Coordinator - resumable enrichment over registry windows
//
// A window is (offset, limit) over the registry in park_id order. Each park in
// the window is either:
//   skipped        already enriched by this step (unless force)
//   not applicable the step has nothing to offer it
//   unavailable    collaborator failed after retries; left untouched
//   committed      updates reconciled, checkpoint set, registry saved
//
// A commit is one atomic registry write, so a crash leaves every earlier
// park committed and the in-flight one untouched. The cursor ledger lets a
// re-run start at the first uncommitted offset.

use crate::classifier::RuleEngine;
use crate::config::RetryPolicy;
use crate::entity::{EnrichmentKind, ParkEntity};
use crate::error::{RegistryError, Result};
use crate::ledger::{Event, Ledger};
use crate::provenance::Clock;
use crate::reconciler::{FieldReconciler, FieldUpdate};
use crate::registry::{Registry, RegistryStore};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// ============================================================================
// ENRICHMENT STEP
// ============================================================================

/// Enrichment - what one step proposes for one park
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    pub updates: Vec<FieldUpdate>,
    pub notes: Vec<String>,
}

impl Enrichment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_update(mut self, update: FieldUpdate) -> Self {
        self.updates.push(update);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }
}

/// One enrichment step (parcel area, address, brand)
pub trait EnrichmentStep {
    fn kind(&self) -> EnrichmentKind;

    /// Whether the step has anything to offer this park
    fn applies_to(&self, park: &ParkEntity) -> bool;

    /// Propose updates. `EnrichmentUnavailable` is retried, then skipped.
    fn enrich(&self, park: &ParkEntity, registry: &Registry, at: DateTime<Utc>) -> Result<Enrichment>;
}

// ============================================================================
// WINDOW + REPORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchWindow {
    pub offset: usize,
    pub limit: usize,
}

impl BatchWindow {
    pub fn new(offset: usize, limit: usize) -> Self {
        BatchWindow { offset, limit }
    }

    /// Whole registry
    pub fn all() -> Self {
        BatchWindow {
            offset: 0,
            limit: usize::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub step: EnrichmentKind,
    pub window: BatchWindow,

    /// Parks inside the window
    pub selected: usize,

    /// Absolute offset this run started at
    pub started_at_offset: usize,

    pub committed: usize,
    pub already_done: usize,
    pub not_applicable: usize,
    pub unavailable: usize,
    pub fields_updated: usize,
    pub regressions_rejected: usize,

    /// First absolute offset not yet handled
    pub resume_offset: usize,
    pub interrupted: bool,
}

impl BatchReport {
    fn new(step: EnrichmentKind, window: BatchWindow, selected: usize, start: usize) -> Self {
        BatchReport {
            step,
            window,
            selected,
            started_at_offset: start,
            committed: 0,
            already_done: 0,
            not_applicable: 0,
            unavailable: 0,
            fields_updated: 0,
            regressions_rejected: 0,
            resume_offset: start,
            interrupted: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.interrupted
    }

    pub fn summary(&self) -> String {
        format!(
            "{} [{}+{}]: {} committed, {} already done, {} n/a, {} unavailable, {} fields updated, {} regressions rejected{}",
            self.step,
            self.window.offset,
            self.selected,
            self.committed,
            self.already_done,
            self.not_applicable,
            self.unavailable,
            self.fields_updated,
            self.regressions_rejected,
            if self.interrupted {
                format!(" (interrupted, resume at {})", self.resume_offset)
            } else {
                String::new()
            }
        )
    }
}

// ============================================================================
// RETRY
// ============================================================================

/// Run `op`, retrying transient failures with exponential backoff
pub fn retry_transient<T, F>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_ms(attempt);
                debug!("{}: attempt {} failed ({}), retrying in {} ms", label, attempt, e, delay);
                if delay > 0 {
                    thread::sleep(Duration::from_millis(delay));
                }
                attempt += 1;
            }
            other => return other,
        }
    }
}

// ============================================================================
// COORDINATOR
// ============================================================================

pub struct BatchCoordinator<'a> {
    store: &'a dyn RegistryStore,
    reconciler: &'a FieldReconciler,
    classifier: &'a RuleEngine,
    clock: &'a dyn Clock,
    ledger: Option<&'a Ledger>,
    retry: RetryPolicy,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> BatchCoordinator<'a> {
    pub fn new(
        store: &'a dyn RegistryStore,
        reconciler: &'a FieldReconciler,
        classifier: &'a RuleEngine,
        clock: &'a dyn Clock,
    ) -> Self {
        BatchCoordinator {
            store,
            reconciler,
            classifier,
            clock,
            ledger: None,
            retry: RetryPolicy::default(),
            cancel: None,
        }
    }

    pub fn with_ledger(mut self, ledger: &'a Ledger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Checked between parks; setting it stops the run after the current commit
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Run `step` over `window`. Only a corrupt or unwritable registry (or
    /// ledger) is an error; everything else is counted in the report.
    pub fn run(&self, step: &dyn EnrichmentStep, window: BatchWindow, force: bool) -> Result<BatchReport> {
        let kind = step.kind();
        let mut registry = self.store.load()?;
        let ids = registry.window(window.offset, window.limit);
        let end = window.offset + ids.len();

        let cursor = cursor_key(kind, force);
        let start = match self.ledger {
            Some(ledger) => match ledger.cursor(&cursor, window.offset, window.limit)? {
                Some(state) if !state.completed => state.next_offset.clamp(window.offset, end),
                _ => window.offset,
            },
            None => window.offset,
        };
        if start > window.offset {
            info!("{}: resuming window {}+{} at offset {}", cursor, window.offset, window.limit, start);
        }

        let mut report = BatchReport::new(kind, window, ids.len(), start);

        // First offset left unenriched by a failed collaborator; the cursor
        // never moves past it
        let mut first_unavailable: Option<usize> = None;

        for (pos, park_id) in ids.iter().enumerate().skip(start - window.offset) {
            let offset = window.offset + pos;
            if self.cancelled() {
                info!("{}: cancelled at offset {}", kind, offset);
                report.interrupted = true;
                break;
            }

            let Some(park) = registry.get(park_id) else {
                report.resume_offset = first_unavailable.unwrap_or(offset + 1);
                continue;
            };

            if park.is_enriched(kind) && !force {
                report.already_done += 1;
            } else if !step.applies_to(park) {
                report.not_applicable += 1;
            } else {
                let now = self.clock.now();
                let label = format!("{} {}", kind, park_id);
                match retry_transient(&self.retry, &label, || step.enrich(park, &registry, now)) {
                    Ok(enrichment) => {
                        let updated = self.commit(&mut registry, park_id, enrichment, kind, now, &mut report)?;
                        self.store.save(&registry)?;
                        report.committed += 1;
                        self.log_commit(&updated, kind, now)?;
                        self.advance(&cursor, window, first_unavailable.unwrap_or(offset + 1), false, now)?;
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!("{}: {} left unenriched: {}", kind, park_id, e);
                        report.unavailable += 1;
                        first_unavailable.get_or_insert(offset);
                    }
                }
            }

            report.resume_offset = first_unavailable.unwrap_or(offset + 1);
        }

        let now = self.clock.now();
        if !report.interrupted {
            report.resume_offset = end;
        }
        self.advance(&cursor, window, report.resume_offset, !report.interrupted, now)?;

        // A finished forced run supersedes whatever a plain run left behind
        if force && !report.interrupted {
            if let Some(ledger) = self.ledger {
                ledger.reset_cursor(&cursor_key(kind, false), window.offset, window.limit)?;
            }
        }

        info!("{}", report.summary());
        Ok(report)
    }

    /// Reconcile, checkpoint and re-classify one park in memory
    fn commit(
        &self,
        registry: &mut Registry,
        park_id: &str,
        enrichment: Enrichment,
        kind: EnrichmentKind,
        now: DateTime<Utc>,
        report: &mut BatchReport,
    ) -> Result<ParkEntity> {
        let mut park = registry
            .get(park_id)
            .cloned()
            .ok_or_else(|| RegistryError::corrupt(0, format!("{} vanished mid-batch", park_id)))?;

        let outcome = self.reconciler.apply_all(&mut park, enrichment.updates);
        for note in enrichment.notes {
            park.add_note(note);
        }
        park.mark_enriched(kind, now);
        self.classifier.apply(&mut park);

        report.fields_updated += outcome.applied.len();
        report.regressions_rejected += outcome.rejected_count();

        if let Some(ledger) = self.ledger {
            for rejected in &outcome.rejected {
                if let RegistryError::RegressionRejected { field, attempted, current, .. } = rejected {
                    ledger.record(&Event::new(
                        "regression_rejected",
                        park_id,
                        serde_json::json!({ "step": kind.as_str(), "field": field, "attempted": attempted, "current": current }),
                        "batch",
                        now,
                    ))?;
                }
            }
        }

        let fields: Vec<&str> = outcome.applied.iter().map(|f| f.as_str()).collect();
        debug!("{}: {} updated {:?}", kind, park_id, fields);

        registry.upsert(park.clone());
        Ok(park)
    }

    fn log_commit(&self, park: &ParkEntity, kind: EnrichmentKind, now: DateTime<Utc>) -> Result<()> {
        if let Some(ledger) = self.ledger {
            ledger.record(&Event::new(
                "enrichment_committed",
                &park.park_id,
                serde_json::json!({ "step": kind.as_str(), "needs_review": park.needs_review }),
                "batch",
                now,
            ))?;
        }
        Ok(())
    }

    fn advance(&self, cursor: &str, window: BatchWindow, next: usize, completed: bool, now: DateTime<Utc>) -> Result<()> {
        if let Some(ledger) = self.ledger {
            ledger.advance_cursor(cursor, window.offset, window.limit, next, completed, now)?;
        }
        Ok(())
    }
}

/// Forced runs keep a cursor of their own so neither kind of run resumes
/// from the other's position
fn cursor_key(kind: EnrichmentKind, force: bool) -> String {
    if force {
        format!("{}+force", kind.as_str())
    } else {
        kind.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Field;
    use crate::provenance::{FixedClock, Provenance, SourceTag};
    use std::cell::{Cell, RefCell};

    /// Registry kept in memory; counts saves
    struct MemoryStore {
        registry: RefCell<Registry>,
        saves: Cell<usize>,
    }

    impl MemoryStore {
        fn with_parks(n: usize) -> Self {
            let mut registry = Registry::new();
            for i in 0..n {
                registry.upsert(ParkEntity::new(format!("park_{:03}", i), Utc::now()));
            }
            MemoryStore {
                registry: RefCell::new(registry),
                saves: Cell::new(0),
            }
        }
    }

    impl RegistryStore for MemoryStore {
        fn load(&self) -> Result<Registry> {
            Ok(self.registry.borrow().clone())
        }

        fn save(&self, registry: &Registry) -> Result<()> {
            *self.registry.borrow_mut() = registry.clone();
            self.saves.set(self.saves.get() + 1);
            Ok(())
        }
    }

    /// Writes the park id into `phone`. Parks in `down` always fail;
    /// the first `blips` calls fail whatever the park. Enriching the park
    /// named in `trip` raises its cancel flag.
    struct PhoneStep {
        down: Vec<String>,
        blips: Cell<usize>,
        calls: Cell<usize>,
        trip: Option<(String, Arc<AtomicBool>)>,
    }

    impl PhoneStep {
        fn new() -> Self {
            PhoneStep {
                down: Vec::new(),
                blips: Cell::new(0),
                calls: Cell::new(0),
                trip: None,
            }
        }

        fn cancelling_at(park_id: &str, cancel: &Arc<AtomicBool>) -> Self {
            PhoneStep {
                trip: Some((park_id.to_string(), cancel.clone())),
                ..PhoneStep::new()
            }
        }
    }

    impl EnrichmentStep for PhoneStep {
        fn kind(&self) -> EnrichmentKind {
            EnrichmentKind::Address
        }

        fn applies_to(&self, park: &ParkEntity) -> bool {
            park.park_id != "park_004"
        }

        fn enrich(&self, park: &ParkEntity, _registry: &Registry, at: DateTime<Utc>) -> Result<Enrichment> {
            self.calls.set(self.calls.get() + 1);
            if let Some((id, cancel)) = &self.trip {
                if *id == park.park_id {
                    cancel.store(true, Ordering::SeqCst);
                }
            }
            if self.blips.get() > 0 {
                self.blips.set(self.blips.get() - 1);
                return Err(RegistryError::unavailable("phone", "timeout"));
            }
            if self.down.contains(&park.park_id) {
                return Err(RegistryError::unavailable("phone", "service down"));
            }
            Ok(Enrichment::new().with_update(FieldUpdate::text(
                Field::Phone,
                park.park_id.clone(),
                Provenance::new(SourceTag::Geocoder, at),
            )))
        }
    }

    fn coordinator<'a>(
        store: &'a MemoryStore,
        reconciler: &'a FieldReconciler,
        classifier: &'a RuleEngine,
        clock: &'a FixedClock,
    ) -> BatchCoordinator<'a> {
        BatchCoordinator::new(store, reconciler, classifier, clock).with_retry(RetryPolicy::immediate(3))
    }

    #[test]
    fn test_window_commits_and_skips() {
        let store = MemoryStore::with_parks(10);
        let (reconciler, classifier, clock) = (FieldReconciler::default(), RuleEngine::default(), FixedClock::at(2025, 2, 1));
        let step = PhoneStep::new();

        let report = coordinator(&store, &reconciler, &classifier, &clock)
            .run(&step, BatchWindow::new(2, 5), false)
            .unwrap();

        assert_eq!(report.selected, 5);
        assert_eq!(report.committed, 4);
        assert_eq!(report.not_applicable, 1);
        assert_eq!(report.resume_offset, 7);
        assert_eq!(store.saves.get(), 4);

        let registry = store.load().unwrap();
        assert_eq!(registry.get("park_002").unwrap().text(Field::Phone), Some("park_002"));
        assert!(registry.get("park_001").unwrap().text(Field::Phone).is_none());
        assert!(registry.get("park_002").unwrap().is_enriched(EnrichmentKind::Address));

        // re-run: nothing to do
        let again = coordinator(&store, &reconciler, &classifier, &clock)
            .run(&step, BatchWindow::new(2, 5), false)
            .unwrap();
        assert_eq!(again.committed, 0);
        assert_eq!(again.already_done, 4);
        assert_eq!(store.load().unwrap(), registry);
    }

    #[test]
    fn test_force_reprocesses() {
        let store = MemoryStore::with_parks(3);
        let (reconciler, classifier, clock) = (FieldReconciler::default(), RuleEngine::default(), FixedClock::at(2025, 2, 1));
        let step = PhoneStep::new();
        let c = coordinator(&store, &reconciler, &classifier, &clock);

        c.run(&step, BatchWindow::all(), false).unwrap();
        let forced = c.run(&step, BatchWindow::all(), true).unwrap();
        assert_eq!(forced.committed, 3);
        assert_eq!(forced.fields_updated, 0);
    }

    #[test]
    fn test_transient_failure_retried_then_left_unenriched() {
        let store = MemoryStore::with_parks(3);
        let (reconciler, classifier, clock) = (FieldReconciler::default(), RuleEngine::default(), FixedClock::at(2025, 2, 1));

        let mut step = PhoneStep::new();
        step.down = vec!["park_001".to_string()];
        let report = coordinator(&store, &reconciler, &classifier, &clock)
            .run(&step, BatchWindow::all(), false)
            .unwrap();

        assert_eq!(report.unavailable, 1);
        assert_eq!(report.committed, 2);
        // park_000 once, park_001 three attempts, park_002 once
        assert_eq!(step.calls.get(), 5);
        let registry = store.load().unwrap();
        assert!(!registry.get("park_001").unwrap().is_enriched(EnrichmentKind::Address));
    }

    #[test]
    fn test_retry_recovers_from_blip() {
        let store = MemoryStore::with_parks(1);
        let (reconciler, classifier, clock) = (FieldReconciler::default(), RuleEngine::default(), FixedClock::at(2025, 2, 1));

        let step = PhoneStep::new();
        step.blips.set(2);

        let report = coordinator(&store, &reconciler, &classifier, &clock)
            .run(&step, BatchWindow::all(), false)
            .unwrap();
        assert_eq!(report.unavailable, 0);
        assert_eq!(report.committed, 1);
        assert_eq!(step.calls.get(), 3);
        println!("✅ two timeouts absorbed by retry");
    }

    #[test]
    fn test_cancel_stops_between_parks_and_resumes() {
        let store = MemoryStore::with_parks(5);
        let (reconciler, classifier, clock) = (FieldReconciler::default(), RuleEngine::default(), FixedClock::at(2025, 2, 1));
        let ledger = Ledger::open_in_memory().unwrap();
        let step = PhoneStep::new();

        let cancel = Arc::new(AtomicBool::new(true));
        let report = coordinator(&store, &reconciler, &classifier, &clock)
            .with_ledger(&ledger)
            .with_cancel(cancel.clone())
            .run(&step, BatchWindow::new(0, 5), false)
            .unwrap();
        assert!(report.interrupted);
        assert_eq!(report.committed, 0);
        assert_eq!(report.resume_offset, 0);

        cancel.store(false, Ordering::SeqCst);
        let report = coordinator(&store, &reconciler, &classifier, &clock)
            .with_ledger(&ledger)
            .with_cancel(cancel)
            .run(&step, BatchWindow::new(0, 5), false)
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.committed, 4);
        assert!(ledger.cursor("address", 0, 5).unwrap().unwrap().completed);
        assert_eq!(ledger.count_events("enrichment_committed").unwrap(), 4);
    }

    #[test]
    fn test_unavailable_park_retried_after_interrupted_run() {
        let store = MemoryStore::with_parks(5);
        let (reconciler, classifier, clock) = (FieldReconciler::default(), RuleEngine::default(), FixedClock::at(2025, 2, 1));
        let ledger = Ledger::open_in_memory().unwrap();
        let cancel = Arc::new(AtomicBool::new(false));

        // park_001's service is down; the run is cancelled while on park_002
        let mut step = PhoneStep::cancelling_at("park_002", &cancel);
        step.down = vec!["park_001".to_string()];
        let first = coordinator(&store, &reconciler, &classifier, &clock)
            .with_ledger(&ledger)
            .with_cancel(cancel.clone())
            .run(&step, BatchWindow::new(0, 5), false)
            .unwrap();
        assert!(first.interrupted);
        assert_eq!(first.committed, 2);
        assert_eq!(first.unavailable, 1);
        assert_eq!(first.resume_offset, 1);
        assert_eq!(ledger.cursor("address", 0, 5).unwrap().unwrap().next_offset, 1);

        // service back up
        cancel.store(false, Ordering::SeqCst);
        let second = coordinator(&store, &reconciler, &classifier, &clock)
            .with_ledger(&ledger)
            .with_cancel(cancel)
            .run(&PhoneStep::new(), BatchWindow::new(0, 5), false)
            .unwrap();
        assert_eq!(second.started_at_offset, 1);
        assert_eq!(second.committed, 2);
        assert_eq!(second.already_done, 1);
        assert_eq!(second.not_applicable, 1);
        assert!(second.is_complete());

        let registry = store.load().unwrap();
        assert_eq!(registry.get("park_001").unwrap().text(Field::Phone), Some("park_001"));
        println!("✅ unavailable park picked up on resume");
    }

    #[test]
    fn test_forced_run_ignores_plain_cursor() {
        let store = MemoryStore::with_parks(5);
        let (reconciler, classifier, clock) = (FieldReconciler::default(), RuleEngine::default(), FixedClock::at(2025, 2, 1));
        let ledger = Ledger::open_in_memory().unwrap();
        let cancel = Arc::new(AtomicBool::new(false));

        let step = PhoneStep::cancelling_at("park_002", &cancel);
        let plain = coordinator(&store, &reconciler, &classifier, &clock)
            .with_ledger(&ledger)
            .with_cancel(cancel.clone())
            .run(&step, BatchWindow::new(0, 5), false)
            .unwrap();
        assert!(plain.interrupted);
        assert_eq!(plain.resume_offset, 3);

        cancel.store(false, Ordering::SeqCst);
        let forced = coordinator(&store, &reconciler, &classifier, &clock)
            .with_ledger(&ledger)
            .with_cancel(cancel)
            .run(&PhoneStep::new(), BatchWindow::new(0, 5), true)
            .unwrap();
        assert_eq!(forced.started_at_offset, 0);
        assert_eq!(forced.committed, 4);
        assert_eq!(forced.not_applicable, 1);

        // the finished forced run also clears the stale plain cursor
        assert!(ledger.cursor("address", 0, 5).unwrap().is_none());
        assert!(ledger.cursor("address+force", 0, 5).unwrap().unwrap().completed);
    }

    #[test]
    fn test_retry_transient_passes_through_other_errors() {
        let calls = Cell::new(0);
        let result: Result<()> = retry_transient(&RetryPolicy::immediate(5), "test", || {
            calls.set(calls.get() + 1);
            Err(RegistryError::corrupt(1, "bad"))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
