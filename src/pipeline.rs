// 🏗️ Ingest pipeline - raw observations → canonical registry
//
//   normalize → resolve (against existing parks) → reconcile → classify → save
//
// One ingest is one registry commit. Re-ingesting the same observations
// converges to the same registry.

use crate::classifier::RuleEngine;
use crate::config::RegistryConfig;
use crate::entity::{derive_park_id, ParkEntity};
use crate::error::{RegistryError, Result};
use crate::geo::Jurisdiction;
use crate::ledger::{Event, Ledger};
use crate::normalizer::normalize_all;
use crate::provenance::Clock;
use crate::reconciler::{FieldReconciler, ReconcileOutcome};
use crate::registry::{Registry, RegistryStore};
use crate::resolver::{Anchor, EntityResolver, MergeCluster, ResolutionStats};
use crate::sources::{BrandDirectory, FeatureSource, RawRecord};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::json;

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub observed: usize,
    pub malformed: usize,
    pub clusters: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub fields_updated: usize,
    pub regressions_rejected: usize,
    pub ambiguous: usize,
    pub resolution: ResolutionStats,
}

impl IngestReport {
    pub fn summary(&self) -> String {
        format!(
            "{} observations ({} malformed) → {} clusters: {} new parks, {} updated, {} unchanged; {} fields written, {} regressions rejected, {} ambiguous merges",
            self.observed,
            self.malformed,
            self.clusters,
            self.created,
            self.updated,
            self.unchanged,
            self.fields_updated,
            self.regressions_rejected,
            self.ambiguous
        )
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline<'a> {
    store: &'a dyn RegistryStore,
    clock: &'a dyn Clock,
    resolver: EntityResolver,
    reconciler: FieldReconciler,
    classifier: RuleEngine,
    ledger: Option<&'a Ledger>,
}

impl<'a> Pipeline<'a> {
    pub fn new(store: &'a dyn RegistryStore, config: &RegistryConfig, clock: &'a dyn Clock) -> Self {
        Pipeline {
            store,
            clock,
            resolver: EntityResolver::new(config.resolver.clone()),
            reconciler: FieldReconciler::new(config.precedence.clone(), config.reconciler.clone()),
            classifier: RuleEngine::default(),
            ledger: None,
        }
    }

    pub fn with_rules(mut self, classifier: RuleEngine) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_ledger(mut self, ledger: &'a Ledger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn reconciler(&self) -> &FieldReconciler {
        &self.reconciler
    }

    pub fn classifier(&self) -> &RuleEngine {
        &self.classifier
    }

    /// Fold one set of raw observations into the registry
    pub fn ingest(&self, raws: &[RawRecord]) -> Result<IngestReport> {
        let now = self.clock.now();
        let mut registry = self.store.load()?;
        let mut report = IngestReport {
            observed: raws.len(),
            ..Default::default()
        };

        // 1. Normalize (malformed records are skipped)
        let (candidates, malformed) = normalize_all(raws);
        for e in &malformed {
            warn!("{}", e);
        }
        report.malformed = malformed.len();

        // 2. Resolve against parks already in the registry
        let anchors: Vec<Anchor> = registry.iter().map(Anchor::from_entity).collect();
        let resolution = self.resolver.resolve_against(&candidates, &anchors);
        report.clusters = resolution.clusters.len();
        report.resolution = resolution.stats;

        // 3. Reconcile + classify each cluster
        let mut events = Vec::new();
        for cluster in &resolution.clusters {
            let (mut park, created) = self.target_park(&registry, cluster, now);
            let outcome = self.reconciler.reconcile(&mut park, cluster);
            let before = registry.get(&park.park_id).cloned();
            self.classifier.apply(&mut park);

            report.fields_updated += outcome.applied.len();
            report.regressions_rejected += outcome.rejected_count();
            report.ambiguous += outcome.ambiguous.len();
            if created {
                report.created += 1;
            } else if before.as_ref() != Some(&park) {
                report.updated += 1;
            } else {
                report.unchanged += 1;
            }

            if self.ledger.is_some() && (created || before.as_ref() != Some(&park)) {
                events.extend(cluster_events(&park, cluster, &outcome, created, now));
            }
            registry.upsert(park);
        }

        // 4. Commit
        self.store.save(&registry)?;
        if let Some(ledger) = self.ledger {
            for event in &events {
                ledger.record(event)?;
            }
        }

        info!("ingest: {}", report.summary());
        Ok(report)
    }

    /// Existing park for an attached cluster, or a fresh one with an id
    /// derived from the identity member
    fn target_park(&self, registry: &Registry, cluster: &MergeCluster, now: DateTime<Utc>) -> (ParkEntity, bool) {
        if let Some(existing) = cluster.park_id.as_deref().and_then(|id| registry.get(id)) {
            return (existing.clone(), false);
        }

        let (name, point) = self
            .reconciler
            .identity_anchor(&cluster.members)
            .map(|m| (m.normalized_name.as_str(), m.point))
            .unwrap_or(("", None));
        let base = derive_park_id(name, point);

        // Same name in the same cell but kept apart by the resolver
        let mut park_id = base.clone();
        let mut n = 2;
        while registry.contains(&park_id) {
            park_id = format!("{}-{}", base, n);
            n += 1;
        }
        debug!("new park {} from {} observations", park_id, cluster.len());

        (ParkEntity::new(park_id, now), true)
    }

    /// Run every fetcher; a fetcher that fails is logged and skipped.
    /// Returns the records plus the number of failed fetches.
    pub fn collect_observations(
        features: &[&dyn FeatureSource],
        regions: &[Jurisdiction],
        directories: &[&dyn BrandDirectory],
    ) -> (Vec<RawRecord>, usize) {
        let mut records = Vec::new();
        let mut failed = 0;

        for source in features {
            for region in regions {
                match source.fetch(*region) {
                    Ok(batch) => {
                        info!("{} {}: {} features", source.name(), region.code(), batch.len());
                        records.extend(batch);
                    }
                    Err(e) => {
                        warn!("{} {} skipped: {}", source.name(), region.code(), e);
                        failed += 1;
                    }
                }
            }
        }
        for directory in directories {
            match directory.fetch() {
                Ok(batch) => {
                    info!("{} directory: {} parks", directory.brand(), batch.len());
                    records.extend(batch);
                }
                Err(e) => {
                    warn!("{} directory skipped: {}", directory.brand(), e);
                    failed += 1;
                }
            }
        }

        (records, failed)
    }
}

fn cluster_events(
    park: &ParkEntity,
    cluster: &MergeCluster,
    outcome: &ReconcileOutcome,
    created: bool,
    now: DateTime<Utc>,
) -> Vec<Event> {
    let refs: Vec<String> = cluster
        .members
        .iter()
        .map(|m| m.source_ref.clone().unwrap_or_else(|| m.source.to_string()))
        .collect();
    let fields: Vec<&str> = outcome.applied.iter().map(|f| f.as_str()).collect();

    let mut events = vec![Event::new(
        if created { "park_created" } else { "park_merged" },
        &park.park_id,
        json!({ "members": refs, "fields": fields }),
        "ingest",
        now,
    )];

    for err in outcome.rejected.iter().chain(outcome.ambiguous.iter()) {
        let (event_type, data) = match err {
            RegistryError::RegressionRejected { field, attempted, current, .. } => (
                "regression_rejected",
                json!({ "field": field, "attempted": attempted, "current": current }),
            ),
            RegistryError::AmbiguousMerge { reason, .. } => ("ambiguous_merge", json!({ "reason": reason })),
            other => ("ingest_error", json!({ "error": other.to_string() })),
        };
        events.push(Event::new(event_type, &park.park_id, data, "ingest", now));
    }

    events
}
