// Park Registry - Core Library
// Deduplicated registry of caravan and holiday parks built from overlapping
// sources. Exposes all modules for the CLI and tests.

pub mod error;
pub mod config;
pub mod provenance;
pub mod geo;
pub mod names;
pub mod sources;
pub mod entity;
pub mod normalizer;
pub mod resolver;
pub mod reconciler;
pub mod registry;
pub mod ledger;
pub mod batch;
pub mod aggregator;
pub mod classifier;
pub mod enrichment;
pub mod pipeline;

// Re-export commonly used types
pub use error::{RegistryError, Result};
pub use config::{
    AggregatorConfig, PrecedenceTable, ReconcilerConfig, RegistryConfig, ResolverConfig, RetryPolicy,
};
pub use provenance::{Clock, FixedClock, Provenance, SourceTag, SystemClock};
pub use geo::{GeoPoint, GridCell, Jurisdiction};
pub use sources::{
    load_observations, AddressLookup, BrandDirectory, FeatureSource, Geocoder, ParcelQuery,
    ParcelReference, PlaceDetails, PlaceMatch, RawRecord,
};
pub use entity::{
    derive_park_id, BusinessStatus, CandidateRecord, Category, EnrichmentKind, Field, FieldValue,
    OpeningStatus, ParkEntity,
};
pub use normalizer::{normalize, normalize_all};
pub use resolver::{cluster_signature, Anchor, EntityResolver, MergeCluster, Resolution};
pub use reconciler::{FieldReconciler, FieldUpdate, ReconcileOutcome, WriteDecision};
pub use registry::{CsvRegistryStore, Registry, RegistryRow, RegistryStore};
pub use ledger::{Event, Ledger};
pub use batch::{retry_transient, BatchCoordinator, BatchReport, BatchWindow, Enrichment, EnrichmentStep};
pub use aggregator::{AreaConfidence, AreaEstimate, ParcelAggregator, ParcelFlag};
pub use classifier::{Classification, ClassificationRule, RuleEngine};
pub use enrichment::{AddressStep, BrandInferenceStep, ParcelAreaStep, PlaceDetailsStep};
pub use pipeline::{IngestReport, Pipeline};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
