// src/lib.rs
// Public library surface for the daemon binary and integration tests.

pub mod align;
pub mod api;
pub mod coordinator;
pub mod governor;
pub mod ingest;
pub mod metrics;
pub mod sentiment;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::align::{AlignedRecord, AlignmentEngine, IngestOutcome, LateObservation};
pub use crate::api::{create_router, AppState};
pub use crate::coordinator::{Coordinator, HealthSnapshot, Lifecycle, PipelineError, StopReport};
pub use crate::governor::{Grant, GovernorError, QuarantineReason, RateGovernor};
pub use crate::ingest::config::{load_config_default, load_config_from, PipelineConfig};
pub use crate::ingest::types::{Entity, FetchError, Observation, ObservationId, SourceAdapter, ValueKind};
pub use crate::store::{Cursor, DurableStore, RecordPage, StoreError, WriteOutcome};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Events are emitted under the component targets, not the crate path.
pub const DEFAULT_LOG_FILTER: &str =
    "cryptopulse_ingest=info,ingest=info,governor=info,store=info,pipeline=info,warn";

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter; `LOG_FORMAT=json` switches to JSON lines. Safe to call twice.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let res = if json {
        registry.with(fmt::layer().json().with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    if res.is_err() {
        tracing::debug!("tracing already initialized");
    }
}
