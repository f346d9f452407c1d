pub mod access;
pub mod audit;
pub mod compressed;
pub mod consolidation;
pub mod content_store;
pub mod error;
pub mod graph;
pub mod index;
pub mod manager;
pub mod schema;
pub mod store;
pub mod synthesis;
pub mod teams;
pub mod vector;

pub use consolidation::{ConsolidationReport, PatternResult};
pub use error::{Result, SubstrateError};
pub use graph::{AssociationGraph, Edge, RelationType, TraversalHit};
pub use manager::{MemoryStats, SubstrateManager, WriteOutcome};
pub use schema::{Emotion, FormationContext, Isolation, Marks, Record, RecordType, Tier, truncate_str};
pub use store::StoreCacheStats;
pub use synthesis::{Algorithm, RecallOptions, SynthesisResult, TurnContext};
pub use vector::{Embedder, LocalHeuristicEmbedder};
