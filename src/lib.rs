// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod config;
pub mod deliver;
pub mod digest;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod lang;
pub mod normalize;
pub mod rules;
pub mod scheduler;
pub mod store;
pub mod types;

// ---- Re-exports for stable public API ----
pub use crate::deliver::{BufferSink, DeliverySink};
pub use crate::digest::{Digest, DigestGenerator, GeneratorConfig, StorySummary, WindowBuffer};
pub use crate::error::{DigestError, GatewayError, SourceError};
pub use crate::gateway::{LlmGateway, LlmProvider, OpenAiProvider, StubProvider};
pub use crate::ingest::types::{PollStats, SourceClient};
pub use crate::ingest::{ChannelRegistry, Poller, PollerConfig};
pub use crate::rules::{AlertRule, FilterRule, MatchDecision, Outcome, RuleEngine, RuleKind};
pub use crate::store::{MemoryStateStore, RuleSource, StateStore, StaticRules};
pub use crate::types::{Channel, Fingerprint, NormalizedPost, RawItem};
