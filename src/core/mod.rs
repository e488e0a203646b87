// Core matching exports
pub mod engine;
pub mod lifecycle;
pub mod matcher;
pub mod policy;
pub mod queue;

pub use engine::{EngineError, MatchEngine};
pub use lifecycle::{LifecycleConfig, LifecycleError, LifecycleManager};
pub use matcher::{ClaimRegistry, MatchedSet, Matcher, MatcherConfig, NoReservations, PassOutcome};
pub use policy::{CompatibilityPolicy, ConversationPolicy};
pub use queue::{QueueError, RequestQueue};
