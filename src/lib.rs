pub mod engine_config;
pub mod match_rule;
pub mod rule_factory;
pub mod conversion_rule;
pub mod configuration;
pub mod accumulator;
pub mod event_parameters;
pub mod selector;
pub mod context;
pub mod store;
pub mod refresh;

pub use engine_config::{EngineConfig, EngineConfigError};

pub use match_rule::{
    EventParameters, MatchRule, MultiEntryRule, OperatorCategory, RuleCondition, RuleOperator,
    SingleEntryRule,
};

pub use rule_factory::{
    RuleFactory,            // Wire format parser
    RuleParseError,         // Parse errors
};

// Re-export rule and configuration types
pub use conversion_rule::{
    events_satisfied, CoarseValue, CoarseValueConfig, CoarseValueRule, ConversionValueRule,
    EventRequirement, LockWindowRule, LockWindowTrigger,
};

pub use configuration::{ConfigMode, Configuration, ConfigurationError};

pub use accumulator::{EventAccumulator, ValueMergePolicy};

pub use event_parameters::{in_segment_value, processed_parameters};

pub use selector::{
    AttributionSelector,    // Pure value selection
    AttributionWindow,      // Window start and last update
    SelectionResult,        // Selected values and finality
    WindowId,               // Window identifier
};

pub use context::{
    AttributionContext,     // Mutable attribution state
    ContextSnapshot,        // Persistable state
    InstallOutcome,         // Result of offering a configuration
    Postback,               // Decision for the postback sender
    SharedContext,          // Mutex-guarded context
};

pub use store::{
    ConfigurationFetcher, FetchError, InMemorySnapshotStore, JsonFileSnapshotStore,
    SnapshotStore, StoreError,
};

pub use refresh::{ConfigurationRefresher, RefreshError, RefreshStats};
