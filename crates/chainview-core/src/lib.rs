pub mod chain;
pub mod completion;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod record;
pub mod region;
pub mod segments;
pub mod session;

pub use chain::{ChainComposer, ChainNode, NodeStatus};
pub use completion::{CompletionTracker, Progress, SessionOutcome};
pub use config::{AggregatorConfig, ConfigError};
pub use connection::{ConnectAttempt, ConnectionState, ConnectionStats, ConnectionSupervisor};
pub use dedup::{DedupStats, IdentityFilter};
pub use record::{DecodeError, DecodedFrame, RawFrame, RecordDecoder, RecordKind, StreamRecord};
pub use region::{AggregatorError, MergeOutcome, RegionAggregator, RegionState};
pub use segments::{Segment, SegmentKind, SegmentParser};
pub use session::{AggregatorSession, IngestOutcome};
