// ABOUTME: Platform-agnostic relay and identity-mapping engine for the Slack/Discord bridge
// ABOUTME: Provides the traits the platform bindings implement and the relay state machine

pub mod config;
pub mod dedup;
pub mod format;
pub mod identity;
pub mod metrics;
pub mod orchestrator;
pub mod paths;
pub mod retry;
pub mod router;
pub mod sender_merge;
pub mod staging;
pub mod traits;

// Re-export the types bindings and the bridge wire together
pub use dedup::DedupCache;
pub use format::{MessageFormatter, Segments};
pub use identity::{
    IdentityStore, MemoryIdentityStore, MessageIdentity, MessageKey, SqliteIdentityStore,
};
pub use orchestrator::{
    BridgeIdentity, DropReason, IgnoreReason, RelayError, RelayOrchestrator, RelayOutcome,
    RelayReceipt, ThreadPolicy,
};
pub use retry::{PollResult, RetryPolicy};
pub use router::{ChannelMapping, ChannelRouter, Route};
pub use sender_merge::SenderMergeTracker;
pub use staging::{staged_path, StagedFile, StagingArea};
pub use traits::{
    AttachmentInfo, ChannelRef, ChatUser, DirectoryLookup, EventSource, EventStream,
    FetchedMessage, InboundEvent, InboundSource, Mention, OutboundSender, Platform, SendTarget,
    SentMessage,
};
