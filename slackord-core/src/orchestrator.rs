// ABOUTME: Relay state machine for one direction of the bridge
// ABOUTME: Dedup, routing, file staging, thread parent resolution, rendering, dispatch, identity persistence

use crate::{
    dedup::{DedupCache, DEFAULT_RETENTION},
    format::{mention_ids, thread_name, ChannelContext, MessageFormatter, RenderInput},
    identity::{IdentityStore, MessageIdentity, MessageKey},
    metrics,
    retry::{poll, PollResult, RetryPolicy},
    router::{ChannelRouter, Route},
    sender_merge::SenderMergeTracker,
    staging::{staged_filename, StagedFile, StagingArea},
    traits::{
        AttachmentInfo, DirectoryLookup, InboundEvent, InboundSource, OutboundSender, Platform,
        SendTarget,
    },
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What to do with a thread reply whose parent mirror never showed up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadPolicy {
    /// Relay it as a new top-level message
    #[default]
    PostTopLevel,
    /// Do not relay it
    Drop,
}

/// The bridge's own user on each side of this direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeIdentity {
    pub source_user_id: String,
    pub destination_user_id: String,
}

impl BridgeIdentity {
    pub fn new(source_user_id: impl Into<String>, destination_user_id: impl Into<String>) -> Self {
        Self {
            source_user_id: source_user_id.into(),
            destination_user_id: destination_user_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Event key already processed within the retention window
    Duplicate,
    /// Posted by the bridge itself
    SelfAuthored,
    /// Every attachment on the event was already relayed
    DuplicateFiles,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// No mapping and no overflow channel
    Unroutable,
    /// Parent mirror never appeared and the policy is to drop
    OrphanedReply,
    /// No text, and every attachment failed to stage
    NothingToRelay,
}

/// Summary of a completed relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReceipt {
    pub source: MessageKey,
    /// Message carrying the last segment (and any files)
    pub destination: MessageKey,
    pub target: SendTarget,
    pub segments: usize,
    pub files: usize,
    pub header_shown: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Ignored(IgnoreReason),
    Dropped(DropReason),
    Relayed(RelayReceipt),
}

impl RelayOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ignored(_) => "ignored",
            Self::Dropped(_) => "dropped",
            Self::Relayed(_) => "relayed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Destination refused a segment; nothing was persisted
    #[error("destination send failed after {sent} segment(s): {error}")]
    DestinationSend {
        sent: usize,
        #[source]
        error: anyhow::Error,
    },
    /// The mirror exists but its identity could not be recorded
    #[error("{source_key} was mirrored as {destination} but the identity was not recorded: {error}")]
    IdentityInconsistency {
        source_key: MessageKey,
        destination: MessageKey,
        #[source]
        error: anyhow::Error,
    },
}

impl RelayError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DestinationSend { .. } => "destination_send",
            Self::IdentityInconsistency { .. } => "identity_inconsistency",
        }
    }
}

/// Relays events from one platform to the other
pub struct RelayOrchestrator {
    source: Arc<dyn InboundSource>,
    destination: Arc<dyn OutboundSender>,
    directory: Arc<dyn DirectoryLookup>,
    identities: Arc<dyn IdentityStore>,
    router: ChannelRouter,
    bridge: BridgeIdentity,
    events: Arc<DedupCache>,
    files: Arc<DedupCache>,
    senders: Arc<SenderMergeTracker>,
    formatter: MessageFormatter,
    parent_poll: RetryPolicy,
    orphan_policy: ThreadPolicy,
    staging_root: PathBuf,
    cancel: CancellationToken,
}

impl RelayOrchestrator {
    /// Create an orchestrator with private caches and default policies
    pub fn new(
        source: Arc<dyn InboundSource>,
        destination: Arc<dyn OutboundSender>,
        directory: Arc<dyn DirectoryLookup>,
        identities: Arc<dyn IdentityStore>,
        router: ChannelRouter,
        bridge: BridgeIdentity,
    ) -> Self {
        let formatter = MessageFormatter::new(destination.platform(), destination.max_message_len());
        Self {
            source,
            destination,
            directory,
            identities,
            router,
            bridge,
            events: Arc::new(DedupCache::for_events(DEFAULT_RETENTION)),
            files: Arc::new(DedupCache::for_files(DEFAULT_RETENTION)),
            senders: Arc::new(SenderMergeTracker::default()),
            formatter,
            parent_poll: RetryPolicy::parent_lookup(),
            orphan_policy: ThreadPolicy::default(),
            staging_root: std::env::temp_dir().join("slackord-staging"),
            cancel: CancellationToken::new(),
        }
    }

    /// Share dedup caches with the opposite direction
    pub fn with_dedup(mut self, events: Arc<DedupCache>, files: Arc<DedupCache>) -> Self {
        self.events = events;
        self.files = files;
        self
    }

    pub fn with_sender_tracker(mut self, senders: Arc<SenderMergeTracker>) -> Self {
        self.senders = senders;
        self
    }

    pub fn with_parent_poll(mut self, policy: RetryPolicy) -> Self {
        self.parent_poll = policy;
        self
    }

    pub fn with_orphan_policy(mut self, policy: ThreadPolicy) -> Self {
        self.orphan_policy = policy;
        self
    }

    pub fn with_staging_root(mut self, root: PathBuf) -> Self {
        self.staging_root = root;
        self
    }

    pub fn with_max_message_len(mut self, max_len: usize) -> Self {
        self.formatter = MessageFormatter::new(self.destination.platform(), max_len);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn source_platform(&self) -> Platform {
        self.source.platform()
    }

    pub fn destination_platform(&self) -> Platform {
        self.destination.platform()
    }

    /// Run one inbound event to a terminal state
    pub async fn handle(&self, event: InboundEvent) -> Result<RelayOutcome, RelayError> {
        let result = self.relay(&event).await;

        let source = event.platform.as_str();
        match &result {
            Ok(outcome) => metrics::record_relay_event(source, outcome.label()),
            Err(e) => {
                metrics::record_relay_event(source, "failed");
                metrics::record_error(e.kind());
                match e {
                    RelayError::IdentityInconsistency { .. } => tracing::error!(
                        event_id = %event.dedup_key,
                        channel = %event.channel_id,
                        error = %e,
                        "Identity inconsistency: mirror posted without a recorded identity"
                    ),
                    _ => tracing::warn!(
                        event_id = %event.dedup_key,
                        channel = %event.channel_id,
                        error = %e,
                        "Relay failed"
                    ),
                }
            }
        }
        result
    }

    async fn relay(&self, event: &InboundEvent) -> Result<RelayOutcome, RelayError> {
        let src = event.platform;
        let preview = event.preview();
        tracing::info!(
            event_id = %event.dedup_key,
            source = %src,
            channel = %event.channel_id,
            author = %event.author.id,
            preview = %preview,
            "Relay received"
        );

        // ── DEDUP_CHECKED ──
        if self.events.seen_or_record(&format!("{}:{}", src, event.dedup_key)) {
            tracing::info!(event_id = %event.dedup_key, "Ignored: duplicate event");
            return Ok(RelayOutcome::Ignored(IgnoreReason::Duplicate));
        }
        if event.author.id == self.bridge.source_user_id {
            // Echo of our own mirror: remember it so the other direction can merge headers
            self.senders.record(src, &event.channel_id, &event.author.id);
            tracing::debug!(
                event_id = %event.dedup_key,
                channel = %event.channel_id,
                "Ignored: self-authored"
            );
            return Ok(RelayOutcome::Ignored(IgnoreReason::SelfAuthored));
        }

        // ── ROUTED ──
        let route = self.router.route(&event.channel_id);
        let dest_channel = match &route {
            Route::Mapped(dest) | Route::Fallback(dest) => dest.clone(),
            Route::Unroutable => {
                tracing::info!(
                    event_id = %event.dedup_key,
                    channel = %event.channel_id,
                    "Dropped: channel has no mapping and no fallback"
                );
                return Ok(RelayOutcome::Dropped(DropReason::Unroutable));
            }
        };

        // File ids are recorded only once the event is known to be relayed
        let fresh: Vec<&AttachmentInfo> = event
            .attachments
            .iter()
            .filter(|a| {
                let seen = self.files.contains(&file_key(src, &a.id));
                if seen {
                    metrics::record_attachment("duplicate");
                }
                !seen
            })
            .collect();
        if !event.attachments.is_empty() && fresh.is_empty() {
            tracing::info!(
                event_id = %event.dedup_key,
                files = event.attachments.len(),
                "Ignored: all attachments already relayed"
            );
            return Ok(RelayOutcome::Ignored(IgnoreReason::DuplicateFiles));
        }

        let context = if route.is_fallback() {
            ChannelContext::Unmapped {
                channel_name: self.lookup_channel_name(&event.channel_id).await,
            }
        } else {
            ChannelContext::Mapped
        };
        tracing::debug!(
            event_id = %event.dedup_key,
            destination = %dest_channel,
            fallback = route.is_fallback(),
            "Routed"
        );

        // ── FILES_STAGED ──
        let staging = if fresh.is_empty() {
            None
        } else {
            match StagingArea::create(&self.staging_root) {
                Ok(area) => Some(area),
                Err(e) => {
                    tracing::warn!(error = %e, "Could not create staging area, relaying text only");
                    metrics::record_error("staging");
                    None
                }
            }
        };
        let mut staged = Vec::new();
        if let Some(area) = &staging {
            for attachment in &fresh {
                match self.source.download(attachment, area.path()).await {
                    Ok(path) => {
                        let filename = path
                            .file_name()
                            .and_then(|f| f.to_str())
                            .map(str::to_string)
                            .unwrap_or_else(|| {
                                staged_filename(
                                    &attachment.id,
                                    attachment.filename.as_deref(),
                                    &attachment.mime_type,
                                )
                            });
                        metrics::record_attachment("staged");
                        staged.push(StagedFile::new(path, filename, &attachment.mime_type));
                    }
                    Err(e) => {
                        metrics::record_attachment("failed");
                        tracing::warn!(
                            event_id = %event.dedup_key,
                            file_id = %attachment.id,
                            error = %e,
                            "Attachment download failed, continuing without it"
                        );
                    }
                }
            }
            tracing::debug!(
                event_id = %event.dedup_key,
                staged = staged.len(),
                requested = fresh.len(),
                "Files staged"
            );
        }

        if staged.is_empty() && event.text.trim().is_empty() && event.stickers.is_empty() {
            tracing::warn!(
                event_id = %event.dedup_key,
                files = fresh.len(),
                "Dropped: no text and no attachment could be staged"
            );
            return Ok(RelayOutcome::Dropped(DropReason::NothingToRelay));
        }

        // ── PARENT_RESOLVED ──
        let target = match event.channel.root_message_id() {
            None => SendTarget::Channel {
                channel_id: dest_channel.clone(),
            },
            Some(root) => match self.resolve_parent(src, root).await {
                Some(parent) => self.thread_target(&dest_channel, &parent.id).await,
                None => match self.orphan_policy {
                    ThreadPolicy::PostTopLevel => {
                        tracing::warn!(
                            event_id = %event.dedup_key,
                            root = %root,
                            "Parent mirror not found, posting reply as a top-level message"
                        );
                        SendTarget::Channel {
                            channel_id: dest_channel.clone(),
                        }
                    }
                    ThreadPolicy::Drop => {
                        tracing::warn!(
                            event_id = %event.dedup_key,
                            root = %root,
                            "Dropped: parent mirror not found"
                        );
                        return Ok(RelayOutcome::Dropped(DropReason::OrphanedReply));
                    }
                },
            },
        };

        for attachment in &fresh {
            self.files.seen_or_record(&file_key(src, &attachment.id));
        }

        // ── RENDERED ──
        let author = self.author_name(event).await;
        let mentions = self.mention_names(event).await;
        let suppress_header = self.senders.should_suppress_header(
            src,
            &event.channel_id,
            &event.author.id,
            &dest_channel,
            &self.bridge.destination_user_id,
        );
        self.senders.record(src, &event.channel_id, &event.author.id);

        let segments = self.formatter.render(&RenderInput {
            author: &author,
            text: &event.text,
            mentions: &mentions,
            stickers: &event.stickers,
            context,
            suppress_header,
        });
        let header_shown = segments.header().is_some();
        tracing::debug!(
            event_id = %event.dedup_key,
            author = %author,
            header = header_shown,
            "Rendered"
        );

        // ── DISPATCHED ──
        let mut sent = 0usize;
        let mut last = None;
        let mut segments = segments.peekable();
        while let Some(segment) = segments.next() {
            let files: &[StagedFile] = if segments.peek().is_none() {
                &staged
            } else {
                &[]
            };
            match self.destination.send(&target, &segment, files).await {
                Ok(message) => {
                    sent += 1;
                    last = Some(message);
                }
                Err(error) => {
                    return Err(RelayError::DestinationSend { sent, error });
                }
            }
        }
        drop(staging);

        let Some(last) = last else {
            return Err(RelayError::DestinationSend {
                sent,
                error: anyhow::anyhow!("no segments were rendered"),
            });
        };
        tracing::info!(
            event_id = %event.dedup_key,
            destination = %target.channel_id(),
            segments = sent,
            files = staged.len(),
            "Dispatched"
        );

        // ── PERSISTED ──
        let source_key = MessageKey::new(src, &event.message_id);
        let destination_key = MessageKey::new(self.destination.platform(), &last.id);
        let identity = MessageIdentity::new(source_key.clone(), destination_key.clone());
        if let Err(error) = self.identities.put(&identity) {
            return Err(RelayError::IdentityInconsistency {
                source_key,
                destination: destination_key,
                error,
            });
        }
        tracing::info!(
            source = %source_key,
            destination = %destination_key,
            "Relayed"
        );

        Ok(RelayOutcome::Relayed(RelayReceipt {
            source: source_key,
            destination: destination_key,
            target,
            segments: sent,
            files: staged.len(),
            header_shown,
        }))
    }

    /// Mirror of a source thread root, polling while a concurrent relay persists it
    async fn resolve_parent(&self, src: Platform, root: &str) -> Option<MessageKey> {
        let root_key = MessageKey::new(src, root);
        let identities = Arc::clone(&self.identities);
        let result = poll(self.parent_poll, Some(&self.cancel), || {
            let identities = Arc::clone(&identities);
            let key = root_key.clone();
            async move { identities.counterpart(&key) }
        })
        .await;

        metrics::record_parent_poll(result.attempts());
        match result {
            PollResult::Found { value, attempts } => {
                tracing::debug!(root = %root_key, parent = %value, attempts, "Parent resolved");
                Some(value)
            }
            PollResult::Exhausted { attempts } => {
                tracing::warn!(root = %root_key, attempts, "Parent lookup exhausted");
                None
            }
            PollResult::Cancelled { attempts } => {
                tracing::warn!(root = %root_key, attempts, "Parent lookup cancelled");
                None
            }
        }
    }

    /// Destination thread hanging off `parent_id`, opened if needed.
    ///
    /// Falls back to the channel top level when the parent cannot be read or
    /// a thread cannot be opened.
    async fn thread_target(&self, channel_id: &str, parent_id: &str) -> SendTarget {
        let top_level = SendTarget::Channel {
            channel_id: channel_id.to_string(),
        };

        let parent = match self.destination.fetch_message(channel_id, parent_id).await {
            Ok(Some(parent)) => parent,
            Ok(None) => {
                tracing::warn!(parent = %parent_id, "Parent mirror no longer exists, posting top-level");
                return top_level;
            }
            Err(e) => {
                tracing::warn!(parent = %parent_id, error = %e, "Failed to fetch parent mirror, posting top-level");
                return top_level;
            }
        };

        if let Some(thread_id) = parent.thread_id {
            return SendTarget::Thread {
                channel_id: channel_id.to_string(),
                thread_id,
            };
        }

        let name = thread_name(&parent.text);
        match self.destination.create_thread(channel_id, parent_id, &name).await {
            Ok(thread_id) => {
                tracing::info!(parent = %parent_id, thread = %thread_id, name = %name, "Opened destination thread");
                SendTarget::Thread {
                    channel_id: channel_id.to_string(),
                    thread_id,
                }
            }
            Err(e) => {
                tracing::warn!(parent = %parent_id, error = %e, "Failed to open thread, posting top-level");
                metrics::record_error("create_thread");
                top_level
            }
        }
    }

    async fn lookup_channel_name(&self, channel_id: &str) -> Option<String> {
        match self.source.channel_name(channel_id).await {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(channel = %channel_id, error = %e, "Channel name lookup failed");
                None
            }
        }
    }

    async fn author_name(&self, event: &InboundEvent) -> String {
        if let Some(name) = &event.author.display_name {
            return name.clone();
        }
        match self.directory.resolve_user_display_name(&event.author.id).await {
            Ok(name) => name,
            Err(e) => {
                tracing::debug!(user = %event.author.id, error = %e, "Author lookup failed, using id");
                event.author.id.clone()
            }
        }
    }

    async fn mention_names(&self, event: &InboundEvent) -> HashMap<String, String> {
        let mut names = HashMap::new();
        for mention in &event.mentions {
            if let Some(name) = &mention.display_name {
                names.insert(mention.user_id.clone(), name.clone());
            }
        }
        for user_id in mention_ids(&event.text) {
            if names.contains_key(&user_id) {
                continue;
            }
            match self.directory.resolve_user_display_name(&user_id).await {
                Ok(name) => {
                    names.insert(user_id, name);
                }
                Err(e) => {
                    tracing::debug!(user = %user_id, error = %e, "Mention left unresolved");
                }
            }
        }
        names
    }
}

fn file_key(platform: Platform, file_id: &str) -> String {
    format!("{}:{}", platform, file_id)
}
