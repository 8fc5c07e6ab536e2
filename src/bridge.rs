// ABOUTME: Wires Slack and Discord into two directed relay orchestrators and runs the event loop
// ABOUTME: Also drives newcomer greetings and periodic sweeps until shutdown

use anyhow::{Context, Result};
use futures_util::StreamExt;
use slackord_core::{
    config::Config, metrics, paths, BridgeIdentity, ChannelMapping, ChannelRouter, DedupCache,
    DirectoryLookup, EventSource, IdentityStore, InboundEvent, InboundSource, OutboundSender,
    Platform, RelayOrchestrator, RelayOutcome, SenderMergeTracker, SqliteIdentityStore,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::greeting::{self, GreetAction};
use crate::platform::discord::{DiscordPlatform, Newcomer};
use crate::platform::slack::{SlackEventQueue, SlackPlatform};
use crate::webhook::{self, WebhookState};

const SLACK_QUEUE_CAPACITY: usize = 256;
const GREETING_QUEUE_CAPACITY: usize = 32;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// A platform binding usable on both ends of a relay
pub trait ChatPlatform: InboundSource + OutboundSender + DirectoryLookup + 'static {}

impl<T: InboundSource + OutboundSender + DirectoryLookup + 'static> ChatPlatform for T {}

/// The Slack-to-Discord and Discord-to-Slack orchestrators, sharing one
/// identity store, one set of dedup caches and one sender tracker.
pub struct RelayPair {
    slack_to_discord: RelayOrchestrator,
    discord_to_slack: RelayOrchestrator,
    senders: Arc<SenderMergeTracker>,
}

impl RelayPair {
    pub fn new<S: ChatPlatform, D: ChatPlatform>(
        config: &Config,
        slack: Arc<S>,
        discord: Arc<D>,
        identities: Arc<dyn IdentityStore>,
        bots: (String, String),
        mappings: &[ChannelMapping],
        cancel: CancellationToken,
    ) -> Self {
        let (slack_bot, discord_bot) = bots;
        let relay = &config.relay;
        let events = Arc::new(DedupCache::for_events(relay.dedup_retention()));
        let files = Arc::new(DedupCache::for_files(relay.dedup_retention()));
        let senders = Arc::new(SenderMergeTracker::default());
        let staging_root = paths::staging_dir(&config.storage.data_dir());

        let slack_to_discord = RelayOrchestrator::new(
            slack.clone(),
            discord.clone(),
            slack.clone(),
            identities.clone(),
            ChannelRouter::slack_to_discord(mappings, config.bridge.discord_fallback_channel.clone()),
            BridgeIdentity::new(slack_bot.clone(), discord_bot.clone()),
        );
        let discord_to_slack = RelayOrchestrator::new(
            discord.clone(),
            slack,
            discord,
            identities,
            ChannelRouter::discord_to_slack(mappings, config.bridge.slack_fallback_channel.clone()),
            BridgeIdentity::new(discord_bot, slack_bot),
        );

        let configure = |orchestrator: RelayOrchestrator| {
            orchestrator
                .with_dedup(events.clone(), files.clone())
                .with_sender_tracker(senders.clone())
                .with_parent_poll(relay.parent_poll())
                .with_orphan_policy(relay.orphan_reply_policy)
                .with_staging_root(staging_root.clone())
                .with_max_message_len(relay.max_message_len)
                .with_cancellation(cancel.clone())
        };

        let slack_to_discord = configure(slack_to_discord);
        let discord_to_slack = configure(discord_to_slack);
        Self {
            slack_to_discord,
            discord_to_slack,
            senders,
        }
    }

    /// Relay an event in the direction its platform implies
    pub async fn handle(&self, event: InboundEvent) -> Option<RelayOutcome> {
        let orchestrator = match event.platform {
            Platform::Slack => &self.slack_to_discord,
            Platform::Discord => &self.discord_to_slack,
        };
        // Failures are logged and counted by the orchestrator
        orchestrator.handle(event).await.ok()
    }

    pub fn senders(&self) -> &Arc<SenderMergeTracker> {
        &self.senders
    }
}

/// One FIFO worker per source channel.
///
/// Events from the same `(platform, channel)` are relayed one at a time in
/// the order they were dispatched; different channels relay concurrently.
pub struct ChannelLanes {
    relays: Arc<RelayPair>,
    lanes: HashMap<(Platform, String), mpsc::UnboundedSender<InboundEvent>>,
    workers: JoinSet<()>,
}

impl ChannelLanes {
    pub fn new(relays: Arc<RelayPair>) -> Self {
        Self {
            relays,
            lanes: HashMap::new(),
            workers: JoinSet::new(),
        }
    }

    /// Queue `event` behind earlier events from its channel
    pub fn dispatch(&mut self, event: InboundEvent) {
        let key = (event.platform, event.channel_id.clone());
        let event = match self.lanes.get(&key) {
            Some(lane) => match lane.send(event) {
                Ok(()) => return,
                // Worker is gone; start a new one with this event
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        tracing::debug!(platform = %key.0, channel = %key.1, "Opening relay lane");
        let (tx, rx) = mpsc::unbounded_channel();
        self.workers.spawn(Self::drain(Arc::clone(&self.relays), event, rx));
        self.lanes.insert(key, tx);
    }

    async fn drain(
        relays: Arc<RelayPair>,
        first: InboundEvent,
        mut rx: mpsc::UnboundedReceiver<InboundEvent>,
    ) {
        relays.handle(first).await;
        while let Some(event) = rx.recv().await {
            relays.handle(event).await;
        }
    }

    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    /// Stop accepting events and wait for every queued event to finish
    pub async fn close(mut self) {
        self.lanes.clear();
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "Relay lane task failed");
            }
        }
    }
}

pub struct Bridge {
    config: Arc<Config>,
    http: reqwest::Client,
    slack: Arc<SlackPlatform>,
    discord: Arc<DiscordPlatform>,
    relays: Arc<RelayPair>,
    cancel: CancellationToken,
}

impl Bridge {
    /// Authenticate both bots and build the relay pair
    pub async fn connect(config: Config, cancel: CancellationToken) -> Result<Self> {
        let data_dir = config.storage.data_dir();
        let identities: Arc<dyn IdentityStore> = Arc::new(
            SqliteIdentityStore::new(&data_dir).context("Failed to open identity store")?,
        );

        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        let slack = Arc::new(
            SlackPlatform::connect(
                &config.slack,
                http.clone(),
                config.relay.max_message_len,
                config.relay.file_share_poll(),
                cancel.clone(),
            )
            .await?,
        );
        let discord = Arc::new(
            DiscordPlatform::connect(
                &config.discord,
                http.clone(),
                config.relay.max_message_len,
                cancel.clone(),
            )
            .await?,
        );

        let mappings = config.channel_mappings()?;
        tracing::info!(
            mappings = mappings.len(),
            slack_fallback = ?config.bridge.slack_fallback_channel,
            discord_fallback = ?config.bridge.discord_fallback_channel,
            "Channel routing loaded"
        );

        let relays = Arc::new(RelayPair::new(
            &config,
            slack.clone(),
            discord.clone(),
            identities,
            (
                slack.bot_user_id().to_string(),
                discord.bot_user_id().to_string(),
            ),
            &mappings,
            cancel.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            http,
            slack,
            discord,
            relays,
            cancel,
        })
    }

    /// Serve the webhook and relay events until cancelled
    pub async fn run(self) -> Result<()> {
        let metrics_handle =
            metrics::init_metrics().context("Failed to initialize Prometheus metrics")?;

        let (events_tx, slack_queue) = SlackEventQueue::channel(SLACK_QUEUE_CAPACITY);
        let (greet_tx, mut greet_rx) = mpsc::channel::<GreetAction>(GREETING_QUEUE_CAPACITY);
        let state = WebhookState {
            events: events_tx,
            greetings: greet_tx,
            signing_secret: Arc::new(self.config.slack.signing_secret.clone()),
            bridge_user_id: self.slack.bot_user_id().to_string(),
        };

        let webhook_config = self.config.webhook.clone();
        let webhook_cancel = self.cancel.clone();
        let server = tokio::spawn(async move {
            if let Err(e) =
                webhook::start_webhook_server(&webhook_config, state, metrics_handle, webhook_cancel.clone())
                    .await
            {
                tracing::error!(error = %e, "Webhook server stopped");
                webhook_cancel.cancel();
            }
        });

        // Subscribe before the gateway starts so early joins are seen
        let mut newcomers = self.discord.subscribe_newcomers();
        let mut slack_events = slack_queue.event_stream().await?;
        let mut discord_events = self.discord.event_stream().await?;

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.tick().await;

        let mut lanes = ChannelLanes::new(Arc::clone(&self.relays));

        tracing::info!("Bridge running");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                Some(event) = slack_events.next() => lanes.dispatch(event),
                event = discord_events.next() => match event {
                    Some(event) => lanes.dispatch(event),
                    None => {
                        tracing::warn!("Discord event stream ended");
                        break;
                    }
                },
                joined = newcomers.recv() => match joined {
                    Ok(newcomer) => self.spawn_announcement(newcomer),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Newcomer feed lagged, greetings skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::warn!("Newcomer feed closed");
                        break;
                    }
                },
                Some(action) = greet_rx.recv() => self.spawn_wave(action),
                _ = sweep.tick() => {
                    let removed = self.relays.senders().sweep();
                    if removed > 0 {
                        tracing::debug!(removed, "Swept expired last-sender entries");
                    }
                }
            }
        }

        self.cancel.cancel();
        let open = lanes.len();
        if tokio::time::timeout(SHUTDOWN_GRACE, lanes.close()).await.is_err() {
            tracing::warn!(lanes = open, "In-flight relays did not finish before shutdown");
        }
        if let Err(e) = server.await {
            tracing::warn!(error = %e, "Webhook task join failed");
        }
        tracing::info!("Bridge stopped");
        Ok(())
    }

    fn spawn_announcement(&self, newcomer: Newcomer) {
        let Some(channel) = self.config.bridge.greeting_channel().map(str::to_string) else {
            tracing::debug!(user = %newcomer.user_id, "No greeting channel configured");
            return;
        };
        let slack = Arc::clone(&self.slack);
        tokio::spawn(async move {
            if let Err(e) = greeting::announce_newcomer(&slack, &channel, &newcomer).await {
                metrics::record_error("greeting");
                tracing::warn!(user = %newcomer.user_id, error = %e, "Failed to announce newcomer");
            }
        });
    }

    fn spawn_wave(&self, action: GreetAction) {
        let Some(webhook_url) = self.config.discord.newbies_webhook_url.clone() else {
            tracing::warn!("Wave clicked but no Discord newcomer webhook is configured");
            return;
        };
        let slack = Arc::clone(&self.slack);
        let http = self.http.clone();
        tokio::spawn(async move {
            if let Err(e) = greeting::wave(&slack, &http, &webhook_url, &action).await {
                metrics::record_error("wave");
                tracing::warn!(
                    slack_user = %action.slack_user_id,
                    discord_user = %action.discord_user_id,
                    error = %e,
                    "Failed to deliver wave"
                );
            }
        });
    }
}
