// ABOUTME: Root library module for the Slack/Discord bridge
// ABOUTME: Exposes the platform bindings, webhook front door, greetings and bridge wiring

pub mod bridge;
pub mod greeting;
pub mod platform;
pub mod webhook;

// Re-export the platform-agnostic modules from slackord-core
pub use slackord_core::config;
pub use slackord_core::metrics;
pub use slackord_core::orchestrator;
pub use slackord_core::paths;
pub use slackord_core::traits;

pub use bridge::{Bridge, ChannelLanes, RelayPair};
