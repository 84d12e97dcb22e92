//! Push-notification channel lifecycle for watched folders.
//!
//! Each watched folder has at most one [`WatchChannel`]. Its state relative
//! to the current configuration is one of:
//!
//! ```text
//!   Absent ──subscribe──► Active ──(URL changed | expiry within margin)──► Stale
//!                            ▲                                              │
//!                            └──────────── renew (new id, new expiry) ◄─────┘
//! ```
//!
//! A notification whose channel id is not in the active table is orphaned:
//! the manager asks the provider to stop it and does nothing else.
//!
//! The active table is shared between the webhook handler and the renewal
//! ticker, so it lives behind a mutex. Renewal passes are serialised by a
//! second, async mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::WatchChannel;
use crate::store::WatchChannelStore;

type HmacSha256 = Hmac<Sha256>;

/// Subscription request sent to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub channel_id: String,
    pub folder_id: String,
    pub webhook_url: String,
    pub expires_at: DateTime<Utc>,
    /// Opaque token echoed back on every notification.
    pub token: Option<String>,
}

/// The notification provider's subscription API.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Subscribes a channel; returns the provider's resource id if it gave one.
    async fn watch(&self, req: &ChannelRequest) -> Result<Option<String>>;

    async fn stop(&self, channel_id: &str, resource_id: Option<&str>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Absent,
    Active,
    Stale,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ChannelState::Absent => "absent",
            ChannelState::Active => "active",
            ChannelState::Stale => "stale",
        })
    }
}

/// Classifies a folder's channel against the configured webhook URL.
pub fn channel_state(
    channel: Option<&WatchChannel>,
    webhook_url: &str,
    now: DateTime<Utc>,
    margin: chrono::Duration,
) -> ChannelState {
    match channel {
        None => ChannelState::Absent,
        Some(c) if c.webhook_url != webhook_url || now >= c.expires_at - margin => {
            ChannelState::Stale
        }
        Some(_) => ChannelState::Active,
    }
}

/// Headers of one inbound push notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Notification {
    pub channel_id: String,
    pub resource_id: Option<String>,
    pub resource_state: String,
    pub token: Option<String>,
}

/// What the webhook should do with a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationAction {
    /// Channel token did not verify.
    Rejected,
    /// Unknown channel; a stop request has been issued.
    Orphaned,
    /// Metadata-only `sync` event.
    Ignored,
    /// Run a discovery query.
    Discover,
}

pub struct WatchChannelManager {
    provider: Arc<dyn ChannelProvider>,
    store: Arc<dyn WatchChannelStore>,
    folders: Vec<String>,
    webhook_url: String,
    webhook_path: String,
    secret: Option<String>,
    ttl: chrono::Duration,
    margin: chrono::Duration,
    /// Active channels keyed by folder id.
    channels: Mutex<HashMap<String, WatchChannel>>,
    renewal: tokio::sync::Mutex<()>,
}

impl WatchChannelManager {
    /// Fails if `webhook_url` is not an absolute URL.
    pub fn new(
        provider: Arc<dyn ChannelProvider>,
        store: Arc<dyn WatchChannelStore>,
        folders: Vec<String>,
        webhook_url: &str,
        secret: Option<String>,
        ttl: Duration,
        margin: Duration,
    ) -> Result<Self> {
        let parsed = reqwest::Url::parse(webhook_url)
            .with_context(|| format!("Invalid GOOGLE_WEBHOOK_URL: '{}'", webhook_url))?;
        if parsed.cannot_be_a_base() {
            return Err(anyhow!("Invalid GOOGLE_WEBHOOK_URL: '{}'", webhook_url));
        }

        Ok(Self {
            provider,
            store,
            folders,
            webhook_url: webhook_url.to_string(),
            webhook_path: parsed.path().to_string(),
            secret,
            ttl: chrono::Duration::from_std(ttl).context("channel ttl out of range")?,
            margin: chrono::Duration::from_std(margin).context("expiry margin out of range")?,
            channels: Mutex::new(HashMap::new()),
            renewal: tokio::sync::Mutex::new(()),
        })
    }

    pub fn folders(&self) -> &[String] {
        &self.folders
    }

    /// Path component of the webhook URL; the route notifications arrive on.
    pub fn webhook_path(&self) -> &str {
        &self.webhook_path
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, WatchChannel>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_active(&self, channel_id: &str) -> bool {
        self.table().values().any(|c| c.channel_id == channel_id)
    }

    pub fn active_channels(&self) -> Vec<WatchChannel> {
        let mut all: Vec<_> = self.table().values().cloned().collect();
        all.sort_by(|a, b| a.folder_id.cmp(&b.folder_id));
        all
    }

    pub fn state_of(&self, folder_id: &str, now: DateTime<Utc>) -> ChannelState {
        channel_state(
            self.table().get(folder_id),
            &self.webhook_url,
            now,
            self.margin,
        )
    }

    /// Token registered with a channel: hex HMAC-SHA256 of its id.
    fn token_for(&self, channel_id: &str) -> Option<String> {
        let secret = self.secret.as_ref()?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
        mac.update(channel_id.as_bytes());
        Some(hex::encode(mac.finalize().into_bytes()))
    }

    fn verify_token(&self, channel_id: &str, token: Option<&str>) -> bool {
        let Some(secret) = &self.secret else {
            return true;
        };
        let Some(signature) = token.and_then(|t| hex::decode(t).ok()) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(channel_id.as_bytes());
        mac.verify_slice(&signature).is_ok()
    }

    /// Re-subscribes every folder whose channel is absent or stale.
    ///
    /// Per-folder failures are logged and left for the next pass. Returns
    /// the number of channels created.
    pub async fn renew(&self) -> usize {
        let _pass = self.renewal.lock().await;
        let now = Utc::now();
        let mut renewed = 0;

        for folder in &self.folders {
            match self.ensure_channel(folder, now).await {
                Ok(true) => renewed += 1,
                Ok(false) => {}
                Err(e) => warn!(folder_id = %folder, "watch channel renewal failed: {:#}", e),
            }
        }
        renewed
    }

    async fn ensure_channel(&self, folder: &str, now: DateTime<Utc>) -> Result<bool> {
        let cached = self.table().get(folder).cloned();
        let current = match cached {
            Some(c) => Some(c),
            None => self.store.get_watch_channel(folder).await?,
        };

        let state = channel_state(current.as_ref(), &self.webhook_url, now, self.margin);
        if state == ChannelState::Active {
            if let Some(c) = current {
                self.table().insert(folder.to_string(), c);
            }
            return Ok(false);
        }

        let channel_id = Uuid::new_v4().to_string();
        let request = ChannelRequest {
            token: self.token_for(&channel_id),
            channel_id,
            folder_id: folder.to_string(),
            webhook_url: self.webhook_url.clone(),
            expires_at: now + self.ttl,
        };
        let resource_id = self
            .provider
            .watch(&request)
            .await
            .context("provider rejected watch request")?;

        let channel = WatchChannel {
            folder_id: request.folder_id,
            channel_id: request.channel_id,
            resource_id,
            expires_at: request.expires_at,
            webhook_url: request.webhook_url,
        };
        let channel = match self.store.upsert_watch_channel(&channel).await {
            Ok(stored) => stored,
            Err(e) => {
                if let Err(stop_err) = self
                    .provider
                    .stop(&channel.channel_id, channel.resource_id.as_deref())
                    .await
                {
                    warn!(
                        channel_id = %channel.channel_id,
                        "failed to stop unrecorded channel: {:#}", stop_err
                    );
                }
                return Err(e.context("failed to record watch channel"));
            }
        };
        self.table().insert(folder.to_string(), channel.clone());
        info!(
            folder_id = %folder,
            channel_id = %channel.channel_id,
            expires_at = %channel.expires_at,
            previous = %state,
            "watch channel subscribed"
        );

        if let Some(old) = current {
            if let Err(e) = self
                .provider
                .stop(&old.channel_id, old.resource_id.as_deref())
                .await
            {
                debug!(channel_id = %old.channel_id, "stopping replaced channel failed: {:#}", e);
            }
        }
        Ok(true)
    }

    /// Decides what to do with an inbound notification.
    ///
    /// Orphaned channels are stopped here; nothing else has side effects.
    pub async fn handle_notification(&self, n: &Notification) -> NotificationAction {
        if !self.verify_token(&n.channel_id, n.token.as_deref()) {
            warn!(channel_id = %n.channel_id, "notification token mismatch");
            return NotificationAction::Rejected;
        }

        if !self.is_active(&n.channel_id) {
            warn!(channel_id = %n.channel_id, "notification for unknown channel, stopping it");
            if let Err(e) = self
                .provider
                .stop(&n.channel_id, n.resource_id.as_deref())
                .await
            {
                warn!(channel_id = %n.channel_id, "failed to stop orphaned channel: {:#}", e);
            }
            return NotificationAction::Orphaned;
        }

        if n.resource_state == "sync" {
            debug!(channel_id = %n.channel_id, "sync notification ignored");
            return NotificationAction::Ignored;
        }

        NotificationAction::Discover
    }
}
