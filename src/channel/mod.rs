//! Channels: a feed, the outlets below it, and the episodes recorded from it.

pub mod episode;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use knive_core::config::ChannelConfig;
use knive_core::events::{EventBus, PipelineEvent};
use knive_core::{Error, LifecycleError, Result};
use knive_pipeline::{PipelineGraph, RecordingTarget, StageId, StageInfo};

use crate::context::KniveContext;
use crate::feed::{BoundAddress, FeedListener};
use crate::outlets::{self, Outlet};

pub use episode::Episode;

#[derive(Debug, Default)]
struct Episodes {
    all: BTreeMap<String, Episode>,
    current: Option<String>,
}

/// Serializable view of a channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub name: String,
    pub slug: String,
    pub url: String,
    pub running: bool,
    pub feed_address: Option<String>,
    /// Id of the open episode, if any.
    pub recording: Option<String>,
    pub episodes: BTreeMap<String, Episode>,
    /// Last published segment index per HTTP live stream.
    pub streams: BTreeMap<String, u64>,
    pub stages: Vec<StageInfo>,
}

pub struct Channel {
    config: ChannelConfig,
    dir: PathBuf,
    graph: Arc<PipelineGraph>,
    feed: StageId,
    feed_address: BoundAddress,
    outlets: Vec<Outlet>,
    events: Arc<EventBus>,
    episodes: Mutex<Episodes>,
}

impl Channel {
    /// Build the channel's pipeline. Nothing is started yet.
    pub async fn from_config(config: &ChannelConfig, knive: &KniveContext) -> Result<Arc<Self>> {
        let dir = knive.config.paths.data_dir.join(&config.slug);
        tokio::fs::create_dir_all(&dir).await?;

        let graph = PipelineGraph::with_events(knive.events.clone());
        let listener = FeedListener::new(format!("{}/feed", config.slug), config.feed.clone())
            .with_events(knive.events.clone());
        let feed_address = listener.address();
        let feed = graph.add_stage(listener);

        let mut built = Vec::with_capacity(config.outlets.len());
        for outlet in &config.outlets {
            built.push(outlets::build(&graph, feed, config, outlet, knive).await?);
        }
        tracing::info!(
            "Channel '{}' built with {} outlets ({} stages)",
            config.slug,
            built.len(),
            graph.snapshot().len()
        );

        Ok(Arc::new(Self {
            config: config.clone(),
            dir,
            graph,
            feed,
            feed_address,
            outlets: built,
            events: knive.events.clone(),
            episodes: Mutex::default(),
        }))
    }

    pub fn slug(&self) -> &str {
        &self.config.slug
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn graph(&self) -> &Arc<PipelineGraph> {
        &self.graph
    }

    pub fn feed(&self) -> StageId {
        self.feed
    }

    /// Where the feed listener accepts encoders, once started.
    pub fn feed_address(&self) -> Option<std::net::SocketAddr> {
        self.feed_address.get()
    }

    /// Start the feed and, through it, every outlet.
    ///
    /// Outlets that did come up are stopped again when the start fails.
    pub async fn start(&self) -> Result<()> {
        let Err(e) = self.graph.start(self.feed).await else {
            return Ok(());
        };
        tracing::warn!("Channel '{}' failed to start; stopping its outlets", self.slug());
        if let Err(stop) = self.graph.stop_tree(self.feed).await {
            tracing::error!("Channel '{}' left stages running: {}", self.slug(), stop);
        }
        Err(e)
    }

    pub async fn stop(&self) -> Result<()> {
        self.graph.stop_tree(self.feed).await
    }

    pub fn is_running(&self) -> bool {
        self.graph.is_running(self.feed)
    }

    pub async fn is_recording(&self) -> bool {
        self.episodes.lock().await.current.is_some()
    }

    /// Open a new episode and start every recorder below the feed.
    pub async fn start_episode(&self) -> Result<Episode> {
        let mut episodes = self.episodes.lock().await;
        if episodes.current.is_some() {
            return Err(LifecycleError::AlreadyRecording {
                channel: self.config.slug.clone(),
            }
            .into());
        }

        let episode = Episode::open(&self.dir, Utc::now(), |id| {
            episodes.all.contains_key(id) || self.dir.join(id).exists()
        });
        tokio::fs::create_dir_all(&episode.directory).await?;
        if let Some(playlist) = self.first_recorded_playlist() {
            tokio::fs::write(episode.directory.join("index.html"), episode::player_page(&playlist)).await?;
        }

        let target = RecordingTarget {
            episode: episode.id.clone(),
            directory: episode.directory.clone(),
            started_at: episode.started_at,
        };
        let mut started = Vec::new();
        for id in self.graph.descendants(self.feed) {
            let Some(handle) = self.graph.stage(id) else {
                continue;
            };
            let mut stage = handle.lock().await;
            let Some(recorder) = stage.as_recorder() else {
                continue;
            };
            if let Err(e) = recorder.start_recording(&target).await {
                drop(stage);
                tracing::error!("Channel '{}': recorder {} failed to start: {}", self.config.slug, id, e);
                self.stop_recorders(&started).await;
                return Err(e);
            }
            started.push(id);
        }

        self.link_latest(&episode.id).await;
        tracing::info!(
            "Channel '{}' recording episode {} with {} recorders",
            self.config.slug,
            episode.id,
            started.len()
        );
        episodes.current = Some(episode.id.clone());
        episodes.all.insert(episode.id.clone(), episode.clone());
        drop(episodes);

        self.events.publish(PipelineEvent::RecordingStarted {
            channel: self.config.slug.clone(),
            episode: episode.id.clone(),
        });
        Ok(episode)
    }

    /// [`start_episode`](Self::start_episode), stopping the episode again
    /// after `duration` unless it was stopped already.
    pub async fn start_episode_for(self: &Arc<Self>, duration: Duration) -> Result<Episode> {
        let episode = self.start_episode().await?;
        let channel = Arc::downgrade(self);
        let id = episode.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let Some(channel) = channel.upgrade() else {
                return;
            };
            if channel.episodes.lock().await.current.as_deref() != Some(id.as_str()) {
                return;
            }
            tracing::info!("Channel '{}': episode {} reached its duration", channel.slug(), id);
            if let Err(e) = channel.stop_episode().await {
                tracing::warn!("Channel '{}': automatic stop failed: {}", channel.slug(), e);
            }
        });
        Ok(episode)
    }

    /// Close the open episode.
    pub async fn stop_episode(&self) -> Result<Episode> {
        let mut episodes = self.episodes.lock().await;
        let Some(id) = episodes.current.take() else {
            return Err(LifecycleError::NotRecording {
                channel: self.config.slug.clone(),
            }
            .into());
        };

        let recorders = self.graph.descendants(self.feed);
        self.stop_recorders(&recorders).await;

        let episode = episodes
            .all
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("episode", &id))?;
        episode.close(Utc::now());
        let episode = episode.clone();
        drop(episodes);

        tracing::info!("Channel '{}' stopped recording episode {}", self.config.slug, id);
        self.events.publish(PipelineEvent::RecordingStopped {
            channel: self.config.slug.clone(),
            episode: id,
        });
        Ok(episode)
    }

    pub async fn episodes(&self) -> BTreeMap<String, Episode> {
        self.episodes.lock().await.all.clone()
    }

    pub async fn status(&self) -> ChannelStatus {
        let episodes = self.episodes.lock().await;
        let streams = self
            .outlets
            .iter()
            .filter_map(|o| match o {
                Outlet::HttpLive(live) => Some((live.name.clone(), live.index.get())),
                _ => None,
            })
            .collect();
        ChannelStatus {
            name: self.config.name.clone(),
            slug: self.config.slug.clone(),
            url: self.config.url.clone(),
            running: self.is_running(),
            feed_address: self.feed_address().map(|a| a.to_string()),
            recording: episodes.current.clone(),
            episodes: episodes.all.clone(),
            streams,
            stages: self.graph.snapshot(),
        }
    }

    async fn stop_recorders(&self, ids: &[StageId]) {
        for &id in ids {
            let Some(handle) = self.graph.stage(id) else {
                continue;
            };
            let mut stage = handle.lock().await;
            let Some(recorder) = stage.as_recorder() else {
                continue;
            };
            if !recorder.is_recording() {
                continue;
            }
            if let Err(e) = recorder.stop_recording().await {
                tracing::warn!("Channel '{}': recorder {} failed to stop: {}", self.config.slug, id, e);
            }
        }
    }

    /// VOD playlist of the first recorded variant, relative to the episode.
    fn first_recorded_playlist(&self) -> Option<String> {
        self.outlets.iter().find_map(|o| match o {
            Outlet::HttpLive(live) => live
                .qualities
                .first()
                .map(|quality| format!("{}/{}/{}", live.name, quality, live.playlist_name)),
            _ => None,
        })
    }

    #[cfg(unix)]
    async fn link_latest(&self, episode_id: &str) {
        let link = self.dir.join("latest");
        if tokio::fs::symlink_metadata(&link).await.is_ok() {
            if let Err(e) = tokio::fs::remove_file(&link).await {
                tracing::warn!("Channel '{}': cannot replace {}: {}", self.config.slug, link.display(), e);
                return;
            }
        }
        if let Err(e) = tokio::fs::symlink(episode_id, &link).await {
            tracing::warn!("Channel '{}': cannot link {}: {}", self.config.slug, link.display(), e);
        }
    }

    #[cfg(not(unix))]
    async fn link_latest(&self, _episode_id: &str) {}
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("slug", &self.config.slug)
            .field("feed", &self.feed)
            .field("outlets", &self.outlets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use knive_core::config::Config;

    async fn archive_channel(data: &Path) -> (Arc<Channel>, KniveContext) {
        archive_channel_on(data, 0).await
    }

    async fn archive_channel_on(data: &Path, port: u16) -> (Arc<Channel>, KniveContext) {
        let mut config: Config = toml::from_str(&format!(
            r#"
            [[channels]]
            name = "Bus"
            slug = "bus"

            [channels.feed]
            host = "127.0.0.1"
            port = {port}
            secret = "abc"

            [[channels.outlets]]
            type = "archive"
            "#
        ))
        .unwrap();
        config.paths.data_dir = data.to_path_buf();
        let knive = KniveContext::with_tools(config.clone(), knive_av::ToolRegistry::default());
        let channel = Channel::from_config(&config.channels[0], &knive).await.unwrap();
        (channel, knive)
    }

    #[tokio::test]
    async fn episode_lifecycle() {
        let data = tempfile::tempdir().unwrap();
        let (channel, knive) = archive_channel(data.path()).await;
        let mut events = knive.events.subscribe();

        assert_matches!(
            channel.stop_episode().await,
            Err(Error::Lifecycle(LifecycleError::NotRecording { .. }))
        );

        let episode = channel.start_episode().await.unwrap();
        assert!(episode.directory.is_dir());
        assert!(channel.is_recording().await);
        assert_matches!(
            channel.start_episode().await,
            Err(Error::Lifecycle(LifecycleError::AlreadyRecording { .. }))
        );
        let event = events.recv().await.unwrap();
        assert_matches!(
            event.payload,
            PipelineEvent::RecordingStarted { episode: ref id, .. } if *id == episode.id
        );

        #[cfg(unix)]
        assert_eq!(
            std::fs::read_link(data.path().join("bus/latest")).unwrap(),
            PathBuf::from(&episode.id)
        );

        let stopped = channel.stop_episode().await.unwrap();
        assert_eq!(stopped.id, episode.id);
        assert!(!stopped.is_open());
        assert!(!channel.is_recording().await);
        assert_eq!(channel.status().await.episodes.len(), 1);
    }

    #[tokio::test]
    async fn timed_episode_stops_itself() {
        let data = tempfile::tempdir().unwrap();
        let (channel, _) = archive_channel(data.path()).await;
        let episode = channel.start_episode_for(Duration::from_millis(50)).await.unwrap();
        crate::testing::wait_until(Duration::from_secs(5), || {
            channel
                .episodes
                .try_lock()
                .is_ok_and(|e| e.current.is_none())
        })
        .await;
        assert!(!channel.episodes().await[&episode.id].is_open());
    }

    #[tokio::test]
    async fn start_binds_the_feed_and_stop_releases_it() {
        let data = tempfile::tempdir().unwrap();
        let (channel, _) = archive_channel(data.path()).await;
        channel.start().await.unwrap();
        assert!(channel.is_running());
        assert!(channel.feed_address().is_some());
        assert!(data.path().join("bus/archive/stream.ts").exists());

        let status = channel.status().await;
        assert_eq!(status.slug, "bus");
        assert_eq!(status.stages.len(), 2);

        channel.stop().await.unwrap();
        assert!(!channel.is_running());
        assert!(channel.feed_address().is_none());
    }

    #[tokio::test]
    async fn failed_start_leaves_no_outlet_running() {
        let data = tempfile::tempdir().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let (channel, _) = archive_channel_on(data.path(), port).await;

        assert!(channel.start().await.is_err());
        assert!(!channel.is_running());
        let status = channel.status().await;
        assert_eq!(status.stages.len(), 2);
        assert!(status
            .stages
            .iter()
            .all(|s| s.status == knive_pipeline::StageStatus::Idle));
    }
}
