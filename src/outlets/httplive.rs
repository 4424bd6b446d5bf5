//! HTTP live streams: one logical stream with several quality variants.
//!
//! ```text
//! feed ─▶ HttpLiveStream ─┬─▶ Transcoder ─▶ SegmentWriter   (encoded quality)
//!                         └─▶ SegmentWriter                 (passthrough quality)
//! ```
//!
//! The stream stage itself only forwards bytes. It owns the stream
//! directory, the index shared by every variant and the master playlist.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use knive_av::arguments::quality_options;
use knive_av::{ProcessSpec, FFMPEG, SEGMENTER};
use knive_core::config::{ChannelConfig, HttpLiveConfig};
use knive_core::Result;
use knive_media::{generate_master_playlist, write_atomic, MasterPlaylist, SharedIndex, Variant};
use knive_pipeline::{PipelineGraph, Stage, StageContext, StageId, StageKind};

use super::segment_writer::{SegmentWriter, VariantSettings};
use super::transcoder::Transcoder;
use crate::context::KniveContext;

pub struct HttpLiveStream {
    name: String,
    dir: PathBuf,
    master_name: String,
    master: MasterPlaylist,
    index: SharedIndex,
}

impl HttpLiveStream {
    pub fn new(name: impl Into<String>, dir: PathBuf, config: &HttpLiveConfig, index: SharedIndex) -> Self {
        let variants = config
            .qualities
            .iter()
            .map(|(quality, q)| Variant {
                bandwidth: q.bandwidth.unwrap_or_default(),
                codecs: q.codecstring.clone().unwrap_or_default(),
                uri: format!("{quality}/{}", config.playlist_name),
            })
            .collect();
        Self {
            name: name.into(),
            dir,
            master_name: format!("{}.m3u8", config.name),
            master: MasterPlaylist { variants },
            index,
        }
    }

    pub fn master_path(&self) -> PathBuf {
        self.dir.join(&self.master_name)
    }
}

#[async_trait]
impl Stage for HttpLiveStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn role(&self) -> &'static str {
        "httplive"
    }

    async fn will_start(&mut self, _ctx: &StageContext) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        write_atomic(&self.master_path(), generate_master_playlist(&self.master)).await?;
        tracing::info!(
            "Stream '{}' publishing {} variants from segment {}",
            self.name,
            self.master.variants.len(),
            self.index.get() + 1
        );
        Ok(())
    }

    async fn did_stop(&mut self, _ctx: &StageContext) -> Result<()> {
        self.index.persist().await
    }
}

/// What a channel keeps about a stream it built.
#[derive(Debug, Clone)]
pub struct HttpLiveHandle {
    pub stage: StageId,
    pub name: String,
    pub dir: PathBuf,
    pub index: SharedIndex,
    pub qualities: Vec<String>,
    pub playlist_name: String,
}

/// Wire an HTTP live stream and all of its variants below `parent`.
pub async fn build(
    graph: &PipelineGraph,
    parent: StageId,
    channel: &ChannelConfig,
    config: &HttpLiveConfig,
    knive: &KniveContext,
) -> Result<HttpLiveHandle> {
    let dir = knive
        .config
        .paths
        .data_dir
        .join(&channel.slug)
        .join("live")
        .join(&config.name);
    tokio::fs::create_dir_all(&dir).await?;
    let index = SharedIndex::load(&dir).await?;

    let prefix = format!("{}/{}", channel.slug, config.name);
    let stream = graph.add_stage(HttpLiveStream::new(prefix.clone(), dir.clone(), config, index.clone()));
    graph.add_consumer(parent, stream)?;

    let stop_timeout = Duration::from_secs(knive.config.tools.stop_timeout_secs);
    for (quality, quality_config) in &config.qualities {
        let settings = VariantSettings {
            stream: config.name.clone(),
            quality: quality.clone(),
            label: format!("{}-{}", channel.slug, quality),
            segment_duration: config.segment_duration,
            max_segments: config.max_segments,
            playlist_name: config.playlist_name.clone(),
            publish_url: config
                .publish_url
                .as_ref()
                .map(|url| format!("{}/{}", url.trim_end_matches('/'), quality)),
            allow_cache: config.allow_cache,
            dest_dir: dir.join(quality),
            scratch_root: knive.config.paths.scratch_dir.clone(),
            restart_on_crash: config.restart_on_crash,
            stop_timeout,
        };
        let segmenter = ProcessSpec::new(knive.tools.require(SEGMENTER)?.path.clone());
        let writer = graph.add_stage(
            SegmentWriter::new(format!("{prefix}/{quality}/segmenter"), segmenter, settings, index.clone())
                .with_events(knive.events.clone()),
        );

        let options = quality_options(quality_config);
        if options.is_empty() {
            tracing::debug!("Quality '{}/{}' passes the feed through", prefix, quality);
            graph.add_consumer(stream, writer)?;
        } else {
            let ffmpeg = knive.tools.require(FFMPEG)?.path.clone();
            let transcoder = graph.add_stage(
                Transcoder::ffmpeg(format!("{prefix}/{quality}/transcoder"), ffmpeg, &options)
                    .with_stop_timeout(stop_timeout)
                    .restart_on_crash(config.restart_on_crash),
            );
            graph.add_consumer(stream, transcoder)?;
            graph.add_consumer(transcoder, writer)?;
        }
    }

    Ok(HttpLiveHandle {
        stage: stream,
        name: config.name.clone(),
        dir,
        index,
        qualities: config.qualities.keys().cloned().collect(),
        playlist_name: config.playlist_name.clone(),
    })
}
