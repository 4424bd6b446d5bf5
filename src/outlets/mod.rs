//! Consumers hanging off a channel's feed.

pub mod archive;
pub mod httplive;
mod process;
pub mod segment_writer;
pub mod stdin;
pub mod transcoder;

pub use archive::Archiver;
pub use httplive::{HttpLiveHandle, HttpLiveStream};
pub use segment_writer::{SegmentWriter, VariantSettings};
pub use stdin::StdinSource;
pub use transcoder::Transcoder;

use knive_core::config::{ChannelConfig, OutletConfig};
use knive_core::Result;
use knive_pipeline::{PipelineGraph, StageId};

use crate::context::KniveContext;
use crate::feed::FeedClient;

/// A built outlet.
#[derive(Debug, Clone)]
pub enum Outlet {
    HttpLive(HttpLiveHandle),
    Archive(StageId),
    Relay(StageId),
}

/// Add the stages of `outlet` below `feed`.
pub async fn build(
    graph: &PipelineGraph,
    feed: StageId,
    channel: &ChannelConfig,
    outlet: &OutletConfig,
    knive: &KniveContext,
) -> Result<Outlet> {
    match outlet {
        OutletConfig::HttpLive(config) => {
            httplive::build(graph, feed, channel, config, knive)
                .await
                .map(Outlet::HttpLive)
        }
        OutletConfig::Archive(config) => {
            let dir = config
                .dir
                .clone()
                .unwrap_or_else(|| knive.config.paths.data_dir.join(&channel.slug).join("archive"));
            let id = graph.add_stage(Archiver::new(
                format!("{}/archive", channel.slug),
                dir,
                config.clone(),
            ));
            graph.add_consumer(feed, id)?;
            Ok(Outlet::Archive(id))
        }
        OutletConfig::Relay(config) => {
            let id = graph.add_stage(FeedClient::new(
                format!("{}/relay/{}:{}", channel.slug, config.host, config.port),
                config.clone(),
            ));
            graph.add_consumer(feed, id)?;
            Ok(Outlet::Relay(id))
        }
    }
}
