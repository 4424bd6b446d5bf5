//! The segment writer of one HTTP live variant.
//!
//! The external segmenter cuts the incoming stream into numbered files in a
//! scratch directory and reports each finished file on stderr. The writer
//! renumbers the file above the stream's shared index, moves it into the
//! public directory and rewrites the sliding-window playlist. While an
//! episode is being recorded every segment is also copied into the episode
//! and listed in a VOD playlist there.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use knive_av::{parse_report, segment_file_name, segmenter_args, ManagedProcess, ProcessSpec, SegmentReport};
use knive_core::events::{EventBus, PipelineEvent};
use knive_core::{Error, ProcessFault, Result};
use knive_media::{copy_file, move_file, write_atomic, PlaylistIndex, SharedIndex, VodPlaylist};
use knive_pipeline::{FaultAction, Recorder, RecordingTarget, Stage, StageContext, StageKind};

use super::process::watch_exit;

/// Where and how one variant is published.
#[derive(Debug, Clone)]
pub struct VariantSettings {
    /// Name of the logical stream (e.g. "live").
    pub stream: String,
    /// Name of this variant within the stream (e.g. "wifi").
    pub quality: String,
    /// File prefix handed to the segmenter; also the playlist entry title.
    pub label: String,
    pub segment_duration: u32,
    pub max_segments: usize,
    pub playlist_name: String,
    pub publish_url: Option<String>,
    pub allow_cache: bool,
    /// Public directory of this variant.
    pub dest_dir: PathBuf,
    /// Parent for the private scratch directory; the system temp dir if unset.
    pub scratch_root: Option<PathBuf>,
    pub restart_on_crash: bool,
    pub stop_timeout: Duration,
}

impl VariantSettings {
    pub fn playlist_path(&self) -> PathBuf {
        self.dest_dir.join(&self.playlist_name)
    }
}

struct Recording {
    episode: String,
    dir: PathBuf,
    playlist: VodPlaylist,
}

struct WriterState {
    window: PlaylistIndex,
    recording: Option<Recording>,
}

pub struct SegmentWriter {
    name: String,
    settings: Arc<VariantSettings>,
    segmenter: ProcessSpec,
    index: SharedIndex,
    events: Option<Arc<EventBus>>,
    state: Arc<Mutex<WriterState>>,
    recording: bool,
    process: Option<ManagedProcess>,
    scratch: Option<TempDir>,
    tasks: Vec<JoinHandle<()>>,
    report_task: Option<JoinHandle<()>>,
}

impl SegmentWriter {
    /// `segmenter` is the command to run; the invocation arguments are
    /// appended to it on every start.
    pub fn new(name: impl Into<String>, segmenter: ProcessSpec, settings: VariantSettings, index: SharedIndex) -> Self {
        let window = PlaylistIndex::new(
            settings.label.clone(),
            settings.max_segments,
            settings.segment_duration,
        )
        .with_allow_cache(settings.allow_cache)
        .with_publish_url(settings.publish_url.clone());

        Self {
            name: name.into(),
            settings: Arc::new(settings),
            segmenter,
            index,
            events: None,
            state: Arc::new(Mutex::new(WriterState {
                window,
                recording: None,
            })),
            recording: false,
            process: None,
            scratch: None,
            tasks: Vec::new(),
            report_task: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn settings(&self) -> &VariantSettings {
        &self.settings
    }

    fn make_scratch(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(".knive-segments-");
        let dir = match self.settings.scratch_root {
            Some(ref root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }
}

#[async_trait]
impl Stage for SegmentWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Sink
    }

    fn role(&self) -> &'static str {
        "segmenter"
    }

    async fn will_start(&mut self, ctx: &StageContext) -> Result<()> {
        tokio::fs::create_dir_all(&self.settings.dest_dir).await?;
        let scratch = self.make_scratch()?;

        // A (re)started segmenter counts from 1 again; numbering resumes
        // above whatever the stream has published so far.
        let offset = self.index.get();
        tracing::debug!("Writer '{}' numbering segments from {}", self.name, offset + 1);

        let mut spec = self.segmenter.clone();
        spec.args(segmenter_args(
            self.settings.segment_duration,
            scratch.path(),
            &self.settings.label,
        ));

        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let stage = self.name.clone();
        let process = ManagedProcess::spawn(&spec, move |line| match parse_report(line) {
            Some(report) => {
                let _ = reports_tx.send(report);
            }
            None if line.trim_start().starts_with("segmenter:") => {
                tracing::warn!("Writer '{}': malformed segmenter report {:?}", stage, line);
            }
            None => tracing::trace!("Writer '{}': {}", stage, line),
        })?;

        let publisher = Publisher {
            stage: self.name.clone(),
            settings: self.settings.clone(),
            scratch_dir: scratch.path().to_path_buf(),
            offset,
            index: self.index.clone(),
            state: self.state.clone(),
            events: self.events.clone(),
        };
        self.report_task = Some(tokio::spawn(publisher.run(reports_rx)));
        self.tasks.push(watch_exit(&process, ctx.faults()));
        self.process = Some(process);
        self.scratch = Some(scratch);
        Ok(())
    }

    async fn receive(&mut self, data: Bytes, _ctx: &StageContext) -> Result<()> {
        let Some(process) = self.process.as_mut() else {
            return Err(Error::tool(self.segmenter.tool_name(), "not running"));
        };
        process.write(&data).await
    }

    async fn will_stop(&mut self, _ctx: &StageContext) -> Result<()> {
        if let Some(mut process) = self.process.take() {
            process.stop(self.settings.stop_timeout).await;
        }
        if let Some(task) = self.report_task.take() {
            if tokio::time::timeout(self.settings.stop_timeout, task).await.is_err() {
                tracing::warn!("Writer '{}' gave up on pending segment reports", self.name);
            }
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        if let Some(scratch) = self.scratch.take() {
            if let Err(e) = scratch.close() {
                tracing::debug!("Writer '{}': scratch cleanup failed: {}", self.name, e);
            }
        }
        Ok(())
    }

    fn on_fault(&mut self, _fault: &ProcessFault) -> FaultAction {
        if self.settings.restart_on_crash {
            FaultAction::Restart
        } else {
            FaultAction::Stop
        }
    }

    fn as_recorder(&mut self) -> Option<&mut dyn Recorder> {
        Some(self)
    }
}

#[async_trait]
impl Recorder for SegmentWriter {
    async fn start_recording(&mut self, target: &RecordingTarget) -> Result<()> {
        let dir = target
            .directory
            .join(&self.settings.stream)
            .join(&self.settings.quality);
        tokio::fs::create_dir_all(&dir).await?;

        let mut state = self.state.lock().await;
        if let Some(ref previous) = state.recording {
            tracing::warn!(
                "Writer '{}' was still recording episode {}; switching to {}",
                self.name,
                previous.episode,
                target.episode
            );
        }
        state.recording = Some(Recording {
            episode: target.episode.clone(),
            dir,
            playlist: VodPlaylist::new(self.settings.label.clone(), self.settings.segment_duration),
        });
        self.recording = true;
        tracing::info!("Writer '{}' recording into episode {}", self.name, target.episode);
        Ok(())
    }

    async fn stop_recording(&mut self) -> Result<()> {
        let Some(mut recording) = self.state.lock().await.recording.take() else {
            return Ok(());
        };
        self.recording = false;
        recording.playlist.finish();
        write_atomic(
            &recording.dir.join(&self.settings.playlist_name),
            recording.playlist.render(),
        )
        .await?;
        tracing::info!(
            "Writer '{}' finished episode {}: {} segments, {:.1}s",
            self.name,
            recording.episode,
            recording.playlist.len(),
            recording.playlist.duration()
        );
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.recording
    }
}

/// Handles segmenter reports for one run of the segmenter.
struct Publisher {
    stage: String,
    settings: Arc<VariantSettings>,
    scratch_dir: PathBuf,
    offset: u64,
    index: SharedIndex,
    state: Arc<Mutex<WriterState>>,
    events: Option<Arc<EventBus>>,
}

impl Publisher {
    async fn run(self, mut reports: mpsc::UnboundedReceiver<SegmentReport>) {
        while let Some(report) = reports.recv().await {
            let end_of_stream = report.end_of_stream;
            if let Err(e) = self.publish(report).await {
                tracing::error!("Writer '{}' failed to publish a segment: {}", self.stage, e);
            }
            if end_of_stream {
                tracing::info!("Writer '{}': segmenter reached the end of its input", self.stage);
            }
        }
    }

    async fn publish(&self, report: SegmentReport) -> Result<()> {
        let published = self.offset + report.last_index;
        self.index.report(published);

        let scratch_file = self
            .scratch_dir
            .join(segment_file_name(&report.label, report.last_index));
        let filename = segment_file_name(&report.label, published);
        let public_file = self.settings.dest_dir.join(&filename);
        move_file(&scratch_file, &public_file).await?;

        let mut state = self.state.lock().await;
        let segment = state.window.push(published, filename.clone(), report.duration);
        if segment.discontinuity {
            tracing::info!("Writer '{}': discontinuity before segment {}", self.stage, published);
        }
        write_atomic(&self.settings.playlist_path(), state.window.render()).await?;
        self.index.persist().await?;
        tracing::debug!(
            "Writer '{}' published {} ({:.2}s)",
            self.stage,
            filename,
            report.duration
        );

        if let Some(ref mut recording) = state.recording {
            let playlist_name = &self.settings.playlist_name;
            record_segment(recording, &public_file, &filename, published, report.duration, playlist_name).await?;
        }
        drop(state);

        if let Some(ref bus) = self.events {
            bus.publish(PipelineEvent::SegmentPublished {
                stream: self.settings.stream.clone(),
                quality: self.settings.quality.clone(),
                index: published,
                duration: report.duration,
            });
        }
        Ok(())
    }
}

async fn record_segment(
    recording: &mut Recording,
    public_file: &Path,
    filename: &str,
    index: u64,
    duration: f64,
    playlist_name: &str,
) -> Result<()> {
    copy_file(public_file, &recording.dir.join(filename)).await?;
    recording.playlist.push(index, filename, duration);
    write_atomic(&recording.dir.join(playlist_name), recording.playlist.render()).await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use chrono::Utc;
    use knive_pipeline::{PipelineGraph, StageId};

    use crate::testing::{fake_tool, pusher, wait_until};

    /// Writes two segments, reports them, then swallows its input.
    const TWO_SEGMENTS: &str = r#"
printf 'one' > "$2/$3-00000001.ts"
echo "segmenter: 1, 1, 0, $4, 10.00" >&2
printf 'two' > "$2/$3-00000002.ts"
echo "segmenter: 1, 2, 0, $4, 9.50" >&2
cat > /dev/null
"#;

    fn settings(dest: &Path, label: &str) -> VariantSettings {
        VariantSettings {
            stream: "live".into(),
            quality: "wifi".into(),
            label: label.into(),
            segment_duration: 10,
            max_segments: 5,
            playlist_name: "stream.m3u8".into(),
            publish_url: None,
            allow_cache: false,
            dest_dir: dest.to_path_buf(),
            scratch_root: None,
            restart_on_crash: false,
            stop_timeout: Duration::from_secs(5),
        }
    }

    fn segmenter(script: &Path) -> ProcessSpec {
        let mut spec = ProcessSpec::new("sh");
        spec.arg(script.to_string_lossy());
        spec
    }

    async fn run_writer(dest: &Path, script: &Path, index: SharedIndex) -> (Arc<PipelineGraph>, StageId) {
        let graph = PipelineGraph::new();
        let (source, _input) = pusher("feed");
        let src = graph.add_stage(source);
        let writer = graph.add_stage(SegmentWriter::new(
            "writer",
            segmenter(script),
            settings(dest, "bus-wifi-"),
            index,
        ));
        graph.add_consumer(src, writer).unwrap();
        graph.start(src).await.unwrap();
        (graph, src)
    }

    #[tokio::test]
    async fn publishes_reported_segments() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_tool(dir.path(), "segmenter.sh", TWO_SEGMENTS);
        let dest = dir.path().join("public");
        let index = SharedIndex::new(0);
        let (graph, src) = run_writer(&dest, &script, index.clone()).await;

        let playlist = dest.join("stream.m3u8");
        wait_until(Duration::from_secs(5), || {
            std::fs::read_to_string(&playlist).is_ok_and(|p| p.contains("bus-wifi--00000002.ts"))
        })
        .await;

        let text = std::fs::read_to_string(&playlist).unwrap();
        assert!(text.contains("#EXT-X-MEDIA-SEQUENCE:1\n"));
        assert!(text.contains("#EXTINF:10.00,bus-wifi-\nbus-wifi--00000001.ts\n"));
        assert!(text.contains("#EXTINF:9.50,bus-wifi-\nbus-wifi--00000002.ts\n"));
        assert_eq!(std::fs::read(dest.join("bus-wifi--00000001.ts")).unwrap(), b"one");
        assert_eq!(index.get(), 2);

        graph.stop_tree(src).await.unwrap();
    }

    #[tokio::test]
    async fn restart_resumes_above_shared_index() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_tool(dir.path(), "segmenter.sh", TWO_SEGMENTS);
        let dest = dir.path().join("public");
        let index = SharedIndex::new(7);
        let (graph, src) = run_writer(&dest, &script, index.clone()).await;

        wait_until(Duration::from_secs(5), || dest.join("bus-wifi--00000009.ts").exists()).await;
        assert_eq!(index.get(), 9);
        assert!(dest.join("bus-wifi--00000008.ts").exists());

        graph.stop_tree(src).await.unwrap();
    }

    #[tokio::test]
    async fn recording_copies_segments_into_the_episode() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_tool(
            dir.path(),
            "segmenter.sh",
            r#"
read -r _
printf 'one' > "$2/$3-00000001.ts"
echo "segmenter: 1, 1, 0, $4, 10.00" >&2
cat > /dev/null
"#,
        );
        let dest = dir.path().join("public");
        let episode_dir = dir.path().join("episode");

        let graph = PipelineGraph::new();
        let (source, input) = pusher("feed");
        let src = graph.add_stage(source);
        let writer = graph.add_stage(SegmentWriter::new(
            "writer",
            segmenter(&script),
            settings(&dest, "rec"),
            SharedIndex::new(0),
        ));
        graph.add_consumer(src, writer).unwrap();
        graph.start(src).await.unwrap();

        let handle = graph.stage(writer).unwrap();
        {
            let mut stage = handle.lock().await;
            let recorder = stage.as_recorder().unwrap();
            recorder
                .start_recording(&RecordingTarget {
                    episode: "ep1".into(),
                    directory: episode_dir.clone(),
                    started_at: Utc::now(),
                })
                .await
                .unwrap();
            assert!(recorder.is_recording());
        }

        // The fake segmenter cuts its first segment once it sees input.
        input.send(Bytes::from_static(b"go\n")).await;
        let copy = episode_dir.join("live/wifi/rec-00000001.ts");
        wait_until(Duration::from_secs(5), || copy.exists()).await;

        handle.lock().await.as_recorder().unwrap().stop_recording().await.unwrap();
        let vod = std::fs::read_to_string(episode_dir.join("live/wifi/stream.m3u8")).unwrap();
        assert!(vod.contains("rec-00000001.ts"));
        assert!(vod.trim_end().ends_with("#EXT-X-ENDLIST"));

        graph.stop_tree(src).await.unwrap();
    }
}
