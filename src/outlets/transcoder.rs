//! A filter stage backed by an external encoder.
//!
//! Input bytes are written to the encoder's stdin and its stdout fans out
//! to the stage's consumers. Diagnostic lines are fed through
//! [`FfmpegDiagnostics`]; an unrequested exit is reported to the graph as a
//! fault and `on_fault` decides whether the stage comes back.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;

use knive_av::{target_fps, transcoder_args, EncoderOptions, FfmpegDiagnostics, ManagedProcess, ProcessSpec};
use knive_core::{Error, ProcessFault, Result};
use knive_pipeline::{FaultAction, Stage, StageContext, StageKind};

use super::process::{forward_stdout, watch_exit};

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Transcoder {
    name: String,
    spec: ProcessSpec,
    target_fps: f64,
    stop_timeout: Duration,
    restart_on_crash: bool,
    process: Option<ManagedProcess>,
    tasks: Vec<JoinHandle<()>>,
}

impl Transcoder {
    /// Run an arbitrary command as the encoder.
    pub fn new(name: impl Into<String>, spec: ProcessSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            target_fps: knive_av::arguments::DEFAULT_TARGET_FPS,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            restart_on_crash: false,
            process: None,
            tasks: Vec::new(),
        }
    }

    /// ffmpeg reading stdin and writing stdout with `options` in between.
    pub fn ffmpeg(name: impl Into<String>, ffmpeg: impl Into<PathBuf>, options: &EncoderOptions) -> Self {
        let mut spec = ProcessSpec::new(ffmpeg);
        spec.args(transcoder_args(options));
        let mut stage = Self::new(name, spec);
        stage.target_fps = target_fps(options);
        stage
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn restart_on_crash(mut self, restart: bool) -> Self {
        self.restart_on_crash = restart;
        self
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }
}

#[async_trait]
impl Stage for Transcoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn role(&self) -> &'static str {
        "transcoder"
    }

    async fn will_start(&mut self, ctx: &StageContext) -> Result<()> {
        let mut diagnostics = FfmpegDiagnostics::new(self.target_fps);
        let mut process = ManagedProcess::spawn(&self.spec, move |line| {
            diagnostics.observe(line);
        })?;

        if let Some(stdout) = process.take_stdout() {
            self.tasks
                .push(forward_stdout(stdout, ctx.output(), process.tool().to_string()));
        }
        self.tasks.push(watch_exit(&process, ctx.faults()));
        self.process = Some(process);
        Ok(())
    }

    async fn receive(&mut self, data: Bytes, _ctx: &StageContext) -> Result<()> {
        let Some(process) = self.process.as_mut() else {
            return Err(Error::tool(self.spec.tool_name(), "not running"));
        };
        process.write(&data).await
    }

    async fn will_stop(&mut self, _ctx: &StageContext) -> Result<()> {
        if let Some(mut process) = self.process.take() {
            process.stop(self.stop_timeout).await;
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        Ok(())
    }

    fn on_fault(&mut self, _fault: &ProcessFault) -> FaultAction {
        if self.restart_on_crash {
            FaultAction::Restart
        } else {
            FaultAction::Stop
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Arc;

    use knive_av::arguments::DEFAULT_TARGET_FPS;
    use knive_core::config::ArgValue;
    use knive_core::events::{EventBus, PipelineEvent};
    use knive_pipeline::PipelineGraph;

    use crate::testing::{pusher, wait_until, Collector, Gate};

    #[test]
    fn ffmpeg_invocation() {
        let mut options = EncoderOptions::new();
        options.insert("vcodec".into(), Some(ArgValue::Text("libx264".into())));
        options.insert("r".into(), Some(ArgValue::Integer(15)));
        let stage = Transcoder::ffmpeg("t", "/usr/bin/ffmpeg", &options);
        assert_eq!(
            stage.spec().arguments(),
            ["-y", "-i", "-", "-r", "15", "-vcodec", "libx264", "-"]
        );
        assert_eq!(stage.target_fps, 15.0);
        assert_eq!(Transcoder::new("u", ProcessSpec::new("cat")).target_fps, DEFAULT_TARGET_FPS);
    }

    #[tokio::test]
    async fn bytes_pass_through_the_process() {
        let graph = PipelineGraph::new();
        let (source, input) = pusher("src");
        let src = graph.add_stage(source);
        let cat = graph.add_stage(Transcoder::new("cat", ProcessSpec::new("cat")));
        let (collector, received) = Collector::new("sink");
        let sink = graph.add_stage(collector);
        graph.add_consumer(src, cat).unwrap();
        graph.add_consumer(cat, sink).unwrap();
        graph.start(src).await.unwrap();

        input.send(Bytes::from_static(b"\x47hello")).await;
        let got = received.wait_for_len(6, Duration::from_secs(5)).await;
        assert_eq!(&got[..], b"\x47hello");

        graph.stop_tree(src).await.unwrap();
        assert!(!graph.is_running(cat));
    }

    #[tokio::test]
    async fn crash_is_reported_and_stops_the_stage() {
        let events = Arc::new(EventBus::new(16));
        let mut rx = events.subscribe();
        let graph = PipelineGraph::with_events(events);

        let (source, input) = pusher("src");
        let src = graph.add_stage(source);
        let mut spec = ProcessSpec::new("sh");
        spec.args(["-c", "read -r _; echo 'Conversion failed!' >&2; exit 1"]);
        let crashing = graph.add_stage(Transcoder::new("enc", spec));
        let (collector, _) = Collector::new("sink");
        let sink = graph.add_stage(collector);
        graph.add_consumer(src, crashing).unwrap();
        graph.add_consumer(crashing, sink).unwrap();
        graph.start(src).await.unwrap();
        input.send(Bytes::from_static(b"go\n")).await;

        let fault = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(event) = rx.recv().await {
                    if let PipelineEvent::StageCrashed { fault, .. } = event.payload {
                        return fault;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(fault.exit_code, Some(1));
        assert_eq!(fault.last_line.as_deref(), Some("Conversion failed!"));
        assert!(fault.command_line.starts_with("sh -c"));

        tokio::time::timeout(Duration::from_secs(5), async {
            while graph.is_running(crashing) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert!(graph.is_running(sink));
    }

    fn is_alive(pid: &str) -> bool {
        std::process::Command::new("kill")
            .args(["-0", pid])
            .status()
            .unwrap()
            .success()
    }

    #[tokio::test]
    async fn failed_start_stops_the_encoder_it_spawned() {
        let dir = tempfile::tempdir().unwrap();
        let pids = dir.path().join("pids");
        let graph = PipelineGraph::new();
        let (source, _input) = pusher("src");
        let src = graph.add_stage(source);
        let mut spec = ProcessSpec::new("sh");
        spec.args(["-c".to_string(), format!("echo $$ >> '{}'; exec cat", pids.display())]);
        let enc = graph.add_stage(Transcoder::new("enc", spec));
        let (gate, refuse) = Gate::new("gate", Duration::ZERO);
        refuse.store(true, std::sync::atomic::Ordering::SeqCst);
        let gate = graph.add_stage(gate);
        graph.add_consumer(src, enc).unwrap();
        graph.add_consumer(enc, gate).unwrap();

        graph.start(src).await.unwrap_err();
        assert!(!graph.is_running(enc));
        let first = std::fs::read_to_string(&pids).unwrap();
        let first = first.lines().next().unwrap().to_string();
        assert!(!is_alive(&first), "encoder {first} outlived the failed start");

        refuse.store(false, std::sync::atomic::Ordering::SeqCst);
        graph.start(src).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(graph.is_running(enc));
        assert!(graph.is_running(src));

        graph.stop_tree(src).await.unwrap();
    }

    #[tokio::test]
    async fn encoder_exiting_during_start_leaves_running() {
        let graph = PipelineGraph::new();
        let (source, _input) = pusher("src");
        let src = graph.add_stage(source);
        let mut spec = ProcessSpec::new("sh");
        spec.args(["-c", "echo 'Unrecognized option' >&2; exit 1"]);
        let enc = graph.add_stage(Transcoder::new("enc", spec));
        let (gate, _) = Gate::new("gate", Duration::from_millis(300));
        let gate = graph.add_stage(gate);
        graph.add_consumer(src, enc).unwrap();
        graph.add_consumer(enc, gate).unwrap();

        graph.start(src).await.unwrap();
        wait_until(Duration::from_secs(5), || !graph.is_running(enc)).await;
        assert!(graph.is_running(gate));
    }
}
