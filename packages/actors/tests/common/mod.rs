#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use actors::{RenderConfig, RenderQueue};
use render_core::{Job, JobId, RecipeDef};
use storage::ArtifactStoreConfig;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use transcoder::{
    ProgressFn, SegmentRequest, Transcode, TranscodeError, TranscodeFuture, TranscodeRequest,
};

pub const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// Fake transcoder that holds every call until a permit is released.
pub struct GatedTranscoder {
    gate: Semaphore,
    active: AtomicUsize,
    max_active: AtomicUsize,
    /// Work directory names (the job IDs) in the order calls started.
    started: Mutex<Vec<String>>,
    segments: AtomicUsize,
}

impl GatedTranscoder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
            segments: AtomicUsize::new(0),
        })
    }

    /// Let `n` held calls finish.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Let every current and future call finish.
    pub fn open(&self) {
        self.gate.add_permits(10_000);
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    /// Segments encoded so far, across all jobs.
    pub fn segments(&self) -> usize {
        self.segments.load(Ordering::SeqCst)
    }
}

/// Write a segment straight away; only the final transcode is gated.
async fn write_segment(request: &SegmentRequest, progress: &ProgressFn<'_>) -> Result<(), TranscodeError> {
    tokio::fs::write(&request.output, b"segment").await?;
    progress(1.0);
    Ok(())
}

impl Transcode for GatedTranscoder {
    fn transcode<'a>(
        &'a self,
        request: &'a TranscodeRequest,
        cancel: &'a CancellationToken,
        progress: &'a ProgressFn<'a>,
    ) -> TranscodeFuture<'a> {
        Box::pin(async move {
            let job_dir = request
                .output
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.started.lock().unwrap().push(job_dir);

            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            progress(0.5);

            let released = tokio::select! {
                permit = self.gate.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                    true
                }
                _ = cancel.cancelled() => false,
            };

            let result = if released {
                tokio::fs::write(&request.output, b"rendered")
                    .await
                    .map_err(TranscodeError::from)
            } else {
                Err(TranscodeError::Cancelled)
            };
            if result.is_ok() {
                progress(1.0);
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }

    fn segment<'a>(
        &'a self,
        request: &'a SegmentRequest,
        _cancel: &'a CancellationToken,
        progress: &'a ProgressFn<'a>,
    ) -> TranscodeFuture<'a> {
        Box::pin(async move {
            self.segments.fetch_add(1, Ordering::SeqCst);
            write_segment(request, progress).await
        })
    }
}

/// Fake transcoder that fails like ffmpeg does, mentioning its output path.
pub struct FailingTranscoder;

impl Transcode for FailingTranscoder {
    fn transcode<'a>(
        &'a self,
        request: &'a TranscodeRequest,
        _cancel: &'a CancellationToken,
        _progress: &'a ProgressFn<'a>,
    ) -> TranscodeFuture<'a> {
        Box::pin(async move {
            Err(TranscodeError::Failed {
                code: Some(1),
                diagnostic: format!(
                    "[concat @ 0x1] Opening an input file\n{}: Invalid argument\n",
                    request.output.display()
                ),
            })
        })
    }

    fn segment<'a>(
        &'a self,
        request: &'a SegmentRequest,
        _cancel: &'a CancellationToken,
        progress: &'a ProgressFn<'a>,
    ) -> TranscodeFuture<'a> {
        Box::pin(write_segment(request, progress))
    }
}

/// How a [`HeedlessTranscoder`] call ends once released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
    Complete,
    Fail,
}

/// Fake transcoder that never looks at its cancellation token, so a render
/// can finish after a cancel was accepted.
pub struct HeedlessTranscoder {
    gate: Semaphore,
    in_final: AtomicUsize,
    ending: Ending,
}

impl HeedlessTranscoder {
    pub fn new(ending: Ending) -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            in_final: AtomicUsize::new(0),
            ending,
        })
    }

    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    /// Calls currently held in the final transcode.
    pub fn in_final(&self) -> usize {
        self.in_final.load(Ordering::SeqCst)
    }
}

impl Transcode for HeedlessTranscoder {
    fn transcode<'a>(
        &'a self,
        request: &'a TranscodeRequest,
        _cancel: &'a CancellationToken,
        _progress: &'a ProgressFn<'a>,
    ) -> TranscodeFuture<'a> {
        Box::pin(async move {
            self.in_final.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.in_final.fetch_sub(1, Ordering::SeqCst);
            match self.ending {
                Ending::Complete => {
                    tokio::fs::write(&request.output, b"rendered").await?;
                    Ok(())
                }
                Ending::Fail => Err(TranscodeError::Failed {
                    code: Some(1),
                    diagnostic: "Conversion failed!".to_string(),
                }),
            }
        })
    }

    fn segment<'a>(
        &'a self,
        request: &'a SegmentRequest,
        _cancel: &'a CancellationToken,
        progress: &'a ProgressFn<'a>,
    ) -> TranscodeFuture<'a> {
        Box::pin(write_segment(request, progress))
    }
}

pub fn config(root: &Path, max_concurrent: usize) -> RenderConfig {
    RenderConfig {
        storage: ArtifactStoreConfig::new(root.join("renders")),
        ..RenderConfig::default()
    }
    .with_max_concurrent(max_concurrent)
    .unwrap()
}

pub async fn start(
    root: &Path,
    max_concurrent: usize,
    transcoder: Arc<dyn Transcode>,
) -> RenderQueue {
    RenderQueue::start(config(root, max_concurrent), transcoder)
        .await
        .unwrap()
}

/// Write a small input file and return its path.
pub fn source_file(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"not really an image").unwrap();
    path
}

/// One-step image recipe for the given format.
pub fn image_recipe(dir: &Path, name: &str, format: &str) -> RecipeDef {
    let source = source_file(dir, name);
    let json = serde_json::json!({
        "width": 320,
        "height": 240,
        "fps": 25,
        "format": format,
        "steps": [
            { "source": source, "kind": "image", "duration_secs": 2.0 }
        ]
    });
    RecipeDef::from_json(&json.to_string()).unwrap()
}

/// Poll a job until `done` holds or the wait limit passes.
pub async fn wait_for(queue: &RenderQueue, job_id: JobId, done: impl Fn(&Job) -> bool) -> Job {
    tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            if let Some(job) = queue.get_job(job_id).await.unwrap()
                && done(&job)
            {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not reach the expected state in time")
}

/// Poll until `cond` holds or the wait limit passes.
pub async fn eventually<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(WAIT_LIMIT, async {
        while !cond().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition did not hold in time");
}
