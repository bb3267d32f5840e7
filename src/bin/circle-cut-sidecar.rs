use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use circle_cut_core::config::PipelineConfig;
use circle_cut_core::error::AppError;
use circle_cut_core::ffmpeg::RunControl;
use circle_cut_core::sidecar_api::{self, ErrorPayload, error_payload};
use circle_cut_core::staging::extension_for_mime;
use circle_cut_core::{CircleRequest, Pipeline, PipelineProgress, VideoSource};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

const STARTUP_CLEANUP_MAX_AGE_HOURS: u64 = 24;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    id: u64,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, serde::Serialize)]
struct RpcSuccess {
    id: u64,
    result: Value,
}

#[derive(Debug, serde::Serialize)]
struct RpcFailure {
    id: u64,
    error: ErrorPayload,
}

#[derive(Debug, serde::Serialize)]
struct RpcEvent {
    event: String,
    payload: Value,
}

/// Controls of every job that has been accepted and not yet finished.
#[derive(Clone)]
struct JobState {
    active: Arc<Mutex<HashMap<u64, Arc<RunControl>>>>,
    next_job_id: Arc<AtomicU64>,
}

impl JobState {
    fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(HashMap::new())),
            next_job_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn begin_job(&self) -> (u64, Arc<RunControl>) {
        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let control = Arc::new(RunControl::new());
        self.active.lock().insert(job_id, Arc::clone(&control));
        (job_id, control)
    }

    fn finish_job(&self, job_id: u64) {
        self.active.lock().remove(&job_id);
    }

    fn cancel(&self, job_id: Option<u64>) -> Result<Vec<u64>, AppError> {
        let active = self.active.lock();
        match job_id {
            Some(id) => {
                let control = active
                    .get(&id)
                    .ok_or_else(|| AppError::InvalidRequest(format!("Unknown jobId: {}", id)))?;
                control.cancel();
                Ok(vec![id])
            }
            None => {
                for control in active.values() {
                    control.cancel();
                }
                let mut ids: Vec<u64> = active.keys().copied().collect();
                ids.sort_unstable();
                Ok(ids)
            }
        }
    }
}

struct ActiveJobGuard {
    state: JobState,
    job_id: u64,
}

impl Drop for ActiveJobGuard {
    fn drop(&mut self) {
        self.state.finish_job(self.job_id);
    }
}

/// A chat id may arrive as a number or a string; either way it only names the run directory.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChatId {
    Number(i64),
    Text(String),
}

impl ChatId {
    fn into_label(self) -> String {
        match self {
            ChatId::Number(n) => n.to_string(),
            ChatId::Text(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
enum CirclesProcessParams {
    Url {
        url: String,
        #[serde(rename = "segmentSeconds")]
        segment_seconds: Option<u32>,
        #[serde(rename = "chatId")]
        chat_id: Option<ChatId>,
    },
    Upload {
        #[serde(rename = "inputPath")]
        input_path: PathBuf,
        #[serde(rename = "suggestedExtension")]
        suggested_extension: Option<String>,
        #[serde(rename = "mimeType")]
        mime_type: Option<String>,
        #[serde(rename = "segmentSeconds")]
        segment_seconds: Option<u32>,
        #[serde(rename = "chatId")]
        chat_id: Option<ChatId>,
    },
}

impl From<CirclesProcessParams> for CircleRequest {
    fn from(params: CirclesProcessParams) -> Self {
        match params {
            CirclesProcessParams::Url {
                url,
                segment_seconds,
                chat_id,
            } => CircleRequest {
                source: VideoSource::Url(url),
                segment_seconds,
                label: chat_id.map(ChatId::into_label),
            },
            CirclesProcessParams::Upload {
                input_path,
                suggested_extension,
                mime_type,
                segment_seconds,
                chat_id,
            } => CircleRequest {
                source: VideoSource::LocalFile {
                    path: input_path,
                    suggested_extension: suggested_extension
                        .or_else(|| mime_type.map(|m| extension_for_mime(&m).to_string())),
                },
                segment_seconds,
                label: chat_id.map(ChatId::into_label),
            },
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct CirclesCancelParams {
    job_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CirclesReleaseParams {
    paths: Vec<PathBuf>,
}

type SharedWriter = Arc<Mutex<io::Stdout>>;

fn write_json_line<T: serde::Serialize>(writer: &mut impl Write, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, value)
        .map_err(|e| io::Error::other(format!("serialize response: {}", e)))?;
    writer.write_all(b"\n")?;
    writer.flush()
}

fn write_json_line_shared<T: serde::Serialize>(writer: &SharedWriter, value: &T) -> io::Result<()> {
    let mut guard = writer.lock();
    write_json_line(&mut *guard, value)
}

fn emit_rpc_event(writer: &SharedWriter, event: &str, payload: Value) {
    let message = RpcEvent {
        event: event.to_string(),
        payload,
    };
    if let Err(e) = write_json_line_shared(writer, &message) {
        log::warn!(target: "circle_cut::sidecar", "Could not write {} event: {}", event, e);
    }
}

fn emit_job_progress(writer: &SharedWriter, job_id: u64, payload: PipelineProgress) {
    emit_rpc_event(
        writer,
        "circles.job.progress",
        json!({
            "jobId": job_id,
            "progress": payload.progress,
            "step": payload.step,
        }),
    );
}

fn emit_job_error(writer: &SharedWriter, job_id: u64, error: &ErrorPayload) {
    emit_rpc_event(
        writer,
        "circles.job.error",
        json!({
            "jobId": job_id,
            "kind": error.kind,
            "summary": error.summary,
            "detail": error.detail,
        }),
    );
}

fn write_reply(writer: &SharedWriter, id: u64, result: Result<Value, AppError>) {
    let written = match result {
        Ok(result) => write_json_line_shared(writer, &RpcSuccess { id, result }),
        Err(err) => write_json_line_shared(
            writer,
            &RpcFailure {
                id,
                error: error_payload(&err),
            },
        ),
    };
    if let Err(e) = written {
        log::error!(target: "circle_cut::sidecar", "Could not write reply {}: {}", id, e);
    }
}

fn params_from_value<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, AppError> {
    serde_json::from_value(params)
        .map_err(|e| AppError::InvalidRequest(format!("Invalid params payload: {}", e)))
}

fn to_value<T: serde::Serialize>(value: T, what: &str) -> Result<Value, AppError> {
    serde_json::to_value(value)
        .map_err(|e| AppError::InvalidRequest(format!("Failed to serialize {}: {}", what, e)))
}

fn dispatch_sync(
    method: &str,
    params: Value,
    jobs: &JobState,
    config: &PipelineConfig,
) -> Result<Value, AppError> {
    match method {
        "app.capabilities" => to_value(sidecar_api::app_capabilities(config), "app capabilities"),
        "circles.cancel" => {
            let parsed: CirclesCancelParams = if params.is_null() {
                CirclesCancelParams::default()
            } else {
                params_from_value(params)?
            };
            let cancelled = jobs.cancel(parsed.job_id)?;
            Ok(json!({ "cancelled": !cancelled.is_empty(), "jobIds": cancelled }))
        }
        "circles.release" => {
            let parsed: CirclesReleaseParams = params_from_value(params)?;
            let released = sidecar_api::release_segments(config, &parsed.paths)?;
            Ok(json!({ "released": released }))
        }
        _ => Err(AppError::InvalidRequest(format!("Unknown method: {}", method))),
    }
}

fn handle_circles_process(
    id: u64,
    request: CircleRequest,
    job_id: u64,
    control: Arc<RunControl>,
    writer: &SharedWriter,
    jobs: &JobState,
    pipeline: &Pipeline,
) {
    let _job_guard = ActiveJobGuard {
        state: jobs.clone(),
        job_id,
    };

    let writer_for_events = Arc::clone(writer);
    let progress_emitter: sidecar_api::SidecarProgressEmitter =
        Arc::new(move |payload| emit_job_progress(&writer_for_events, job_id, payload));

    let result = sidecar_api::process_circles(pipeline, request, &control, Some(progress_emitter));
    let reply = match result {
        Ok(output) => {
            emit_rpc_event(
                writer,
                "circles.job.complete",
                json!({ "jobId": job_id, "segmentCount": output.segments.len() }),
            );
            Ok(json!({
                "jobId": job_id,
                "segments": output.segments,
                "skipped": output.skipped,
                "duration": output.duration,
            }))
        }
        Err(err) => {
            emit_job_error(writer, job_id, &error_payload(&err));
            Err(err)
        }
    };
    write_reply(writer, id, reply);
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .format(|buf, record| {
            let target = record.target();
            let target = target.strip_prefix("circle_cut::").unwrap_or(target);
            writeln!(
                buf,
                "{} {:<5} {} {}",
                buf.timestamp_seconds(),
                record.level(),
                target,
                record.args()
            )
        })
        .init();
}

fn main() -> io::Result<()> {
    init_logging();

    let config = match PipelineConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            log::error!(target: "circle_cut::sidecar", "{}", e);
            return Err(io::Error::other(e.to_string()));
        }
    };
    sidecar_api::cleanup_startup_staging(
        &config,
        Duration::from_secs(STARTUP_CLEANUP_MAX_AGE_HOURS * 3600),
    );

    // Jobs block on child processes, so they run on the blocking pool; its size caps
    // how many pipelines encode at once and the rest wait in its queue.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .max_blocking_threads(config.effective_max_concurrent_runs())
        .thread_name("circle-cut-job")
        .build()?;
    let pipeline = Arc::new(Pipeline::new(Arc::clone(&config)));

    log::info!(
        target: "circle_cut::sidecar",
        "Ready (staging {}, up to {} concurrent run(s))",
        config.effective_staging_dir().display(),
        config.effective_max_concurrent_runs()
    );

    let stdin = io::stdin();
    let stdout: SharedWriter = Arc::new(Mutex::new(io::stdout()));
    let jobs = JobState::new();
    let mut workers = Vec::new();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                write_reply(
                    &stdout,
                    0,
                    Err(AppError::InvalidRequest(format!("Invalid input stream: {}", err))),
                );
                continue;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_reply(
                    &stdout,
                    0,
                    Err(AppError::InvalidRequest(format!("Invalid request: {}", err))),
                );
                continue;
            }
        };

        if request.method != "circles.process" {
            let result = dispatch_sync(&request.method, request.params, &jobs, &config);
            write_reply(&stdout, request.id, result);
            continue;
        }

        let params: CirclesProcessParams = match params_from_value(request.params) {
            Ok(params) => params,
            Err(err) => {
                write_reply(&stdout, request.id, Err(err));
                continue;
            }
        };
        // Registered before queueing so a waiting job can already be cancelled.
        let (job_id, control) = jobs.begin_job();
        emit_rpc_event(
            &stdout,
            "circles.job.accepted",
            json!({ "jobId": job_id, "requestId": request.id }),
        );
        let writer = Arc::clone(&stdout);
        let job_state = jobs.clone();
        let pipeline = Arc::clone(&pipeline);
        let id = request.id;
        reap_finished(&runtime, &mut workers);
        workers.push(runtime.spawn_blocking(move || {
            handle_circles_process(
                id,
                params.into(),
                job_id,
                control,
                &writer,
                &job_state,
                &pipeline,
            );
        }));
    }

    for worker in workers {
        join_worker(&runtime, worker);
    }
    Ok(())
}

fn join_worker(runtime: &tokio::runtime::Runtime, worker: JoinHandle<()>) {
    if let Err(e) = runtime.block_on(worker) {
        log::error!(target: "circle_cut::sidecar", "Job worker panicked: {}", e);
    }
}

/// Drops handles of jobs that already finished so a long-lived sidecar does not accumulate them.
fn reap_finished(runtime: &tokio::runtime::Runtime, workers: &mut Vec<JoinHandle<()>>) {
    let (done, running): (Vec<_>, Vec<_>) =
        std::mem::take(workers).into_iter().partition(JoinHandle::is_finished);
    *workers = running;
    for worker in done {
        join_worker(runtime, worker);
    }
}
