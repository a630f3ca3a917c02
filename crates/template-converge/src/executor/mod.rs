use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, mpsc};
use std::time::Instant;

use serde::Serialize;

use crate::converge::Converger;
use crate::error::ErrorKind;
use crate::resource::{Action, ConvergenceResult, DesiredState};

#[derive(Debug, Clone)]
pub enum ExecEvent {
    RunStarted {
        total: usize,
        dry_run: bool,
    },
    ResourceStarted {
        id: String,
    },
    ResourceFinished {
        id: String,
        status: Status,
        error: Option<String>,
        elapsed_ms: u128,
    },
    RunDone {
        ok: bool,
        failed: usize,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Changed,
    Unchanged,
    Skipped,
    Failed,
}

impl Status {
    fn of(result: &ConvergenceResult) -> Self {
        if result.skipped {
            Status::Skipped
        } else if result.changed {
            Status::Changed
        } else {
            Status::Unchanged
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Changed => "changed",
            Status::Unchanged => "unchanged",
            Status::Skipped => "skipped",
            Status::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceError {
    pub kind: String,
    pub message: String,
}

/// What happened to one declared resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceOutcome {
    pub index: usize,
    pub path: PathBuf,
    pub action: Action,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ConvergenceResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResourceError>,
    pub elapsed_ms: u128,
}

impl ResourceOutcome {
    pub fn id(&self) -> String {
        resource_id(self.index, &self.path)
    }

    pub fn error_kind(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.kind.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub dry_run: bool,
    pub outcomes: Vec<ResourceOutcome>,
}

impl RunReport {
    pub fn ok(&self) -> bool {
        self.failed() == 0
    }

    pub fn failed(&self) -> usize {
        self.count(Status::Failed)
    }

    pub fn changed(&self) -> usize {
        self.count(Status::Changed)
    }

    pub fn count(&self, status: Status) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    dry_run: bool,
    total: usize,
    started: usize,
    by_status: HashMap<&'static str, usize>,
    total_resource_ms: u128,
    failed_resources: Vec<String>,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        let mut summary_print = None::<String>;
        match ev {
            ExecEvent::RunStarted { total, dry_run } => {
                if let Ok(mut s) = self.state.lock() {
                    s.started_at = Some(Instant::now());
                    s.total = total;
                    s.dry_run = dry_run;
                }
                if dry_run {
                    println!("PLAN: {total} resource(s) (dry run)");
                } else {
                    println!("PLAN: {total} resource(s)");
                }
            }
            ExecEvent::ResourceStarted { id } => {
                if let Ok(mut s) = self.state.lock() {
                    s.started = s.started.saturating_add(1);
                }
                println!("RUN: {id}");
            }
            ExecEvent::ResourceFinished {
                id,
                status,
                error,
                elapsed_ms,
            } => {
                if let Ok(mut s) = self.state.lock() {
                    *s.by_status.entry(status.as_str()).or_default() += 1;
                    s.total_resource_ms = s.total_resource_ms.saturating_add(elapsed_ms);
                    if status == Status::Failed {
                        s.failed_resources.push(id.clone());
                    }
                }
                match status {
                    Status::Failed => {
                        println!("FAIL: {id} ({elapsed_ms}ms) {}", error.unwrap_or_default())
                    }
                    _ => println!("DONE: {id} {} ({elapsed_ms}ms)", status.as_str()),
                }
            }
            ExecEvent::RunDone { ok, failed } => {
                if let Ok(mut s) = self.state.lock() {
                    let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                    let n = |k: Status| s.by_status.get(k.as_str()).copied().unwrap_or(0);
                    let mut summary = String::new();
                    summary.push_str("SUMMARY:\n");
                    summary.push_str(&format!("  status: {}\n", if ok { "ok" } else { "failed" }));
                    if s.dry_run {
                        summary.push_str("  mode: dry-run\n");
                    }
                    summary.push_str(&format!(
                        "  resources: total={} started={} changed={} unchanged={} skipped={} failed={}\n",
                        s.total,
                        s.started,
                        n(Status::Changed),
                        n(Status::Unchanged),
                        n(Status::Skipped),
                        n(Status::Failed)
                    ));
                    summary.push_str(&format!(
                        "  elapsed: {}\n",
                        format_elapsed_hms(wall.as_secs())
                    ));
                    summary.push_str(&format!(
                        "  summed_resource_time: {}\n",
                        format_elapsed_hms((s.total_resource_ms / 1000) as u64)
                    ));
                    if !s.failed_resources.is_empty() {
                        summary.push_str(&format!(
                            "  failed_resources: {}\n",
                            s.failed_resources.join(", ")
                        ));
                    }
                    summary_print = Some(summary);
                    *s = StdoutSinkState::default();
                }
                if ok {
                    println!("DONE: ok");
                } else {
                    println!("DONE: failed ({failed} resource(s))");
                }
            }
        }
        if let Some(summary) = summary_print {
            print!("{summary}");
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

/// Drops every event; for callers that only want the returned report.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ExecSink for NullSink {
    fn emit(&self, _ev: ExecEvent) {}
}

fn resource_id(index: usize, path: &std::path::Path) -> String {
    format!("template[{index}]:{}", path.display())
}

fn run_one(
    converger: &Converger,
    index: usize,
    desired: &DesiredState,
    sink: &dyn ExecSink,
) -> ResourceOutcome {
    sink.emit(ExecEvent::ResourceStarted {
        id: resource_id(index, &desired.target_path),
    });
    let start = Instant::now();
    let res = converger.converge(desired);
    let elapsed_ms = start.elapsed().as_millis();
    let (status, result, error) = match res {
        Ok(r) => (Status::of(&r), Some(r), None),
        Err(e) => {
            tracing::error!(path = %desired.target_path.display(), kind = %e.kind(), "{e}");
            (
                Status::Failed,
                None,
                Some(ResourceError {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                }),
            )
        }
    };
    ResourceOutcome {
        index,
        path: desired.target_path.clone(),
        action: desired.action,
        status,
        result,
        error,
        elapsed_ms,
    }
}

fn emit_finished(sink: &dyn ExecSink, o: &ResourceOutcome) {
    sink.emit(ExecEvent::ResourceFinished {
        id: o.id(),
        status: o.status,
        error: o.error.as_ref().map(|e| format!("[{}] {}", e.kind, e.message)),
        elapsed_ms: o.elapsed_ms,
    });
}

fn finish(sink: &dyn ExecSink, report: &RunReport) {
    sink.emit(ExecEvent::RunDone {
        ok: report.ok(),
        failed: report.failed(),
    });
}

/// Converge every resource in declaration order. A failed resource is
/// recorded and the run moves on.
pub fn execute_run(
    converger: &Converger,
    resources: &[DesiredState],
    sink: &dyn ExecSink,
) -> RunReport {
    sink.emit(ExecEvent::RunStarted {
        total: resources.len(),
        dry_run: converger.is_dry_run(),
    });
    let mut report = RunReport {
        dry_run: converger.is_dry_run(),
        outcomes: Vec::with_capacity(resources.len()),
    };
    for (index, desired) in resources.iter().enumerate() {
        let outcome = run_one(converger, index, desired, sink);
        emit_finished(sink, &outcome);
        report.outcomes.push(outcome);
    }
    finish(sink, &report);
    report
}

/// Resources sharing a target path, in declaration order. Groups are ordered
/// by first appearance.
pub fn group_by_target(resources: &[DesiredState]) -> Vec<Vec<usize>> {
    let mut slot: HashMap<&std::path::Path, usize> = HashMap::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (i, r) in resources.iter().enumerate() {
        let g = *slot.entry(r.target_path.as_path()).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[g].push(i);
    }
    groups
}

/// Like [`execute_run`], but independent target paths converge on up to
/// `max_parallel` worker threads. Resources on the same path stay sequential.
/// Outcomes are reported in declaration order regardless of completion order.
pub fn execute_run_parallel(
    converger: &Converger,
    resources: &[DesiredState],
    sink: &dyn ExecSink,
    max_parallel: usize,
) -> RunReport {
    let groups = group_by_target(resources);
    let workers = max_parallel.min(groups.len());
    if workers <= 1 {
        return execute_run(converger, resources, sink);
    }

    sink.emit(ExecEvent::RunStarted {
        total: resources.len(),
        dry_run: converger.is_dry_run(),
    });

    let queue = Mutex::new(groups.into_iter().collect::<VecDeque<_>>());
    let (tx, rx) = mpsc::channel::<ResourceOutcome>();
    let mut slots: Vec<Option<ResourceOutcome>> = vec![None; resources.len()];

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let tx = tx.clone();
            let queue = &queue;
            handles.push(scope.spawn(move || {
                loop {
                    let next = match queue.lock() {
                        Ok(mut q) => q.pop_front(),
                        Err(_) => None,
                    };
                    let Some(group) = next else { break };
                    for index in group {
                        let outcome = run_one(converger, index, &resources[index], sink);
                        if tx.send(outcome).is_err() {
                            return;
                        }
                    }
                }
            }));
        }
        drop(tx);

        for outcome in rx {
            emit_finished(sink, &outcome);
            let index = outcome.index;
            slots[index] = Some(outcome);
        }

        // Join the workers so panics are surfaced.
        for h in handles {
            if let Err(panic) = h.join() {
                tracing::error!("converge worker panicked: {:?}", panic);
            }
        }
    });

    let outcomes = slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.unwrap_or_else(|| {
                let desired = &resources[index];
                let outcome = ResourceOutcome {
                    index,
                    path: desired.target_path.clone(),
                    action: desired.action,
                    status: Status::Failed,
                    result: None,
                    error: Some(ResourceError {
                        kind: ErrorKind::IoFailure.to_string(),
                        message: "worker exited before converging this resource".into(),
                    }),
                    elapsed_ms: 0,
                };
                emit_finished(sink, &outcome);
                outcome
            })
        })
        .collect();

    let report = RunReport {
        dry_run: converger.is_dry_run(),
        outcomes,
    };
    finish(sink, &report);
    report
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
