//! Agent run tracking: buffers output events for one run and converts
//! them into a final text result or a stream of chunks.
//!
//! Gateways disagree on delivery semantics across generations: older
//! ones emit incremental fragments (sometimes duplicated by the
//! transport), newer ones re-send the cumulative full text on every
//! event. [`OutputMode`] selects between the two; both feed the same
//! tracker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

/// How agent output events deliver text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Each event carries a new fragment to concatenate. Exact
    /// duplicates within the suppression window are dropped.
    Append,
    /// Each event carries the full text-so-far; only the suffix beyond
    /// the stored text is new.
    #[default]
    Cumulative,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunStatus {
    Ok,
    Error,
}

impl RunStatus {
    pub fn parse(status: &str) -> Option<Self> {
        match status {
            "ok" => Some(Self::Ok),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

struct RunState {
    text: String,
    status: Option<RunStatus>,
    summary: Option<String>,
    completed: bool,
    last_fragment: Option<(String, Instant)>,
    stream_tx: Option<mpsc::UnboundedSender<Option<String>>>,
    stream_rx: Option<mpsc::UnboundedReceiver<Option<String>>>,
    streamed_any: bool,
}

/// Per-run buffer, mutated only by the agent event handler. Once
/// completion is signalled the status is fixed and further output no
/// longer changes the result.
pub(crate) struct AgentRun {
    run_id: String,
    mode: OutputMode,
    dup_window: Duration,
    state: Mutex<RunState>,
    done: watch::Sender<bool>,
}

impl AgentRun {
    pub fn new(
        run_id: impl Into<String>,
        mode: OutputMode,
        dup_window: Duration,
        streaming: bool,
    ) -> Arc<Self> {
        let (stream_tx, stream_rx) = if streaming {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (done, _) = watch::channel(false);
        Arc::new(Self {
            run_id: run_id.into(),
            mode,
            dup_window,
            state: Mutex::new(RunState {
                text: String::new(),
                status: None,
                summary: None,
                completed: false,
                last_fragment: None,
                stream_tx,
                stream_rx,
                streamed_any: false,
            }),
            done,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Feed one output event into the buffer.
    pub fn add_output(&self, output: &str) {
        if output.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if state.completed {
            tracing::debug!(run_id = %self.run_id, "output after completion ignored");
            return;
        }

        let new_text = match self.mode {
            OutputMode::Append => {
                if let Some((last, at)) = &state.last_fragment {
                    if last == output && at.elapsed() < self.dup_window {
                        tracing::debug!(
                            run_id = %self.run_id,
                            "dropping duplicate fragment within suppression window"
                        );
                        return;
                    }
                }
                state.last_fragment = Some((output.to_owned(), Instant::now()));
                state.text.push_str(output);
                output.to_owned()
            }
            OutputMode::Cumulative => {
                if let Some(suffix) = output.strip_prefix(state.text.as_str()) {
                    if suffix.is_empty() {
                        return;
                    }
                    let suffix = suffix.to_owned();
                    state.text = output.to_owned();
                    tracing::debug!(
                        run_id = %self.run_id,
                        new_chars = suffix.len(),
                        total = state.text.len(),
                        "appended cumulative suffix"
                    );
                    suffix
                } else {
                    // Out-of-order or non-monotonic delivery; tolerated
                    // but suspicious.
                    tracing::warn!(
                        run_id = %self.run_id,
                        had = state.text.len(),
                        got = output.len(),
                        "non-cumulative text update, replacing buffer"
                    );
                    state.text = output.to_owned();
                    output.to_owned()
                }
            }
        };

        if let Some(tx) = &state.stream_tx {
            if tx.send(Some(new_text)).is_ok() {
                state.streamed_any = true;
            }
        }
    }

    /// Terminal transition; later calls are no-ops.
    pub fn set_complete(&self, status: RunStatus, summary: Option<String>) {
        let mut state = self.state.lock();
        if state.completed {
            return;
        }
        state.completed = true;
        state.status = Some(status);
        state.summary = summary;

        if let Some(tx) = state.stream_tx.take() {
            if !state.streamed_any {
                if let Some(summary) = &state.summary {
                    let _ = tx.send(Some(summary.clone()));
                }
            }
            let _ = tx.send(None);
        }
        drop(state);
        self.done.send_replace(true);
    }

    /// Assembled result: the summary wins over accumulated text.
    pub fn response(&self) -> String {
        let state = self.state.lock();
        match &state.summary {
            Some(summary) => summary.clone(),
            None => state.text.clone(),
        }
    }

    pub fn status(&self) -> Option<RunStatus> {
        self.state.lock().status
    }

    pub fn summary(&self) -> Option<String> {
        self.state.lock().summary.clone()
    }

    /// Watch that flips to `true` when the run completes.
    pub fn completed(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    /// Take the chunk stream. `None` is the termination sentinel; the
    /// receiver can be taken once.
    pub fn take_stream(&self) -> Option<mpsc::UnboundedReceiver<Option<String>>> {
        self.state.lock().stream_rx.take()
    }
}

/// Live runs keyed by the gateway-issued run identifier. Owned by the
/// client instance, cleared as callers consume terminal states.
#[derive(Default)]
pub(crate) struct RunTable {
    runs: Mutex<HashMap<String, Arc<AgentRun>>>,
}

impl RunTable {
    pub fn insert(&self, run: Arc<AgentRun>) {
        self.runs.lock().insert(run.run_id().to_owned(), run);
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<AgentRun>> {
        self.runs.lock().get(run_id).cloned()
    }

    pub fn remove(&self, run_id: &str) {
        self.runs.lock().remove(run_id);
    }

    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }
}
