use crate::connection::ConnectionManager;
use batchwatch_core::wire::{ProcessingFrame, ServerEvent, TerminalFrame};
use batchwatch_core::{
    ResultRecord, TaskRecord, TaskSeed, TaskStatus, CANCELLED_MESSAGE, DEFAULT_COMPLETION_MESSAGE,
};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The task-state reconciler: folds the event stream into an
/// insertion-ordered task table plus an append-only result log. Submission
/// is the sole creator of task records; events for unknown ids are dropped.
/// Observers only ever see snapshots.
#[derive(Clone, Default)]
pub struct TaskBoard {
    inner: Arc<Mutex<BoardState>>,
}

#[derive(Default)]
struct BoardState {
    tasks: HashMap<String, TaskRecord>,
    order: Vec<String>,
    results: Vec<ResultRecord>,
    // Task ids that already produced a result record; duplicate terminal
    // events update the live record but never append again.
    finalized: HashSet<String>,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds one `waiting` record per submitted file, replacing any previous
    /// batch. The result log is history and is not touched here.
    pub fn init_tasks(&self, seeds: &[TaskSeed]) {
        let mut state = self.inner.lock().unwrap();
        state.tasks.clear();
        state.order.clear();
        for seed in seeds {
            state.order.push(seed.task_id.clone());
            state
                .tasks
                .insert(seed.task_id.clone(), TaskRecord::seeded(seed));
        }
        info!(event = "tasks_seeded", count = seeds.len());
    }

    pub fn apply(&self, event: ServerEvent) {
        let mut state = self.inner.lock().unwrap();
        match event {
            // Session identity is owned by the connection layer; no table
            // mutation for identity frames.
            ServerEvent::Identity(frame) => {
                debug!(event = "identity_observed", session_id = %frame.session_id);
            }
            ServerEvent::Processing(frame) => state.apply_processing(frame),
            ServerEvent::Completed(frame) => {
                state.apply_terminal(frame, TaskStatus::Completed);
            }
            ServerEvent::Error(frame) => {
                state.apply_terminal(frame, TaskStatus::Error);
            }
            ServerEvent::Cancelled(frame) => {
                state.apply_terminal(frame, TaskStatus::Cancelled);
            }
        }
    }

    /// Clears the task table and the result log under one lock acquisition;
    /// no observer can see one cleared and the other not.
    pub fn reset_all(&self) {
        let mut state = self.inner.lock().unwrap();
        state.tasks.clear();
        state.order.clear();
        state.results.clear();
        state.finalized.clear();
        info!(event = "board_reset");
    }

    /// Snapshot of the live table in submission order.
    pub fn tasks(&self) -> Vec<TaskRecord> {
        let state = self.inner.lock().unwrap();
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .cloned()
            .collect()
    }

    pub fn task(&self, task_id: &str) -> Option<TaskRecord> {
        self.inner.lock().unwrap().tasks.get(task_id).cloned()
    }

    /// Snapshot of the result log in capture order.
    pub fn results(&self) -> Vec<ResultRecord> {
        self.inner.lock().unwrap().results.clone()
    }

    pub fn has_errors(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .results
            .iter()
            .any(|record| record.status == TaskStatus::Error)
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|record| !record.status.is_terminal())
            .count()
    }

    /// True once every task in the table is terminal (vacuously true for an
    /// empty table).
    pub fn all_settled(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .tasks
            .values()
            .all(|record| record.status.is_terminal())
    }
}

impl BoardState {
    fn apply_processing(&mut self, frame: ProcessingFrame) {
        let Some(record) = self.tasks.get_mut(&frame.task_id) else {
            warn!(event = "unknown_task", task_id = %frame.task_id, kind = "processing");
            return;
        };
        if let Some(progress) = frame.progress {
            record.progress = progress;
        }
        if let Some(raw) = frame.status.as_deref() {
            match raw.parse::<TaskStatus>() {
                Ok(status) => record.status = status,
                Err(_) => {
                    warn!(event = "unknown_status", task_id = %frame.task_id, status = %raw);
                }
            }
        }
        // Last write wins, including clearing when the event carries none.
        record.message = frame.message;
    }

    fn apply_terminal(&mut self, frame: TerminalFrame, status: TaskStatus) {
        let Some(record) = self.tasks.get_mut(&frame.task_id) else {
            warn!(event = "unknown_task", task_id = %frame.task_id, kind = %status);
            return;
        };
        record.status = status;
        record.message = match status {
            TaskStatus::Completed => {
                record.progress = 100;
                Some(
                    frame
                        .message
                        .unwrap_or_else(|| DEFAULT_COMPLETION_MESSAGE.to_string()),
                )
            }
            TaskStatus::Cancelled => Some(CANCELLED_MESSAGE.to_string()),
            _ => frame.message,
        };

        if !self.finalized.insert(frame.task_id.clone()) {
            debug!(event = "duplicate_terminal", task_id = %frame.task_id, status = %status);
            return;
        }
        let record = self.tasks[&frame.task_id].clone();
        self.results.push(ResultRecord {
            task_id: record.task_id,
            file_name: record.file_name,
            status: record.status,
            message: record.message,
            captured_at: Utc::now(),
        });
    }
}

/// Registers the board as a connection listener and pumps events into it on
/// a background task. The task ends when the manager drops the listener
/// (explicit disconnect).
pub fn spawn_board_feed(manager: &ConnectionManager, board: TaskBoard) -> JoinHandle<()> {
    let mut events = manager.add_listener("task-board");
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            board.apply(event);
        }
        debug!(event = "board_feed_closed");
    })
}
