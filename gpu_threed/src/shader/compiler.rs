//! Background shader compilation.
//!
//! Translated guest shaders arrive as GLSL and must become SPIR-V before
//! the host pipeline can use them. Compilation runs on a small worker pool;
//! the caller gets a [`CompileTask`] and blocks on it only when the program
//! is actually needed for a draw. Tasks are not cancellable and carry no
//! timeout: a program that is still compiling stalls its first draw.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

pub use glslc::Stage;

#[derive(Clone, Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Compiler(#[from] glslc::Error),
    #[error("compiler was shut down before the job ran")]
    Shutdown,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompileStatus {
    Pending,
    Ready,
    Failed,
}

enum TaskState {
    Pending,
    Ready(Vec<u32>),
    Failed(CompileError),
}

struct TaskShared {
    state: Mutex<TaskState>,
    done: Condvar,
}

impl TaskShared {
    fn finish(&self, state: TaskState) {
        *self.state.lock() = state;
        self.done.notify_all();
    }
}

/// Wait handle of one queued compilation.
pub struct CompileTask {
    shared: Arc<TaskShared>,
}

impl CompileTask {
    pub fn status(&self) -> CompileStatus {
        match &*self.shared.state.lock() {
            TaskState::Pending => CompileStatus::Pending,
            TaskState::Ready(_) => CompileStatus::Ready,
            TaskState::Failed(_) => CompileStatus::Failed,
        }
    }

    /// Blocks until the job ran and returns the SPIR-V words.
    pub fn wait(&self) -> Result<Vec<u32>, CompileError> {
        let mut state = self.shared.state.lock();
        while matches!(&*state, TaskState::Pending) {
            self.shared.done.wait(&mut state);
        }

        match &*state {
            TaskState::Ready(words) => Ok(words.clone()),
            TaskState::Failed(err) => Err(err.clone()),
            TaskState::Pending => unreachable!(),
        }
    }
}

impl std::fmt::Debug for CompileTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompileTask")
            .field("status", &self.status())
            .finish()
    }
}

struct Job {
    source: String,
    stage: Stage,
    task: Arc<TaskShared>,
}

/// Worker pool turning GLSL into SPIR-V off the draw thread.
pub struct ShaderCompiler {
    queue: Arc<SegQueue<Job>>,
    wake: Arc<(Mutex<()>, Condvar)>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl ShaderCompiler {
    pub fn new(worker_count: usize) -> Self {
        let queue = Arc::new(SegQueue::new());
        let wake = Arc::new((Mutex::new(()), Condvar::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let workers = (0..worker_count.max(1))
            .map(|index| {
                let queue = Arc::clone(&queue);
                let wake = Arc::clone(&wake);
                let shutdown = Arc::clone(&shutdown);
                std::thread::Builder::new()
                    .name(format!("shader-compiler-{index}"))
                    .spawn(move || worker(&queue, &wake, &shutdown))
                    .unwrap()
            })
            .collect();

        Self {
            queue,
            wake,
            shutdown,
            workers,
        }
    }

    /// Queues a compilation and returns its wait handle.
    pub fn queue(&self, source: String, stage: Stage) -> CompileTask {
        let shared = Arc::new(TaskShared {
            state: Mutex::new(TaskState::Pending),
            done: Condvar::new(),
        });

        // Push under the wake lock so a worker between its empty check and
        // the wait cannot miss the notification.
        {
            let _guard = self.wake.0.lock();
            self.queue.push(Job {
                source,
                stage,
                task: Arc::clone(&shared),
            });
        }
        self.wake.1.notify_one();

        CompileTask { shared }
    }
}

impl Drop for ShaderCompiler {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Serialize with workers that already passed the shutdown check.
        drop(self.wake.0.lock());
        self.wake.1.notify_all();
        for worker in self.workers.drain(..) {
            worker.join().ok();
        }

        // Jobs the workers never picked up fail deterministically.
        while let Some(job) = self.queue.pop() {
            job.task.finish(TaskState::Failed(CompileError::Shutdown));
        }
    }
}

impl std::fmt::Debug for ShaderCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderCompiler")
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

fn worker(queue: &SegQueue<Job>, wake: &(Mutex<()>, Condvar), shutdown: &AtomicBool) {
    loop {
        if let Some(job) = queue.pop() {
            run_job(job);
            continue;
        }

        if shutdown.load(Ordering::SeqCst) {
            return;
        }

        let mut guard = wake.0.lock();
        if queue.is_empty() && !shutdown.load(Ordering::SeqCst) {
            wake.1.wait(&mut guard);
        }
    }
}

fn run_job(job: Job) {
    match glslc::compile(&job.source, job.stage) {
        Ok(words) => {
            tracing::debug!("compiled {:?} shader, {} words", job.stage, words.len());
            job.task.finish(TaskState::Ready(words));
        }
        Err(err) => {
            tracing::error!("shader compilation failed: {err}");
            job.task.finish(TaskState::Failed(err.into()));
        }
    }
}
