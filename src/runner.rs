//! Task runners: the collaborator that performs a task's actual work

use crate::batch::Task;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

/// Result of a successful task run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub result: Value,
    pub duration_ms: u64,
}

/// Performs the work described by a task
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &Task) -> Result<TaskOutput>;
}

type RunFn = Arc<dyn Fn(Task) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Runner backed by an async closure; the duration is measured around it
#[derive(Clone)]
pub struct FnRunner {
    run: RunFn,
}

impl FnRunner {
    pub fn new<F, Fut>(run: F) -> Self
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            run: Arc::new(move |task| Box::pin(run(task))),
        }
    }
}

#[async_trait]
impl TaskRunner for FnRunner {
    async fn run(&self, task: &Task) -> Result<TaskOutput> {
        let start = Instant::now();
        let result = (self.run)(task.clone()).await?;
        Ok(TaskOutput {
            result,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Runs an external program per task.
///
/// The task is written to the program's stdin as JSON. Stdout becomes the
/// result (parsed as JSON when possible); a non-zero exit is an error carrying
/// the tail of stderr. The child is killed if the run is dropped, so attempt
/// timeouts terminate it.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
}

/// Bytes of stderr kept in error messages
const STDERR_TAIL: usize = 2048;

impl CommandRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl TaskRunner for CommandRunner {
    async fn run(&self, task: &Task) -> Result<TaskOutput> {
        let start = Instant::now();
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .env("BENCHFLOW_TASK_ID", &task.id)
            .env("BENCHFLOW_TASK_TYPE", &task.task_type)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!(task_id = %task.id, program = %self.program, "Spawning task process");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            let input = serde_json::to_vec(task)?;
            stdin.write_all(&input).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let duration_ms = start.elapsed().as_millis() as u64;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = tail_chars(stderr.trim(), STDERR_TAIL);
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                tail
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        trace!(task_id = %task.id, bytes = output.stdout.len(), "Task process output");
        let result = serde_json::from_str(stdout.trim())
            .unwrap_or_else(|_| Value::String(stdout.trim().to_string()));

        Ok(TaskOutput {
            result,
            duration_ms,
        })
    }
}

fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Sleeps for a random duration and fails with a fixed probability
#[derive(Debug, Clone)]
pub struct SimulatedRunner {
    pub min_duration: Duration,
    pub max_duration: Duration,
    /// Probability in [0, 1] that a run fails
    pub failure_rate: f64,
}

impl Default for SimulatedRunner {
    fn default() -> Self {
        Self {
            min_duration: Duration::from_millis(50),
            max_duration: Duration::from_millis(250),
            failure_rate: 0.1,
        }
    }
}

impl SimulatedRunner {
    pub fn new(min_duration: Duration, max_duration: Duration, failure_rate: f64) -> Self {
        Self {
            min_duration,
            max_duration: max_duration.max(min_duration),
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl TaskRunner for SimulatedRunner {
    async fn run(&self, task: &Task) -> Result<TaskOutput> {
        let (sleep, fails) = {
            let mut rng = rand::rng();
            let millis = rng.random_range(
                self.min_duration.as_millis() as u64..=self.max_duration.as_millis() as u64,
            );
            (
                Duration::from_millis(millis),
                rng.random_bool(self.failure_rate.clamp(0.0, 1.0)),
            )
        };

        tokio::time::sleep(sleep).await;
        if fails {
            return Err(anyhow!("simulated failure for task {}", task.id));
        }
        Ok(TaskOutput {
            result: json!({
                "task_id": task.id,
                "task_type": task.task_type,
                "simulated": true,
            }),
            duration_ms: sleep.as_millis() as u64,
        })
    }
}
