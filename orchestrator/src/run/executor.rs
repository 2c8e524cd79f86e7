//! Execution collaborator seam.
//!
//! An executor turns a rendered request into a stream of typed steps. The
//! driver consumes the stream one item at a time; dropping the receiver is
//! how a cancelled run tells the executor to stop.

use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One item produced while a run executes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStep {
    /// Progress narration, relayed as a `message` event
    Log(String),
    /// Output fragment, relayed as a `token` event
    Token(String),
    /// Execution finished; a non-empty text replaces the accumulated tokens
    Done(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("execution ended without completing")]
    Incomplete,
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub run_id: Uuid,
    pub crew_id: Uuid,
    /// Prompt as submitted by the caller
    pub prompt: String,
    /// Prompt with the crew recipe applied
    pub rendered_prompt: String,
}

pub type StepStream = mpsc::Receiver<Result<ExecutionStep, ExecutionError>>;

pub trait RunExecutor: Send + Sync {
    fn execute(&self, request: ExecutionRequest) -> StepStream;
}

const STEP_BUFFER: usize = 16;

/// Replays a fixed list of steps for every request.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExecutor {
    steps: Vec<Result<ExecutionStep, ExecutionError>>,
    step_delay: Duration,
}

impl ScriptedExecutor {
    pub fn new(steps: Vec<Result<ExecutionStep, ExecutionError>>) -> Self {
        Self {
            steps,
            step_delay: Duration::ZERO,
        }
    }

    /// Emit `Token` for each fragment, then `Done(final_text)`.
    pub fn tokens(fragments: &[&str], final_text: &str) -> Self {
        let mut steps: Vec<_> = fragments
            .iter()
            .map(|fragment| Ok(ExecutionStep::Token((*fragment).to_string())))
            .collect();
        steps.push(Ok(ExecutionStep::Done(final_text.to_string())));
        Self::new(steps)
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }
}

impl RunExecutor for ScriptedExecutor {
    fn execute(&self, request: ExecutionRequest) -> StepStream {
        let (tx, rx) = mpsc::channel(STEP_BUFFER);
        let steps = self.steps.clone();
        let delay = self.step_delay;
        tokio::spawn(async move {
            for step in steps {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(step).await.is_err() {
                    tracing::debug!(run_id = %request.run_id, "Step receiver dropped, stopping script");
                    return;
                }
            }
        });
        rx
    }
}

/// Default executor for the binary: narrates a plan, then streams the task
/// back word by word.
#[derive(Debug, Clone)]
pub struct PlanningExecutor {
    pub token_delay: Duration,
}

impl Default for PlanningExecutor {
    fn default() -> Self {
        Self {
            token_delay: Duration::from_millis(25),
        }
    }
}

impl RunExecutor for PlanningExecutor {
    fn execute(&self, request: ExecutionRequest) -> StepStream {
        let (tx, rx) = mpsc::channel(STEP_BUFFER);
        let delay = self.token_delay;
        tokio::spawn(async move {
            let planning = format!(
                "Crew planning over {} prompt lines",
                request.rendered_prompt.lines().count()
            );
            if tx.send(Ok(ExecutionStep::Log(planning))).await.is_err() {
                return;
            }

            let words: Vec<&str> = request.prompt.split_whitespace().collect();
            if words.is_empty() {
                let _ = tx
                    .send(Err(ExecutionError::Failed("empty prompt".to_string())))
                    .await;
                return;
            }
            for word in &words {
                tokio::time::sleep(delay).await;
                if tx.send(Ok(ExecutionStep::Token(format!("{word} ")))).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Ok(ExecutionStep::Done(words.join(" ")))).await;
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> ExecutionRequest {
        ExecutionRequest {
            run_id: Uuid::new_v4(),
            crew_id: Uuid::new_v4(),
            prompt: prompt.to_string(),
            rendered_prompt: format!("Task:\n{prompt}"),
        }
    }

    async fn drain(mut stream: StepStream) -> Vec<Result<ExecutionStep, ExecutionError>> {
        let mut items = Vec::new();
        while let Some(item) = stream.recv().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_scripted_executor_replays_steps() {
        let executor = ScriptedExecutor::tokens(&["hi ", "there "], "hi there");
        let items = drain(executor.execute(request("hello"))).await;
        assert_eq!(
            items,
            vec![
                Ok(ExecutionStep::Token("hi ".to_string())),
                Ok(ExecutionStep::Token("there ".to_string())),
                Ok(ExecutionStep::Done("hi there".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn test_planning_executor_echoes_task() {
        let executor = PlanningExecutor {
            token_delay: Duration::ZERO,
        };
        let items = drain(executor.execute(request("ship  it"))).await;
        assert!(matches!(items[0], Ok(ExecutionStep::Log(_))));
        assert_eq!(items[1], Ok(ExecutionStep::Token("ship ".to_string())));
        assert_eq!(items[2], Ok(ExecutionStep::Token("it ".to_string())));
        assert_eq!(items[3], Ok(ExecutionStep::Done("ship it".to_string())));
        assert_eq!(items.len(), 4);
    }

    #[tokio::test]
    async fn test_planning_executor_rejects_empty_prompt() {
        let executor = PlanningExecutor::default();
        let items = drain(executor.execute(request("   "))).await;
        assert_eq!(
            items.last(),
            Some(&Err(ExecutionError::Failed("empty prompt".to_string())))
        );
    }
}
