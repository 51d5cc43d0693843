//! Staged agent execution with autonomous restart, validation retries, and
//! truncated hybrid context passing through [`crate::shared_memory`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::bus::{MessageBus, Subscription, SubscriptionFilter};
use crate::error::SubstrateError;
use crate::shared_memory::{Namespace, PutRequest, SharedMemoryStore};

const MAX_CONTEXT_BYTES: usize = 8192;
const SHARED_MEMORY_CLEANUP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Given a session id and a prompt, returns the agent's raw output. The only
/// LLM-facing seam the executor depends on.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, session_id: &str, prompt: &str) -> Result<String, SubstrateError>;
}

/// Structural validator for stage outputs.
pub trait OutputValidator: Send + Sync {
    fn validate(&self, output: &str) -> Result<(), SubstrateError>;
}

/// Parses `output` as JSON and requires presence of `inputs`, `outputs`, and
/// `evidence` — the only validation `spec.md` asks for (not full schema
/// validation).
pub struct StructuralOutputValidator;

impl OutputValidator for StructuralOutputValidator {
    fn validate(&self, output: &str) -> Result<(), SubstrateError> {
        let value: serde_json::Value =
            serde_json::from_str(output).map_err(|e| SubstrateError::InvalidInput(e.to_string()))?;
        let obj = value
            .as_object()
            .ok_or_else(|| SubstrateError::InvalidInput("stage output is not a JSON object".into()))?;
        for field in ["inputs", "outputs", "evidence"] {
            if !obj.contains_key(field) {
                return Err(SubstrateError::InvalidInput(format!("missing field `{field}`")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineStage {
    pub agent_id: String,
    pub prompt_template: String,
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub enabled: bool,
    pub restartable_stages: Vec<String>,
    pub cooldown_seconds: i64,
    pub reset_shared_memory: bool,
    pub preserve_outputs: bool,
    pub max_validation_retries: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            restartable_stages: Vec::new(),
            cooldown_seconds: 0,
            reset_shared_memory: false,
            preserve_outputs: true,
            max_validation_retries: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub workflow_id: String,
    pub stages: Vec<PipelineStage>,
    pub initial_prompt: String,
    pub max_iterations: u32,
    pub restart_policy: RestartPolicy,
    pub restart_triggers: Vec<String>,
    pub restart_topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartRequest {
    pub requester_stage_id: String,
    pub target_stage_id: String,
    pub reason: String,
    pub parameters: HashMap<String, String>,
    pub iteration: u32,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartResponse {
    pub target_stage_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub output: Option<String>,
    pub iteration: u32,
}

/// Final state of a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub success: bool,
    pub final_iteration: u32,
    pub stage_outputs: HashMap<String, String>,
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn build_prompt(
    template: &str,
    last_output: Option<&str>,
    stage_outputs: &HashMap<String, String>,
    stages: &[PipelineStage],
) -> String {
    let mut result = template.replace("{{previous}}", last_output.unwrap_or(""));
    for (i, stage) in stages.iter().enumerate() {
        let placeholder = format!("{{{{stage-{}-output}}}}", i + 1);
        if result.contains(&placeholder) {
            let value = stage_outputs.get(&stage.agent_id).map(|s| s.as_str()).unwrap_or("");
            result = result.replace(&placeholder, value);
        }
    }
    result
}

fn truncate_output(output: &str, stage_num: usize) -> String {
    if output.len() <= MAX_CONTEXT_BYTES {
        return output.to_string();
    }
    let mut cut = MAX_CONTEXT_BYTES;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    let notice = format!(
        "[OUTPUT TRUNCATED - Full data stored in SharedMemory. Use shared_memory_read(namespace=\"workflow\", key=\"{{stage-{}-output}}\") to fetch complete output]",
        stage_num
    );
    format!("{}{}", &output[..cut], notice)
}

fn find_stage_index(stages: &[PipelineStage], stage_id: &str) -> Option<usize> {
    stages.iter().position(|s| s.agent_id == stage_id)
}

/// Validates a restart request against the ordered rules in `spec.md` §4.6,
/// returning the target stage index on acceptance or the rejection reason.
fn validate_restart(
    req: &RestartRequest,
    spec: &PipelineSpec,
    current_stage_idx: usize,
    current_iteration: u32,
    last_restart_time: &HashMap<String, i64>,
) -> Result<usize, String> {
    if !spec.restart_policy.enabled {
        return Err("restart disabled".to_string());
    }
    let target_idx =
        find_stage_index(&spec.stages, &req.target_stage_id).ok_or_else(|| "target stage does not exist".to_string())?;
    if target_idx >= current_stage_idx {
        return Err("cannot restart forward".to_string());
    }
    if !spec.restart_policy.restartable_stages.is_empty()
        && !spec.restart_policy.restartable_stages.contains(&req.target_stage_id)
    {
        return Err("target stage not restartable".to_string());
    }
    if !spec.restart_triggers.is_empty() && !spec.restart_triggers.contains(&req.requester_stage_id) {
        return Err("requester not authorized".to_string());
    }
    if spec.restart_policy.cooldown_seconds > 0 {
        if let Some(&last) = last_restart_time.get(&req.target_stage_id) {
            if now_secs() - last < spec.restart_policy.cooldown_seconds {
                return Err("cooldown not elapsed".to_string());
            }
        }
    }
    if current_iteration >= spec.max_iterations {
        return Err("max iterations reached".to_string());
    }
    Ok(target_idx)
}

/// Coordinates staged agent execution with autonomous restart, validation
/// retries against fresh conversational context, and hybrid context passing
/// via [`SharedMemoryStore`].
pub struct IterativePipelineExecutor {
    spec: PipelineSpec,
    invoker: Arc<dyn AgentInvoker>,
    validator: Arc<dyn OutputValidator>,
    shared_memory: Arc<SharedMemoryStore>,
    bus: Arc<MessageBus>,
}

impl IterativePipelineExecutor {
    pub fn new(
        spec: PipelineSpec,
        invoker: Arc<dyn AgentInvoker>,
        validator: Arc<dyn OutputValidator>,
        shared_memory: Arc<SharedMemoryStore>,
        bus: Arc<MessageBus>,
    ) -> Self {
        Self {
            spec,
            invoker,
            validator,
            shared_memory,
            bus,
        }
    }

    async fn cleanup(&self, sub: Subscription) {
        let _ = self.bus.unsubscribe(sub.id).await;
        let cleared = tokio::time::timeout(
            SHARED_MEMORY_CLEANUP_TIMEOUT,
            self.shared_memory.clear_namespace(Namespace::Workflow),
        )
        .await;
        if cleared.is_err() {
            tracing::warn!(workflow_id = %self.spec.workflow_id, "workflow namespace cleanup timed out");
        }
    }

    async fn persist_stage_output(
        &self,
        stage: &PipelineStage,
        stage_num: usize,
        output: &str,
    ) -> Result<(), SubstrateError> {
        let mut metadata = HashMap::new();
        metadata.insert("type".to_string(), "stage_output".to_string());
        metadata.insert("stored_at".to_string(), now_secs().to_string());
        metadata.insert("full_size".to_string(), output.len().to_string());
        metadata.insert("agent_id".to_string(), stage.agent_id.clone());
        metadata.insert("stage_num".to_string(), stage_num.to_string());

        self.shared_memory
            .put(PutRequest {
                namespace: Namespace::Workflow,
                key: format!("stage-{}-output", stage_num),
                value: output.as_bytes().to_vec(),
                expected_version: None,
                agent_id: None,
                actor: stage.agent_id.clone(),
                metadata,
                compress: false,
            })
            .await?;
        Ok(())
    }

    /// Runs the pipeline to completion (or failure, or cancellation),
    /// handling restart requests published to `spec.restart_topic` between
    /// stages.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<PipelineOutcome, SubstrateError> {
        let mut restart_sub = self
            .bus
            .subscribe("executor", &self.spec.restart_topic, SubscriptionFilter::default(), 16)
            .await?;

        let mut stage_idx = 0usize;
        let mut iteration = 1u32;
        let mut stage_outputs: HashMap<String, String> = HashMap::new();
        let mut last_output: Option<String> = Some(self.spec.initial_prompt.clone());
        let mut last_restart_time: HashMap<String, i64> = HashMap::new();

        while stage_idx < self.spec.stages.len() {
            let stage = self.spec.stages[stage_idx].clone();
            let stage_num = stage_idx + 1;
            let prompt = build_prompt(&stage.prompt_template, last_output.as_deref(), &stage_outputs, &self.spec.stages);

            let max_retries = self.spec.restart_policy.max_validation_retries;
            let mut accepted_output: Option<String> = None;
            let mut last_error: Option<String> = None;

            for retry in 0..=max_retries {
                let session_id = if retry == 0 {
                    self.spec.workflow_id.clone()
                } else {
                    format!("{}-retry{}", self.spec.workflow_id, retry)
                };

                let invoke_fut = self.invoker.invoke(&session_id, &prompt);
                tokio::pin!(invoke_fut);
                let output = tokio::select! {
                    res = &mut invoke_fut => res,
                    _ = cancel.cancelled() => {
                        self.cleanup(restart_sub).await;
                        return Err(SubstrateError::Cancelled);
                    }
                }?;

                if max_retries == 0 {
                    accepted_output = Some(output);
                    break;
                }
                match self.validator.validate(&output) {
                    Ok(()) => {
                        accepted_output = Some(output);
                        break;
                    }
                    Err(e) => {
                        last_error = Some(e.to_string());
                        continue;
                    }
                }
            }

            let output = match accepted_output {
                Some(o) => o,
                None => {
                    self.cleanup(restart_sub).await;
                    return Err(SubstrateError::ValidationExhausted {
                        retries: max_retries,
                        last_error: last_error.unwrap_or_default(),
                    });
                }
            };

            self.persist_stage_output(&stage, stage_num, &output).await?;

            let truncated = truncate_output(&output, stage_num);
            stage_outputs.insert(stage.agent_id.clone(), truncated.clone());
            last_output = Some(truncated);

            if let Ok(msg) = restart_sub.receiver.try_recv() {
                if let Ok(req) = serde_json::from_slice::<RestartRequest>(&msg.payload) {
                    match validate_restart(&req, &self.spec, stage_idx, iteration, &last_restart_time) {
                        Ok(target_idx) => {
                            last_restart_time.insert(req.target_stage_id.clone(), now_secs());
                            if !self.spec.restart_policy.preserve_outputs {
                                for s in &self.spec.stages[target_idx..] {
                                    stage_outputs.remove(&s.agent_id);
                                }
                            }
                            if self.spec.restart_policy.reset_shared_memory {
                                self.shared_memory.clear_namespace(Namespace::Workflow).await?;
                            }
                            stage_idx = target_idx;
                            iteration += 1;
                            let resp = RestartResponse {
                                target_stage_id: req.target_stage_id,
                                success: true,
                                error: None,
                                output: None,
                                iteration,
                            };
                            let payload = serde_json::to_vec(&resp)?;
                            self.bus.publish(&self.spec.restart_topic, "executor", payload, HashMap::new()).await?;
                            continue;
                        }
                        Err(reason) => {
                            let resp = RestartResponse {
                                target_stage_id: req.target_stage_id,
                                success: false,
                                error: Some(reason),
                                output: None,
                                iteration,
                            };
                            let payload = serde_json::to_vec(&resp)?;
                            self.bus.publish(&self.spec.restart_topic, "executor", payload, HashMap::new()).await?;
                        }
                    }
                }
            }

            stage_idx += 1;
        }

        self.cleanup(restart_sub).await;
        Ok(PipelineOutcome {
            success: true,
            final_iteration: iteration,
            stage_outputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoInvoker {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AgentInvoker for EchoInvoker {
        async fn invoke(&self, session_id: &str, prompt: &str) -> Result<String, SubstrateError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(format!("{{\"session\":\"{}\",\"echo\":\"{}\"}}", session_id, prompt))
        }
    }

    struct AlwaysAcceptValidator;
    impl OutputValidator for AlwaysAcceptValidator {
        fn validate(&self, _output: &str) -> Result<(), SubstrateError> {
            Ok(())
        }
    }

    struct AlwaysRejectValidator;
    impl OutputValidator for AlwaysRejectValidator {
        fn validate(&self, _output: &str) -> Result<(), SubstrateError> {
            Err(SubstrateError::InvalidInput("never valid".into()))
        }
    }

    fn two_stage_spec(restart_policy: RestartPolicy) -> PipelineSpec {
        PipelineSpec {
            workflow_id: "wf-1".into(),
            stages: vec![
                PipelineStage {
                    agent_id: "discover".into(),
                    prompt_template: "seed: {{previous}}".into(),
                },
                PipelineStage {
                    agent_id: "build".into(),
                    prompt_template: "from discover: {{stage-1-output}}".into(),
                },
            ],
            initial_prompt: "start".into(),
            max_iterations: 10,
            restart_policy,
            restart_triggers: Vec::new(),
            restart_topic: "workflow.restart".into(),
        }
    }

    #[tokio::test]
    async fn runs_every_stage_and_persists_outputs_without_validation() {
        let spec = two_stage_spec(RestartPolicy::default());
        let invoker = Arc::new(EchoInvoker { calls: AtomicUsize::new(0) });
        let executor = IterativePipelineExecutor::new(
            spec,
            invoker,
            Arc::new(StructuralOutputValidator),
            Arc::new(SharedMemoryStore::new()),
            Arc::new(MessageBus::new()),
        );
        let outcome = executor.run(&CancellationToken::new()).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.stage_outputs.len(), 2);
    }

    #[tokio::test]
    async fn validation_exhausted_after_all_retries_fail() {
        let mut policy = RestartPolicy::default();
        policy.max_validation_retries = 2;
        let spec = two_stage_spec(policy);
        let invoker = Arc::new(EchoInvoker { calls: AtomicUsize::new(0) });
        let executor = IterativePipelineExecutor::new(
            spec,
            invoker,
            Arc::new(AlwaysRejectValidator),
            Arc::new(SharedMemoryStore::new()),
            Arc::new(MessageBus::new()),
        );
        let err = executor.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SubstrateError::ValidationExhausted { retries: 2, .. }));
    }

    #[tokio::test]
    async fn retry_session_ids_follow_workflow_id_retry_n_convention() {
        struct SessionCapture {
            sessions: tokio::sync::Mutex<Vec<String>>,
        }
        #[async_trait]
        impl AgentInvoker for SessionCapture {
            async fn invoke(&self, session_id: &str, _prompt: &str) -> Result<String, SubstrateError> {
                self.sessions.lock().await.push(session_id.to_string());
                Ok("{}".to_string())
            }
        }
        let mut policy = RestartPolicy::default();
        policy.max_validation_retries = 2;
        let spec = PipelineSpec {
            stages: vec![PipelineStage {
                agent_id: "only".into(),
                prompt_template: "go".into(),
            }],
            ..two_stage_spec(policy)
        };
        let capture = Arc::new(SessionCapture { sessions: tokio::sync::Mutex::new(Vec::new()) });
        let executor = IterativePipelineExecutor::new(
            spec,
            capture.clone(),
            Arc::new(AlwaysRejectValidator),
            Arc::new(SharedMemoryStore::new()),
            Arc::new(MessageBus::new()),
        );
        let _ = executor.run(&CancellationToken::new()).await;
        let sessions = capture.sessions.lock().await;
        assert_eq!(sessions.as_slice(), ["wf-1", "wf-1-retry1", "wf-1-retry2"]);
    }

    #[tokio::test]
    async fn truncation_applies_fixed_notice_beyond_8192_bytes() {
        let long = "x".repeat(9000);
        let truncated = truncate_output(&long, 3);
        assert!(truncated.contains("OUTPUT TRUNCATED"));
        assert!(truncated.contains("stage-3-output"));
        assert!(truncated.len() > MAX_CONTEXT_BYTES);
    }

    #[tokio::test]
    async fn forward_restart_is_rejected() {
        let req = RestartRequest {
            requester_stage_id: "discover".into(),
            target_stage_id: "build".into(),
            reason: "x".into(),
            parameters: HashMap::new(),
            iteration: 1,
            timestamp_ms: 0,
        };
        let mut policy = RestartPolicy::default();
        policy.enabled = true;
        let spec = two_stage_spec(policy);
        // discover (idx 0) asking to restart build (idx 1): forward restart.
        let result = validate_restart(&req, &spec, 0, 1, &HashMap::new());
        assert_eq!(result, Err("cannot restart forward".to_string()));
    }

    #[tokio::test]
    async fn cooldown_blocks_immediate_repeat_restart() {
        let req = RestartRequest {
            requester_stage_id: "build".into(),
            target_stage_id: "discover".into(),
            reason: "x".into(),
            parameters: HashMap::new(),
            iteration: 1,
            timestamp_ms: 0,
        };
        let mut policy = RestartPolicy::default();
        policy.enabled = true;
        policy.cooldown_seconds = 5;
        policy.restartable_stages = vec!["discover".into()];
        let spec = two_stage_spec(policy);

        // build is stage index 1, restarting discover (index 0): backward, accepted first time.
        let mut last_restart_time = HashMap::new();
        let first = validate_restart(&req, &spec, 1, 1, &last_restart_time);
        assert_eq!(first, Ok(0));
        last_restart_time.insert("discover".to_string(), now_secs());

        let second = validate_restart(&req, &spec, 1, 2, &last_restart_time);
        assert_eq!(second, Err("cooldown not elapsed".to_string()));
    }

    #[tokio::test]
    async fn max_iterations_reached_rejects_restart() {
        let req = RestartRequest {
            requester_stage_id: "build".into(),
            target_stage_id: "discover".into(),
            reason: "x".into(),
            parameters: HashMap::new(),
            iteration: 10,
            timestamp_ms: 0,
        };
        let mut policy = RestartPolicy::default();
        policy.enabled = true;
        let mut spec = two_stage_spec(policy);
        spec.max_iterations = 10;
        let result = validate_restart(&req, &spec, 1, 10, &HashMap::new());
        assert_eq!(result, Err("max iterations reached".to_string()));
    }

    #[tokio::test]
    async fn prompt_template_substitutes_previous_and_named_stage_output() {
        let stages = vec![
            PipelineStage {
                agent_id: "a".into(),
                prompt_template: "{{previous}}".into(),
            },
            PipelineStage {
                agent_id: "b".into(),
                prompt_template: "prev={{previous}} a={{stage-1-output}}".into(),
            },
        ];
        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), "a-out".to_string());
        let prompt = build_prompt(&stages[1].prompt_template, Some("a-out"), &outputs, &stages);
        assert_eq!(prompt, "prev=a-out a=a-out");
    }

    #[tokio::test]
    async fn cancellation_token_aborts_run_with_cancelled_error() {
        struct HangingInvoker;
        #[async_trait]
        impl AgentInvoker for HangingInvoker {
            async fn invoke(&self, _session_id: &str, _prompt: &str) -> Result<String, SubstrateError> {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
        let spec = two_stage_spec(RestartPolicy::default());
        let executor = IterativePipelineExecutor::new(
            spec,
            Arc::new(HangingInvoker),
            Arc::new(StructuralOutputValidator),
            Arc::new(SharedMemoryStore::new()),
            Arc::new(MessageBus::new()),
        );
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });
        let err = executor.run(&cancel).await.unwrap_err();
        assert!(matches!(err, SubstrateError::Cancelled));
    }
}
