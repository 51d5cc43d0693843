//! Full pipeline runs exercising restart end to end: a stage that requests a
//! backward restart of an earlier stage, cooldown rejection on an immediate
//! repeat, and rejection of a stage trying to restart a later one.


use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use substrate::{
    AgentInvoker, IterativePipelineExecutor, MessageBus, OutputValidator, PipelineSpec,
    PipelineStage, RestartPolicy, RestartRequest, RestartResponse, SharedMemoryStore,
    SubstrateError, SubscriptionFilter,
};

struct AlwaysAcceptValidator;
impl OutputValidator for AlwaysAcceptValidator {
    fn validate(&self, _output: &str) -> Result<(), SubstrateError> {
        Ok(())
    }
}

fn spec(restart_policy: RestartPolicy) -> PipelineSpec {
    PipelineSpec {
        workflow_id: "wf-restart".into(),
        stages: vec![
            PipelineStage {
                agent_id: "discover".into(),
                prompt_template: "discover from {{previous}}".into(),
            },
            PipelineStage {
                agent_id: "build".into(),
                prompt_template: "build from {{stage-1-output}}".into(),
            },
        ],
        initial_prompt: "seed".into(),
        max_iterations: 10,
        restart_policy,
        restart_triggers: Vec::new(),
        restart_topic: "workflow.restart".into(),
    }
}

/// Stage-aware invoker: publishes a restart request the first time `build`
/// runs, then lets the rerun complete normally.
struct BuildRequestsDiscoverRestart {
    bus: Arc<MessageBus>,
    build_calls: AtomicUsize,
}

#[async_trait]
impl AgentInvoker for BuildRequestsDiscoverRestart {
    async fn invoke(&self, _session_id: &str, prompt: &str) -> Result<String, SubstrateError> {
        if prompt.starts_with("build from") {
            let call = self.build_calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                let req = RestartRequest {
                    requester_stage_id: "build".into(),
                    target_stage_id: "discover".into(),
                    reason: "needs more input".into(),
                    parameters: HashMap::new(),
                    iteration: 1,
                    timestamp_ms: 0,
                };
                let payload = serde_json::to_vec(&req).unwrap();
                self.bus
                    .publish("workflow.restart", "build", payload, HashMap::new())
                    .await
                    .unwrap();
            }
        }
        Ok("{}".to_string())
    }
}

#[tokio::test]
async fn backward_restart_is_accepted_and_resumes_at_target() {
    let bus = Arc::new(MessageBus::new());
    let mut observer = bus
        .subscribe("observer", "workflow.restart", SubscriptionFilter::default(), 8)
        .await
        .unwrap();

    let policy = RestartPolicy {
        enabled: true,
        restartable_stages: vec!["discover".into()],
        cooldown_seconds: 5,
        ..RestartPolicy::default()
    };
    let invoker = Arc::new(BuildRequestsDiscoverRestart {
        bus: bus.clone(),
        build_calls: AtomicUsize::new(0),
    });
    let executor = IterativePipelineExecutor::new(
        spec(policy),
        invoker,
        Arc::new(AlwaysAcceptValidator),
        Arc::new(SharedMemoryStore::new()),
        bus,
    );

    let outcome = executor.run(&CancellationToken::new()).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.final_iteration, 2);
    assert!(outcome.stage_outputs.contains_key("discover"));
    assert!(outcome.stage_outputs.contains_key("build"));

    let accepted = observer.receiver.recv().await.unwrap();
    let response: RestartResponse = serde_json::from_slice(&accepted.payload).unwrap();
    assert!(response.success);
    assert_eq!(response.target_stage_id, "discover");
    assert_eq!(response.iteration, 2);
}

#[tokio::test]
async fn immediate_repeat_restart_is_rejected_by_cooldown() {
    let bus = Arc::new(MessageBus::new());
    let mut observer = bus
        .subscribe("observer", "workflow.restart", SubscriptionFilter::default(), 8)
        .await
        .unwrap();

    struct RestartEveryBuildCall {
        bus: Arc<MessageBus>,
        build_calls: AtomicUsize,
    }

    #[async_trait]
    impl AgentInvoker for RestartEveryBuildCall {
        async fn invoke(&self, _session_id: &str, prompt: &str) -> Result<String, SubstrateError> {
            if prompt.starts_with("build from") {
                self.build_calls.fetch_add(1, Ordering::SeqCst);
                let req = RestartRequest {
                    requester_stage_id: "build".into(),
                    target_stage_id: "discover".into(),
                    reason: "again".into(),
                    parameters: HashMap::new(),
                    iteration: 1,
                    timestamp_ms: 0,
                };
                let payload = serde_json::to_vec(&req).unwrap();
                self.bus
                    .publish("workflow.restart", "build", payload, HashMap::new())
                    .await
                    .unwrap();
            }
            Ok("{}".to_string())
        }
    }

    let policy = RestartPolicy {
        enabled: true,
        restartable_stages: vec!["discover".into()],
        cooldown_seconds: 3600,
        ..RestartPolicy::default()
    };
    let invoker = Arc::new(RestartEveryBuildCall {
        bus: bus.clone(),
        build_calls: AtomicUsize::new(0),
    });
    let executor = IterativePipelineExecutor::new(
        spec(policy),
        invoker,
        Arc::new(AlwaysAcceptValidator),
        Arc::new(SharedMemoryStore::new()),
        bus,
    );

    let outcome = executor.run(&CancellationToken::new()).await.unwrap();
    assert!(outcome.success);

    let first = observer.receiver.recv().await.unwrap();
    let first: RestartResponse = serde_json::from_slice(&first.payload).unwrap();
    assert!(first.success);

    let second = observer.receiver.recv().await.unwrap();
    let second: RestartResponse = serde_json::from_slice(&second.payload).unwrap();
    assert!(!second.success);
    assert_eq!(second.error.as_deref(), Some("cooldown not elapsed"));
}

#[tokio::test]
async fn restart_targeting_a_later_stage_is_rejected_and_order_is_unchanged() {
    let bus = Arc::new(MessageBus::new());
    let mut observer = bus
        .subscribe("observer", "workflow.restart", SubscriptionFilter::default(), 8)
        .await
        .unwrap();

    struct DiscoverRequestsForwardRestart {
        bus: Arc<MessageBus>,
    }

    #[async_trait]
    impl AgentInvoker for DiscoverRequestsForwardRestart {
        async fn invoke(&self, _session_id: &str, prompt: &str) -> Result<String, SubstrateError> {
            if prompt.starts_with("discover from") {
                let req = RestartRequest {
                    requester_stage_id: "discover".into(),
                    target_stage_id: "build".into(),
                    reason: "jump ahead".into(),
                    parameters: HashMap::new(),
                    iteration: 1,
                    timestamp_ms: 0,
                };
                let payload = serde_json::to_vec(&req).unwrap();
                self.bus
                    .publish("workflow.restart", "discover", payload, HashMap::new())
                    .await
                    .unwrap();
            }
            Ok("{}".to_string())
        }
    }

    let policy = RestartPolicy {
        enabled: true,
        restartable_stages: vec!["build".into()],
        ..RestartPolicy::default()
    };
    let invoker = Arc::new(DiscoverRequestsForwardRestart { bus: bus.clone() });
    let executor = IterativePipelineExecutor::new(
        spec(policy),
        invoker,
        Arc::new(AlwaysAcceptValidator),
        Arc::new(SharedMemoryStore::new()),
        bus,
    );

    let outcome = executor.run(&CancellationToken::new()).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.final_iteration, 1);
    assert!(outcome.stage_outputs.contains_key("discover"));
    assert!(outcome.stage_outputs.contains_key("build"));

    let rejected = tokio::time::timeout(Duration::from_secs(1), observer.receiver.recv())
        .await
        .unwrap()
        .unwrap();
    let response: RestartResponse = serde_json::from_slice(&rejected.payload).unwrap();
    assert!(!response.success);
    assert_eq!(response.error.as_deref(), Some("cannot restart forward"));
}
