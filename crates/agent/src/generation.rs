use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use reservo_core::message::PlatformId;
use reservo_core::policy::{ActionRequest, PolicyDecision, PolicyGate};
use reservo_core::session::{Role, Turn};

use crate::llm::{ChatMessage, ChatModel, LlmError, ModelOutput, ToolCall, ToolSpec};
use crate::tools::{ToolExecutor, ToolOutcome};

const BASE_PROMPT: &str = "Eres el asistente de reservas de los centros deportivos. \
Responde de forma breve y cordial en el idioma del usuario. Usa las herramientas \
disponibles para consultar disponibilidad y gestionar reservas; nunca inventes \
confirmaciones.";

/// The delivery channel shapes the register: messaging channels get short
/// unformatted replies, the web widget can afford more detail.
fn system_prompt(platform: PlatformId) -> String {
    let channel_note = match platform {
        PlatformId::Whatsapp | PlatformId::WhatsappBusiness => {
            "Estás atendiendo una conversación de WhatsApp: respuestas muy cortas, sin formato."
        }
        PlatformId::Messenger => {
            "Estás atendiendo una conversación de Messenger: respuestas muy cortas, sin formato."
        }
        PlatformId::Web => {
            "Estás atendiendo el chat web del centro: puedes extenderte algo más si hace falta."
        }
    };
    format!("{BASE_PROMPT} {channel_note}")
}

#[derive(Clone, Debug)]
pub struct GenerationRequest<'a> {
    pub platform: PlatformId,
    pub user_text: &'a str,
    /// Session history including the just-appended user turn.
    pub history: &'a [Turn],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationOutcome {
    pub reply_text: String,
    pub tool_call_count: u32,
    pub token_count: u32,
    /// True when at least one tool call this turn ran on a fail-open allow
    /// because the policy gate errored or timed out.
    pub degraded_policy: bool,
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Model(#[from] LlmError),
    #[error("model did not produce a final reply within {0} tool rounds")]
    ToolRoundsExhausted(u32),
}

/// The generation-and-tool-call loop.
///
/// Every model-requested tool call passes through the policy gate before
/// execution; a gate failure or timeout fails open with a degraded allow so a
/// broken policy service degrades availability of *blocking*, not of replies.
pub struct GenerationEngine {
    model: Arc<dyn ChatModel>,
    policy: Arc<dyn PolicyGate>,
    executor: ToolExecutor,
    tool_specs: Vec<ToolSpec>,
    max_tool_rounds: u32,
    policy_timeout: Duration,
}

impl GenerationEngine {
    pub fn new(
        model: Arc<dyn ChatModel>,
        policy: Arc<dyn PolicyGate>,
        executor: ToolExecutor,
        max_tool_rounds: u32,
        policy_timeout: Duration,
    ) -> Self {
        Self {
            model,
            policy,
            executor,
            tool_specs: ToolExecutor::specs(),
            max_tool_rounds,
            policy_timeout,
        }
    }

    pub async fn generate(
        &self,
        request: GenerationRequest<'_>,
    ) -> Result<GenerationOutcome, GenerationError> {
        let mut messages = Vec::with_capacity(request.history.len() + 1);
        messages.push(ChatMessage::system(system_prompt(request.platform)));
        messages.extend(request.history.iter().map(turn_to_message));

        let mut token_count = 0u32;
        let mut tool_call_count = 0u32;
        let mut degraded_policy = false;
        let mut rounds = 0u32;

        let mut response = self.model.complete(&messages, &self.tool_specs).await?;
        token_count = token_count.saturating_add(response.tokens_used);

        loop {
            match response.output {
                ModelOutput::Text(reply_text) => {
                    return Ok(GenerationOutcome {
                        reply_text,
                        tool_call_count,
                        token_count,
                        degraded_policy,
                    });
                }
                ModelOutput::ToolCall(call) => {
                    rounds += 1;
                    if rounds > self.max_tool_rounds {
                        return Err(GenerationError::ToolRoundsExhausted(self.max_tool_rounds));
                    }
                    tool_call_count += 1;

                    debug!(
                        event_name = "generation.tool_call",
                        tool = %call.name,
                        round = rounds,
                        "model requested a tool call"
                    );

                    let decision = self.policy_decision(request.platform, &call).await;
                    if matches!(decision, PolicyDecision::AllowDegraded { .. }) {
                        degraded_policy = true;
                    }
                    let outcome = self.apply_decision(decision, &call).await;
                    messages.push(ChatMessage::assistant_tool_call(&call));
                    messages.push(ChatMessage::tool(
                        call.id.clone(),
                        outcome.to_model_payload().to_string(),
                    ));

                    response = self.model.complete(&messages, &self.tool_specs).await?;
                    token_count = token_count.saturating_add(response.tokens_used);
                }
            }
        }
    }

    /// Asks the gate for a decision, failing open on gate errors and
    /// timeouts.
    async fn policy_decision(&self, platform: PlatformId, call: &ToolCall) -> PolicyDecision {
        let request = ActionRequest::tool_call(&call.name, call.arguments.clone(), platform);

        match timeout(self.policy_timeout, self.policy.evaluate(&request)).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(error)) => {
                warn!(
                    event_name = "generation.policy_degraded",
                    tool = %call.name,
                    error = %error,
                    "policy evaluator unavailable; failing open"
                );
                PolicyDecision::AllowDegraded { reason: format!("evaluator unavailable: {error}") }
            }
            Err(_) => {
                warn!(
                    event_name = "generation.policy_degraded",
                    tool = %call.name,
                    "policy evaluation timed out; failing open"
                );
                PolicyDecision::AllowDegraded { reason: "evaluation timed out".to_owned() }
            }
        }
    }

    /// Blocked and approval-pending decisions synthesize the outcome without
    /// touching the scheduling collaborator.
    async fn apply_decision(&self, decision: PolicyDecision, call: &ToolCall) -> ToolOutcome {
        match decision {
            PolicyDecision::Allow { .. } | PolicyDecision::AllowDegraded { .. } => {
                self.executor.execute(&call.name, &call.arguments).await
            }
            PolicyDecision::Block { rule, reason } => {
                warn!(
                    event_name = "generation.tool_blocked",
                    tool = %call.name,
                    rule = %rule,
                    "tool call blocked by policy"
                );
                ToolOutcome::Blocked {
                    reason: reason
                        .unwrap_or_else(|| format!("blocked by security policy {rule}")),
                }
            }
            PolicyDecision::RequireApproval { rule, approval_id } => {
                debug!(
                    event_name = "generation.tool_pending_approval",
                    tool = %call.name,
                    rule = %rule,
                    approval_id = %approval_id,
                    "tool call held for manual approval"
                );
                ToolOutcome::ApprovalPending { approval_id }
            }
        }
    }
}

fn turn_to_message(turn: &Turn) -> ChatMessage {
    match turn.role {
        Role::User => ChatMessage::user(turn.content.clone()),
        Role::Assistant => ChatMessage::assistant(turn.content.clone()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::Mutex;

    use reservo_core::message::PlatformId;
    use reservo_core::policy::{
        ActionRequest, Effect, Policy, PolicyDecision, PolicyEngine, PolicyGate, PolicyGateError,
        PolicyRule, TargetPattern,
    };
    use reservo_core::session::Turn;

    use crate::llm::{ChatMessage, ChatModel, LlmError, ModelOutput, ModelResponse, ToolCall, ToolSpec};
    use crate::tools::{SchedulingClient, SchedulingError, ToolExecutor};

    use super::{GenerationEngine, GenerationError, GenerationRequest};

    /// Replays a scripted sequence of model responses and records every
    /// message batch it was asked to complete.
    struct ScriptedModel {
        responses: Mutex<VecDeque<ModelResponse>>,
        seen_messages: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedModel {
        fn new(responses: Vec<ModelResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                seen_messages: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            _tools: &[ToolSpec],
        ) -> Result<ModelResponse, LlmError> {
            self.seen_messages.lock().await.push(messages.to_vec());
            self.responses
                .lock()
                .await
                .pop_front()
                .ok_or_else(|| LlmError::Malformed("script exhausted".to_owned()))
        }
    }

    struct CountingScheduling {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl SchedulingClient for CountingScheduling {
        async fn invoke(
            &self,
            _operation: &str,
            _arguments: &Value,
        ) -> Result<Value, SchedulingError> {
            *self.calls.lock().await += 1;
            Ok(json!({"booking_ref": "B-7"}))
        }
    }

    struct FailingGate;

    #[async_trait]
    impl PolicyGate for FailingGate {
        async fn evaluate(
            &self,
            _request: &ActionRequest,
        ) -> Result<PolicyDecision, PolicyGateError> {
            Err(PolicyGateError::Unavailable("rule store offline".to_owned()))
        }
    }

    fn text_response(text: &str, tokens: u32) -> ModelResponse {
        ModelResponse { output: ModelOutput::Text(text.to_owned()), tokens_used: tokens }
    }

    fn tool_call_response(name: &str, arguments: Value, tokens: u32) -> ModelResponse {
        ModelResponse {
            output: ModelOutput::ToolCall(ToolCall {
                id: "call_1".to_owned(),
                name: name.to_owned(),
                arguments,
            }),
            tokens_used: tokens,
        }
    }

    fn engine_with(
        model: Arc<dyn ChatModel>,
        policy: Arc<dyn PolicyGate>,
        scheduling: Arc<CountingScheduling>,
    ) -> GenerationEngine {
        GenerationEngine::new(
            model,
            policy,
            ToolExecutor::new(scheduling, Duration::from_secs(5)),
            3,
            Duration::from_millis(500),
        )
    }

    fn scheduling() -> Arc<CountingScheduling> {
        Arc::new(CountingScheduling { calls: Mutex::new(0) })
    }

    fn block_all_bookings() -> PolicyEngine {
        PolicyEngine::new(vec![Policy {
            name: "deny-bookings".to_owned(),
            priority: 100,
            rules: vec![PolicyRule {
                action_type: "tool_call".to_owned(),
                target_pattern: TargetPattern::parse("create_booking"),
                conditions: Vec::new(),
                effect: Effect::Block,
                reason: Some("bookings are suspended".to_owned()),
            }],
        }])
    }

    fn history(user_text: &str) -> Vec<Turn> {
        vec![Turn::user(user_text)]
    }

    #[tokio::test]
    async fn plain_text_reply_passes_through_with_token_accounting() {
        let model = Arc::new(ScriptedModel::new(vec![text_response("¡Hola!", 21)]));
        let engine = engine_with(model, Arc::new(PolicyEngine::default()), scheduling());

        let turns = history("Hola");
        let outcome = engine
            .generate(GenerationRequest {
                platform: PlatformId::Whatsapp,
                user_text: "Hola",
                history: &turns,
            })
            .await
            .expect("generation should succeed");

        assert_eq!(outcome.reply_text, "¡Hola!");
        assert_eq!(outcome.tool_call_count, 0);
        assert_eq!(outcome.token_count, 21);
    }

    #[tokio::test]
    async fn allowed_tool_call_executes_and_feeds_the_result_back() {
        let model = Arc::new(ScriptedModel::new(vec![
            tool_call_response("create_booking", json!({"center": "sur"}), 30),
            text_response("Reserva confirmada, ref B-7.", 25),
        ]));
        let booking_client = scheduling();
        let engine =
            engine_with(model.clone(), Arc::new(PolicyEngine::default()), booking_client.clone());

        let turns = history("Resérvame pista en sur");
        let outcome = engine
            .generate(GenerationRequest {
                platform: PlatformId::Whatsapp,
                user_text: "Resérvame pista en sur",
                history: &turns,
            })
            .await
            .expect("generation should succeed");

        assert_eq!(outcome.tool_call_count, 1);
        assert_eq!(outcome.token_count, 55);
        assert!(!outcome.degraded_policy, "a working gate is a plain allow");
        assert_eq!(*booking_client.calls.lock().await, 1);

        // The second completion saw the tool result with the real data.
        let seen = model.seen_messages.lock().await;
        let tool_message = seen[1].last().expect("tool message present");
        assert!(tool_message.content.as_deref().unwrap_or_default().contains("B-7"));
    }

    #[tokio::test]
    async fn blocked_tool_call_skips_the_scheduling_collaborator() {
        let model = Arc::new(ScriptedModel::new(vec![
            tool_call_response("create_booking", json!({"center": "sur"}), 30),
            text_response("No puedo crear esa reserva por políticas de seguridad.", 20),
        ]));
        let booking_client = scheduling();
        let engine = engine_with(model.clone(), Arc::new(block_all_bookings()), booking_client.clone());

        let turns = history("Resérvame pista en sur");
        let outcome = engine
            .generate(GenerationRequest {
                platform: PlatformId::Whatsapp,
                user_text: "Resérvame pista en sur",
                history: &turns,
            })
            .await
            .expect("blocked calls still produce a reply");

        assert_eq!(*booking_client.calls.lock().await, 0, "blocked call must not execute");
        assert!(outcome.reply_text.contains("seguridad"));

        let seen = model.seen_messages.lock().await;
        let tool_payload = seen[1].last().and_then(|message| message.content.clone()).unwrap_or_default();
        assert!(tool_payload.contains("\"blocked\":true"));
        assert!(tool_payload.contains("bookings are suspended"));
    }

    #[tokio::test]
    async fn failing_policy_gate_fails_open_and_still_replies() {
        let model = Arc::new(ScriptedModel::new(vec![
            tool_call_response("create_booking", json!({"center": "sur"}), 18),
            text_response("Hecho.", 9),
        ]));
        let booking_client = scheduling();
        let engine = engine_with(model, Arc::new(FailingGate), booking_client.clone());

        let turns = history("Resérvame pista");
        let outcome = engine
            .generate(GenerationRequest {
                platform: PlatformId::Whatsapp,
                user_text: "Resérvame pista",
                history: &turns,
            })
            .await
            .expect("degraded allow still produces a reply");

        assert_eq!(outcome.reply_text, "Hecho.");
        assert_eq!(outcome.token_count, 27, "token accounting survives the degraded path");
        assert!(outcome.degraded_policy, "the fail-open allow must be tagged as degraded");
        assert_eq!(*booking_client.calls.lock().await, 1, "fail-open executes the tool");
    }

    async fn prompt_sent_for(platform: PlatformId) -> String {
        let model = Arc::new(ScriptedModel::new(vec![text_response("hola", 5)]));
        let engine = engine_with(model.clone(), Arc::new(PolicyEngine::default()), scheduling());

        let turns = history("Hola");
        engine
            .generate(GenerationRequest { platform, user_text: "Hola", history: &turns })
            .await
            .expect("generation should succeed");

        let seen = model.seen_messages.lock().await;
        seen[0][0].content.clone().unwrap_or_default()
    }

    #[tokio::test]
    async fn system_prompt_names_the_delivery_channel() {
        let whatsapp_prompt = prompt_sent_for(PlatformId::Whatsapp).await;
        let web_prompt = prompt_sent_for(PlatformId::Web).await;

        assert!(whatsapp_prompt.contains("WhatsApp"));
        assert!(web_prompt.contains("chat web"));
        assert_ne!(whatsapp_prompt, web_prompt);
    }

    #[tokio::test]
    async fn runaway_tool_loop_hits_the_round_cap() {
        // The model keeps asking for tools and never returns text.
        let responses = (0..5)
            .map(|_| tool_call_response("check_availability", json!({"center": "sur"}), 10))
            .collect();
        let model = Arc::new(ScriptedModel::new(responses));
        let engine = engine_with(model, Arc::new(PolicyEngine::default()), scheduling());

        let turns = history("¿Hay pistas?");
        let error = engine
            .generate(GenerationRequest {
                platform: PlatformId::Whatsapp,
                user_text: "¿Hay pistas?",
                history: &turns,
            })
            .await
            .err()
            .expect("endless tool loop must be cut off");

        assert!(matches!(error, GenerationError::ToolRoundsExhausted(3)));
    }
}
