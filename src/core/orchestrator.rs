//! 主控编排：一个用户消息 → 一个回合
//!
//! 输入护栏 → 选定智能体 → 组装上下文（历史窗口 + 记录 + 检索）→ 模型调用
//! → { 工具调用循环 | handoff 循环 } → 最终文本 → 输出护栏 → 原子落库 → 响应。
//!
//! 回合内的所有变更先写入 `TurnDraft`，结束时一次性提交给 MemoryStore；取消在任何挂起点生效，
//! 被取消的回合不落库。同一会话的回合经 SessionSupervisor 的回合锁串行执行。

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::Instrument;

use crate::agents::{AgentDefinition, AgentRegistry};
use crate::config::AppConfig;
use crate::core::error::{OrchestratorError, TurnFailure};
use crate::core::events::TurnEvent;
use crate::core::recovery::{RecoveryAction, RecoveryEngine};
use crate::core::session_supervisor::SessionSupervisor;
use crate::core::state::{ToolInvocation, TurnOutcome, TurnResponse, TurnState};
use crate::guardrails::{GuardrailContext, GuardrailOutcome, GuardrailPipeline, GuardrailStage, GuardrailVerdict};
use crate::knowledge::{NoopRetriever, Retriever};
use crate::llm::{ModelClient, ModelContext, ModelError, ModelOutput};
use crate::memory::{
    recent_window, MemoryStore, Message, MessagePayload, SessionId, SessionStatus, SessionView,
    TurnCommit,
};
use crate::tools::{ToolCall, ToolDispatcher, ToolResult, ToolSchema};

const REFUSAL_TEXT: &str = "I'm sorry, but I can't help with that request.";

/// 回合级上限与超时
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub max_tool_iterations: usize,
    pub max_handoffs: usize,
    pub history_window: usize,
    pub top_k: usize,
    pub model_timeout: Duration,
    /// None 表示不设回合总超时
    pub turn_timeout: Option<Duration>,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            max_tool_iterations: 6,
            max_handoffs: 3,
            history_window: 20,
            top_k: 4,
            model_timeout: Duration::from_secs(60),
            turn_timeout: Some(Duration::from_secs(180)),
        }
    }
}

impl TurnSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let o = &cfg.orchestrator;
        Self {
            max_tool_iterations: o.max_tool_iterations,
            max_handoffs: o.max_handoffs,
            history_window: o.history_window,
            top_k: cfg.retrieval.top_k,
            model_timeout: Duration::from_secs(cfg.llm.timeouts.request_secs.max(1)),
            turn_timeout: (o.turn_timeout_secs > 0).then(|| Duration::from_secs(o.turn_timeout_secs)),
        }
    }
}

/// 回合草稿：回合结束前的一切变更
struct TurnDraft {
    turn: u64,
    state: TurnState,
    states: Vec<TurnState>,
    events: Vec<TurnEvent>,
    messages: Vec<Message>,
    next_msg: u32,
    next_call: u32,
    agent: Option<String>,
    tools_invoked: Vec<ToolInvocation>,
    guardrail_actions: Vec<GuardrailVerdict>,
    final_text: Option<String>,
    refusal: Option<String>,
    /// 已发出、尚未拿到结果的工具调用
    pending_calls: Vec<ToolCall>,
    dispatch_started: Option<Instant>,
}

impl TurnDraft {
    fn new(turn: u64) -> Self {
        Self {
            turn,
            state: TurnState::Received,
            states: vec![TurnState::Received],
            events: Vec::new(),
            messages: Vec::new(),
            next_msg: 0,
            next_call: 0,
            agent: None,
            tools_invoked: Vec::new(),
            guardrail_actions: Vec::new(),
            final_text: None,
            refusal: None,
            pending_calls: Vec::new(),
            dispatch_started: None,
        }
    }

    fn transition(&mut self, to: TurnState) {
        if !self.state.can_transition_to(to) {
            tracing::warn!(from = ?self.state, to = ?to, "unexpected turn state transition");
        }
        self.events.push(TurnEvent::StateChanged {
            from: self.state,
            to,
        });
        self.states.push(to);
        self.state = to;
    }

    fn msg_id(&mut self) -> String {
        self.next_msg += 1;
        format!("msg-{}-{}", self.turn, self.next_msg)
    }

    fn call_id(&mut self) -> String {
        self.next_call += 1;
        format!("call-{}-{}", self.turn, self.next_call)
    }

    fn select_agent(&mut self, agent: &str) {
        self.transition(TurnState::AgentSelected);
        self.events.push(TurnEvent::AgentSelected {
            agent: agent.to_string(),
        });
        self.agent = Some(agent.to_string());
    }

    fn record_verdict(&mut self, verdict: &GuardrailVerdict) {
        self.events.push(TurnEvent::Guardrail {
            stage: verdict.stage,
            outcome: verdict.outcome,
            check: verdict.check.clone(),
            reason: verdict.reason.clone(),
        });
        if verdict.outcome != GuardrailOutcome::Allow {
            self.guardrail_actions.push(verdict.clone());
        }
    }

    /// 护栏拒绝：记录一条带裁决的系统消息并进入 Blocked
    fn block(&mut self, verdict: GuardrailVerdict) {
        let reason = verdict
            .reason
            .clone()
            .unwrap_or_else(|| "blocked by guardrail".to_string());
        let id = self.msg_id();
        let mut msg = Message::system(id, REFUSAL_TEXT)
            .with_payload(MessagePayload::Guardrail { verdict });
        msg.agent = self.agent.clone();
        self.messages.push(msg);
        self.refusal = Some(reason);
        self.transition(TurnState::Blocked);
    }

    fn record_result(&mut self, agent: &str, result: ToolResult) {
        self.events.push(TurnEvent::ToolResult {
            call_id: result.call_id.clone(),
            tool: result.tool.clone(),
            status: result.status,
            duration_ms: result.duration_ms,
        });
        self.tools_invoked.push(ToolInvocation {
            call_id: result.call_id.clone(),
            tool: result.tool.clone(),
            status: result.status,
        });
        let id = self.msg_id();
        self.messages.push(Message::tool(id, result).with_agent(agent));
    }

    /// 回合在工具执行中被截断：为每个未完成的调用补一条超时结果，保证调用与结果一一对应
    fn close_pending_calls(&mut self) {
        let calls = std::mem::take(&mut self.pending_calls);
        if calls.is_empty() {
            return;
        }
        let elapsed = self
            .dispatch_started
            .take()
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let agent = self.agent.clone().unwrap_or_default();
        for call in &calls {
            self.record_result(&agent, ToolResult::timeout(call, elapsed));
        }
    }

    fn tool_names(&self) -> String {
        self.tools_invoked
            .iter()
            .map(|t| t.tool.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// 解析显式偏好：`remember: key = value` 或 `remember: text`（中文 `记住：` 同义）
pub fn parse_remember(text: &str) -> Option<(String, String)> {
    let trimmed = text.trim();
    let lower = trimmed.to_lowercase();
    let rest = if lower.starts_with("remember:") {
        &trimmed["remember:".len()..]
    } else if let Some(r) = trimmed
        .strip_prefix("记住：")
        .or_else(|| trimmed.strip_prefix("记住:"))
    {
        r
    } else {
        return None;
    };
    let rest = rest.trim();
    if rest.is_empty() {
        return None;
    }
    match rest.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() && !v.trim().is_empty() => {
            let key = k
                .trim()
                .to_lowercase()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join("_");
            Some((key, v.trim().to_string()))
        }
        _ => Some(("note".to_string(), rest.to_string())),
    }
}

pub struct Orchestrator {
    model: Arc<dyn ModelClient>,
    agents: RwLock<Arc<AgentRegistry>>,
    dispatcher: Arc<ToolDispatcher>,
    guardrails: GuardrailPipeline,
    memory: Arc<dyn MemoryStore>,
    retriever: Arc<dyn Retriever>,
    recovery: RecoveryEngine,
    supervisor: SessionSupervisor,
    settings: TurnSettings,
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn ModelClient>,
        agents: AgentRegistry,
        dispatcher: ToolDispatcher,
        memory: Arc<dyn MemoryStore>,
    ) -> Self {
        Self {
            model,
            agents: RwLock::new(Arc::new(agents)),
            dispatcher: Arc::new(dispatcher),
            guardrails: GuardrailPipeline::new(),
            memory,
            retriever: Arc::new(NoopRetriever),
            recovery: RecoveryEngine::default(),
            supervisor: SessionSupervisor::new(),
            settings: TurnSettings::default(),
        }
    }

    pub fn with_guardrails(mut self, guardrails: GuardrailPipeline) -> Self {
        self.guardrails = guardrails;
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = retriever;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryEngine) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_settings(mut self, settings: TurnSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn memory(&self) -> &Arc<dyn MemoryStore> {
        &self.memory
    }

    pub fn dispatcher(&self) -> &ToolDispatcher {
        &self.dispatcher
    }

    pub fn settings(&self) -> &TurnSettings {
        &self.settings
    }

    /// 当前注册表快照
    pub fn agents(&self) -> Arc<AgentRegistry> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// 整体替换注册表；进行中的回合继续使用各自的快照
    pub fn swap_agents(&self, registry: AgentRegistry) {
        let names = registry.names().join(",");
        *self.agents.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(registry);
        tracing::info!(agents = %names, "agent registry swapped");
    }

    pub async fn open_session(&self, user_id: &str) -> Result<SessionId, OrchestratorError> {
        let id = format!("session_{}", uuid::Uuid::new_v4().simple());
        self.memory.create_session(&id, user_id).await?;
        Ok(id)
    }

    /// 关闭会话：取消进行中的回合并等待其结束
    pub async fn close_session(&self, session_id: &str) -> Result<(), OrchestratorError> {
        self.supervisor.cancel(session_id);
        let lock = self.supervisor.turn_lock(session_id);
        let _guard = lock.lock().await;
        self.memory.close(session_id).await?;
        drop(_guard);
        self.supervisor.forget(session_id);
        Ok(())
    }

    /// 取消会话中进行中的回合；没有进行中的回合时返回 false
    pub fn cancel_turn(&self, session_id: &str) -> bool {
        let cancelled = self.supervisor.cancel(session_id);
        if cancelled {
            tracing::info!(session = %session_id, "turn cancellation requested");
        }
        cancelled
    }

    pub async fn history(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, OrchestratorError> {
        Ok(self.memory.history(session_id, limit).await?)
    }

    /// 撤销最后一条消息
    pub async fn undo_last(&self, session_id: &str) -> Result<Option<Message>, OrchestratorError> {
        let lock = self.supervisor.turn_lock(session_id);
        let _guard = lock.lock().await;
        Ok(self.memory.pop_message(session_id).await?)
    }

    pub async fn clear_history(&self, session_id: &str) -> Result<(), OrchestratorError> {
        let lock = self.supervisor.turn_lock(session_id);
        let _guard = lock.lock().await;
        Ok(self.memory.clear(session_id).await?)
    }

    /// 淘汰空闲会话并释放其监管槽位；回合进行中的会话不淘汰
    pub async fn cleanup_expired(&self, ttl: Duration) -> usize {
        let (guards, busy) = self.supervisor.lock_idle();
        let expired = self.memory.cleanup_expired(ttl, &busy).await;
        drop(guards);
        for id in &expired {
            self.supervisor.forget(id);
        }
        expired.len()
    }

    /// 处理一个回合；Blocked 以 Refused 正常返回，编排错误以 TurnFailure 返回
    pub async fn handle_turn(
        &self,
        session_id: &str,
        user_message: &str,
    ) -> Result<TurnResponse, TurnFailure> {
        let text = user_message.trim();
        if text.is_empty() {
            return Err(TurnFailure::early(session_id, OrchestratorError::EmptyMessage));
        }

        let lock = self.supervisor.turn_lock(session_id);
        let _turn_guard = lock.lock().await;

        let session = self
            .memory
            .get(session_id)
            .await
            .map_err(|e| TurnFailure::early(session_id, e.into()))?;
        if session.status == SessionStatus::Closed {
            return Err(TurnFailure::early(
                session_id,
                OrchestratorError::SessionClosed(session_id.to_string()),
            ));
        }

        let registry = self.agents();
        let token = self.supervisor.begin_turn(session_id);
        let mut draft = TurnDraft::new(session.turn_counter + 1);
        let span = tracing::info_span!("turn", session = %session_id, turn = draft.turn);

        let outcome = {
            let run = self
                .drive(&session, &registry, text, &mut draft)
                .instrument(span.clone());
            let bounded = async {
                match self.settings.turn_timeout {
                    Some(limit) => timeout(limit, run).await.unwrap_or_else(|_| {
                        Err(OrchestratorError::TurnTimeout {
                            timeout_ms: limit.as_millis() as u64,
                        })
                    }),
                    None => run.await,
                }
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(OrchestratorError::Cancelled),
                r = bounded => r,
            }
        };
        self.supervisor.finish_turn(session_id);

        self.finalize(&session, text, draft, outcome)
            .instrument(span)
            .await
    }

    async fn drive(
        &self,
        session: &SessionView,
        registry: &AgentRegistry,
        text: &str,
        draft: &mut TurnDraft,
    ) -> Result<(), OrchestratorError> {
        let ctx = GuardrailContext {
            session_id: &session.id,
            user_id: &session.user_id,
            agent: None,
        };

        // 输入护栏
        let verdict = self.guardrails.evaluate(GuardrailStage::Input, text, &ctx);
        draft.record_verdict(&verdict);
        let user_id = draft.msg_id();
        let mut user_msg = Message::user(user_id, text);
        if verdict.is_block() {
            draft.messages.push(user_msg);
            draft.block(verdict);
            return Ok(());
        }
        let model_input = match (&verdict.outcome, &verdict.replacement) {
            (GuardrailOutcome::Rewrite, Some(replacement)) => {
                user_msg.content = replacement.clone();
                user_msg.payload = Some(MessagePayload::Guardrail {
                    verdict: verdict.clone(),
                });
                replacement.clone()
            }
            _ => text.to_string(),
        };
        draft.messages.push(user_msg);
        draft.transition(TurnState::InputGuarded);

        // 选定智能体：沿用会话活跃智能体，否则根智能体
        let mut agent: AgentDefinition = match session.active_agent.as_deref() {
            Some(name) => match registry.lookup(name) {
                Ok(def) => def.clone(),
                Err(_) => {
                    tracing::warn!(agent = %name, "active agent missing from registry; using root");
                    registry.root().clone()
                }
            },
            None => registry.root().clone(),
        };
        draft.select_agent(&agent.name);

        let retrieved = self.retriever.query(&model_input, self.settings.top_k).await;
        let mut records = session.records.clone();
        records.extend(self.memory.get_long_term(&session.user_id).await);
        let history = recent_window(&session.messages, self.settings.history_window).to_vec();
        draft.events.push(TurnEvent::ContextAssembled {
            agent: agent.name.clone(),
            history: history.len(),
            records: records.len(),
            chunks: retrieved.iter().map(|c| c.chunk.id.clone()).collect(),
        });

        let mut tool_rounds = 0usize;
        let mut handoffs = 0usize;

        loop {
            let tools = self.dispatcher.registry().schemas_for(&agent.allowed_tools);
            let mut messages = history.clone();
            messages.extend(draft.messages.iter().cloned());
            let context = ModelContext {
                session_id: session.id.clone(),
                user_id: session.user_id.clone(),
                agent: agent.name.clone(),
                instructions: agent.instructions.clone(),
                messages,
                handoff_targets: registry.handoff_targets(&agent),
                records: records.clone(),
                retrieved: retrieved.clone(),
            };

            draft.transition(TurnState::ModelCalled);
            let output = self.call_model(&context, &tools, draft).await?;

            match output {
                ModelOutput::ToolCalls(requests) => {
                    if tool_rounds >= self.settings.max_tool_iterations {
                        return Err(OrchestratorError::ToolLoopExceeded {
                            limit: self.settings.max_tool_iterations,
                        });
                    }
                    tool_rounds += 1;
                    draft.transition(TurnState::ToolPending);

                    let origin = draft.msg_id();
                    let calls: Vec<ToolCall> = requests
                        .into_iter()
                        .map(|r| ToolCall {
                            id: draft.call_id(),
                            tool: r.tool,
                            arguments: r.arguments,
                            origin_message: origin.clone(),
                        })
                        .collect();
                    for call in &calls {
                        draft.events.push(TurnEvent::ToolCall {
                            call_id: call.id.clone(),
                            tool: call.tool.clone(),
                            args: call.arguments.clone(),
                        });
                    }
                    let summary = format!(
                        "Calling {}",
                        calls.iter().map(|c| c.tool.as_str()).collect::<Vec<_>>().join(", ")
                    );
                    draft.messages.push(
                        Message::agent(origin, &agent.name, summary)
                            .with_payload(MessagePayload::ToolCalls { calls: calls.clone() }),
                    );

                    draft.pending_calls = calls.clone();
                    draft.dispatch_started = Some(Instant::now());
                    let results = self
                        .dispatcher
                        .invoke_batch(&agent.name, &calls, &agent.allowed_tools)
                        .await;
                    draft.pending_calls.clear();
                    draft.dispatch_started = None;
                    for result in results {
                        draft.record_result(&agent.name, result);
                    }
                }
                ModelOutput::Handoff { target, reason } => {
                    if !agent.can_hand_off_to(&target) || registry.lookup(&target).is_err() {
                        return Err(OrchestratorError::InvalidHandoff {
                            from: agent.name.clone(),
                            to: target,
                        });
                    }
                    if handoffs >= self.settings.max_handoffs {
                        return Err(OrchestratorError::HandoffLoopExceeded {
                            limit: self.settings.max_handoffs,
                        });
                    }
                    handoffs += 1;
                    draft.transition(TurnState::HandoffPending);
                    draft.events.push(TurnEvent::Handoff {
                        from: agent.name.clone(),
                        to: target.clone(),
                    });
                    let content = match &reason {
                        Some(r) => format!("Handoff from {} to {}: {}", agent.name, target, r),
                        None => format!("Handoff from {} to {}", agent.name, target),
                    };
                    let id = draft.msg_id();
                    draft.messages.push(
                        Message::system(id, content)
                            .with_agent(&agent.name)
                            .with_payload(MessagePayload::Handoff {
                                from: agent.name.clone(),
                                to: target.clone(),
                            }),
                    );
                    tracing::info!(from = %agent.name, to = %target, "handoff");

                    agent = registry
                        .lookup(&target)
                        .map_err(|_| OrchestratorError::AgentNotFound(target.clone()))?
                        .clone();
                    draft.select_agent(&agent.name);
                }
                ModelOutput::FinalText(answer) => {
                    draft.transition(TurnState::OutputGuarded);
                    let out_ctx = GuardrailContext {
                        agent: Some(&agent.name),
                        ..ctx
                    };
                    let verdict = self
                        .guardrails
                        .evaluate(GuardrailStage::Output, &answer, &out_ctx);
                    draft.record_verdict(&verdict);
                    if verdict.is_block() {
                        draft.block(verdict);
                        return Ok(());
                    }
                    let id = draft.msg_id();
                    let mut msg = Message::agent(id, &agent.name, answer.clone());
                    let final_text = match (&verdict.outcome, &verdict.replacement) {
                        (GuardrailOutcome::Rewrite, Some(replacement)) => {
                            msg.content = replacement.clone();
                            msg.payload = Some(MessagePayload::Guardrail {
                                verdict: verdict.clone(),
                            });
                            replacement.clone()
                        }
                        _ => answer,
                    };
                    draft.messages.push(msg);
                    draft.final_text = Some(final_text);
                    draft.transition(TurnState::Complete);
                    return Ok(());
                }
            }
        }
    }

    /// 带本地超时与重试的模型调用
    async fn call_model(
        &self,
        context: &ModelContext,
        tools: &[ToolSchema],
        draft: &mut TurnDraft,
    ) -> Result<ModelOutput, OrchestratorError> {
        let mut retries = 0u32;
        loop {
            let attempt = retries + 1;
            draft.events.push(TurnEvent::ModelCalled {
                agent: context.agent.clone(),
                attempt,
            });
            let result = match timeout(self.settings.model_timeout, self.model.complete(context, tools)).await {
                Ok(r) => r,
                Err(_) => Err(ModelError::Timeout),
            };
            let result = result.and_then(|out| match out {
                ModelOutput::ToolCalls(calls) if calls.is_empty() => {
                    Err(ModelError::InvalidOutput("empty tool call list".into()))
                }
                other => Ok(other),
            });
            let err = match result {
                Ok(out) => return Ok(out),
                Err(e) => e,
            };
            match self.recovery.handle(&err, retries) {
                RecoveryAction::RetryAfter(backoff) => {
                    tracing::warn!(agent = %context.agent, attempt, error = %err, backoff_ms = backoff.as_millis() as u64, "model call failed; retrying");
                    draft.events.push(TurnEvent::ModelRetry {
                        attempt,
                        error: err.to_string(),
                        backoff_ms: backoff.as_millis() as u64,
                    });
                    tokio::time::sleep(backoff).await;
                    retries += 1;
                }
                RecoveryAction::Abort => {
                    return Err(OrchestratorError::ModelUnavailable {
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }
            }
        }
    }

    /// 回合收尾：按结局提交（或不提交）草稿并生成响应
    async fn finalize(
        &self,
        session: &SessionView,
        user_text: &str,
        mut draft: TurnDraft,
        outcome: Result<(), OrchestratorError>,
    ) -> Result<TurnResponse, TurnFailure> {
        let session_id = session.id.as_str();

        let error = match outcome {
            Ok(()) => return self.commit_success(session, user_text, draft).await,
            Err(e) => e,
        };

        if error != OrchestratorError::Cancelled {
            draft.close_pending_calls();
        }
        draft.events.push(TurnEvent::Error {
            kind: error.kind(),
            detail: error.to_string(),
        });
        draft.transition(TurnState::Failed);

        if error == OrchestratorError::Cancelled {
            tracing::info!(session = %session_id, turn = draft.turn, "turn cancelled; nothing persisted");
            return Err(TurnFailure {
                session_id: session_id.to_string(),
                error,
                trail: draft.messages,
                states: draft.states,
                events: draft.events,
                agent_used: draft.agent,
                tools_invoked: draft.tools_invoked,
                guardrail_actions: draft.guardrail_actions,
            });
        }

        tracing::warn!(session = %session_id, turn = draft.turn, error = %error, "turn failed");
        let id = draft.msg_id();
        let mut err_msg = Message::system(id, error.to_string()).with_payload(MessagePayload::Error {
            kind: error.kind(),
            detail: error.to_string(),
        });
        err_msg.agent = draft.agent.clone();
        draft.messages.push(err_msg);

        let commit = TurnCommit {
            messages: draft.messages.clone(),
            status: SessionStatus::Error,
            ..Default::default()
        };
        let trail = match self.memory.commit_turn(session_id, commit).await {
            Ok(committed) => committed,
            Err(e) => {
                tracing::error!(session = %session_id, error = %e, "failed to persist failed turn");
                draft.messages
            }
        };
        Err(TurnFailure {
            session_id: session_id.to_string(),
            error,
            trail,
            states: draft.states,
            events: draft.events,
            agent_used: draft.agent,
            tools_invoked: draft.tools_invoked,
            guardrail_actions: draft.guardrail_actions,
        })
    }

    async fn commit_success(
        &self,
        session: &SessionView,
        user_text: &str,
        mut draft: TurnDraft,
    ) -> Result<TurnResponse, TurnFailure> {
        let session_id = session.id.as_str();
        let completed = draft.state == TurnState::Complete;

        let mut commit = TurnCommit {
            status: SessionStatus::Active,
            ..Default::default()
        };
        if completed {
            if let Some(agent) = &draft.agent {
                commit.active_agent = Some(agent.clone());
                commit
                    .session_records
                    .push(("active_agent".to_string(), agent.clone()));
            }
            commit
                .session_records
                .push(("last_tools".to_string(), draft.tool_names()));
            if let Some(pref) = parse_remember(user_text) {
                commit.long_term_records.push(pref);
            }
            for (key, _) in commit.session_records.iter().chain(&commit.long_term_records) {
                draft.events.push(TurnEvent::MemoryUpdate { key: key.clone() });
            }
        }
        commit.messages = draft.messages.clone();

        let committed = match self.memory.commit_turn(session_id, commit).await {
            Ok(c) => c,
            Err(e) => {
                let error = OrchestratorError::from(e);
                tracing::error!(session = %session_id, error = %error, "turn commit failed");
                draft.events.push(TurnEvent::Error {
                    kind: error.kind(),
                    detail: error.to_string(),
                });
                return Err(TurnFailure {
                    session_id: session_id.to_string(),
                    error,
                    trail: draft.messages,
                    states: draft.states,
                    events: draft.events,
                    agent_used: draft.agent,
                    tools_invoked: draft.tools_invoked,
                    guardrail_actions: draft.guardrail_actions,
                });
            }
        };

        let (text, outcome) = if completed {
            (draft.final_text.unwrap_or_default(), TurnOutcome::Completed)
        } else {
            (
                REFUSAL_TEXT.to_string(),
                TurnOutcome::Refused {
                    reason: draft
                        .refusal
                        .unwrap_or_else(|| "blocked by guardrail".to_string()),
                },
            )
        };

        tracing::info!(
            session = %session_id,
            turn = draft.turn,
            agent = draft.agent.as_deref().unwrap_or("-"),
            state = ?draft.state,
            kind = ?outcome.error_kind(),
            tools = draft.tools_invoked.len(),
            "turn finished"
        );

        Ok(TurnResponse {
            session_id: session_id.to_string(),
            text,
            outcome,
            agent_used: draft.agent,
            tools_invoked: draft.tools_invoked,
            guardrail_actions: draft.guardrail_actions,
            states: draft.states,
            events: draft.events,
            messages: committed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;
    use crate::memory::InMemoryStore;
    use crate::tools::{EchoTool, ToolRegistry};
    use serde_json::json;

    fn registry() -> AgentRegistry {
        AgentRegistry::load(
            vec![AgentDefinition::new("triage", "Route nutrition questions.").with_tools(["echo"])],
            "triage",
        )
        .unwrap()
    }

    async fn setup(model: ScriptedModel) -> (Orchestrator, Arc<ScriptedModel>, SessionId) {
        let model = Arc::new(model);
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        let memory: Arc<dyn MemoryStore> = Arc::new(InMemoryStore::new());
        let orch = Orchestrator::new(
            model.clone(),
            registry(),
            ToolDispatcher::new(tools, 1_000),
            memory,
        );
        let sid = orch.open_session("u1").await.unwrap();
        (orch, model, sid)
    }

    #[test]
    fn test_parse_remember() {
        assert_eq!(
            parse_remember("Remember: Diet Type = vegetarian"),
            Some(("diet_type".into(), "vegetarian".into()))
        );
        assert_eq!(
            parse_remember("remember: I hate cilantro"),
            Some(("note".into(), "I hate cilantro".into()))
        );
        assert_eq!(
            parse_remember("记住：goal = 减脂"),
            Some(("goal".into(), "减脂".into()))
        );
        assert_eq!(parse_remember("remember:"), None);
        assert_eq!(parse_remember("what should I remember?"), None);
    }

    #[tokio::test]
    async fn test_simple_turn_completes() {
        let (orch, model, sid) = setup(ScriptedModel::new().then(ModelOutput::text("Hi!"))).await;
        let resp = orch.handle_turn(&sid, "hello").await.unwrap();
        assert_eq!(resp.text, "Hi!");
        assert_eq!(resp.outcome, TurnOutcome::Completed);
        assert_eq!(resp.agent_used.as_deref(), Some("triage"));
        assert_eq!(resp.final_state(), Some(TurnState::Complete));
        assert_eq!(model.calls(), 1);
        assert_eq!(resp.messages.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(resp.messages[0].id, "msg-1-1");

        let view = orch.memory().get(&sid).await.unwrap();
        assert_eq!(view.active_agent.as_deref(), Some("triage"));
        assert_eq!(view.record("last_tools"), Some(""));
        assert_eq!(view.turn_counter, 1);
    }

    #[tokio::test]
    async fn test_tool_round_feeds_result_back() {
        let (orch, model, sid) = setup(
            ScriptedModel::new()
                .then(ModelOutput::tool("echo", json!({"text": "ping"})))
                .then(ModelOutput::text("pong")),
        )
        .await;
        let resp = orch.handle_turn(&sid, "ping me").await.unwrap();
        assert_eq!(resp.text, "pong");
        assert_eq!(resp.tools_invoked.len(), 1);
        assert_eq!(resp.tools_invoked[0].to_string(), "echo(success)");
        assert_eq!(resp.tools_invoked[0].call_id, "call-1-1");

        let second_call = &model.recorded()[1];
        let last = second_call.context.messages.last().unwrap();
        assert_eq!(last.tool_result().unwrap().payload, Some(json!({"echo": "ping"})));
        assert_eq!(second_call.tools, vec!["echo"]);
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let (orch, model, sid) = setup(ScriptedModel::new()).await;
        let err = orch.handle_turn(&sid, "   ").await.unwrap_err();
        assert_eq!(err.error, OrchestratorError::EmptyMessage);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_and_closed_sessions() {
        let (orch, _model, sid) = setup(ScriptedModel::new()).await;
        let err = orch.handle_turn("nope", "hi").await.unwrap_err();
        assert_eq!(err.error, OrchestratorError::SessionNotFound("nope".into()));

        orch.close_session(&sid).await.unwrap();
        let err = orch.handle_turn(&sid, "hi").await.unwrap_err();
        assert_eq!(err.error, OrchestratorError::SessionClosed(sid.clone()));
    }

    #[tokio::test]
    async fn test_remember_writes_long_term_record() {
        let (orch, _model, sid) = setup(ScriptedModel::new().then(ModelOutput::text("Noted."))).await;
        let resp = orch
            .handle_turn(&sid, "remember: diet = vegetarian")
            .await
            .unwrap();
        assert!(resp
            .events
            .contains(&TurnEvent::MemoryUpdate { key: "diet".into() }));
        let lt = orch.memory().get_long_term("u1").await;
        assert_eq!(lt[0].key, "diet");
        assert_eq!(lt[0].value, "vegetarian");
    }

    #[tokio::test]
    async fn test_undo_and_clear_history() {
        let (orch, _model, sid) = setup(ScriptedModel::new().repeat(ModelOutput::text("ok"))).await;
        orch.handle_turn(&sid, "one").await.unwrap();
        let popped = orch.undo_last(&sid).await.unwrap().unwrap();
        assert_eq!(popped.content, "ok");
        assert_eq!(orch.history(&sid, None).await.unwrap().len(), 1);

        orch.clear_history(&sid).await.unwrap();
        assert!(orch.history(&sid, None).await.unwrap().is_empty());
        let resp = orch.handle_turn(&sid, "two").await.unwrap();
        assert_eq!(resp.messages[0].seq, 1);
    }

    #[tokio::test]
    async fn test_swap_agents_falls_back_to_root() {
        let (orch, _model, sid) = setup(ScriptedModel::new().repeat(ModelOutput::text("ok"))).await;
        orch.handle_turn(&sid, "hi").await.unwrap();

        let next = AgentRegistry::load(
            vec![AgentDefinition::new("coach", "Coach.")],
            "coach",
        )
        .unwrap();
        orch.swap_agents(next);
        let resp = orch.handle_turn(&sid, "hi again").await.unwrap();
        assert_eq!(resp.agent_used.as_deref(), Some("coach"));
    }

    #[tokio::test]
    async fn test_cancel_without_turn_is_noop() {
        let (orch, _model, sid) = setup(ScriptedModel::new()).await;
        assert!(!orch.cancel_turn(&sid));
    }
}
