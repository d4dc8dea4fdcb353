//! 护栏管线：输入/输出两个阶段，各自一组有序检查
//!
//! - 第一个 Block 立即终止该阶段
//! - Rewrite 依次串联（后一个检查看到前一个的改写结果），最后的改写生效
//! - 原始内容保留在裁决中用于审计

pub mod checks;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::GuardrailsSection;

pub use checks::{BlockedTermsCheck, ContactRedactionCheck, MaxLengthCheck, MedicalClaimCheck};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailStage {
    Input,
    Output,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailOutcome {
    Allow,
    Block,
    Rewrite,
}

/// 护栏裁决
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GuardrailVerdict {
    pub stage: GuardrailStage,
    pub outcome: GuardrailOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Rewrite 时的替换文本
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
    /// Block / Rewrite 时的原始内容
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<String>,
    /// 作出决定的检查名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
}

impl GuardrailVerdict {
    pub fn allow(stage: GuardrailStage) -> Self {
        Self {
            stage,
            outcome: GuardrailOutcome::Allow,
            reason: None,
            replacement: None,
            original: None,
            check: None,
        }
    }

    pub fn is_block(&self) -> bool {
        self.outcome == GuardrailOutcome::Block
    }

    pub fn is_rewrite(&self) -> bool {
        self.outcome == GuardrailOutcome::Rewrite
    }
}

/// 单个检查的结果
#[derive(Clone, Debug, PartialEq)]
pub enum CheckResult {
    Allow,
    Block { reason: String },
    Rewrite { content: String, reason: String },
}

/// 检查可见的上下文
#[derive(Clone, Copy, Debug)]
pub struct GuardrailContext<'a> {
    pub session_id: &'a str,
    pub user_id: &'a str,
    pub agent: Option<&'a str>,
}

/// 护栏检查：纯函数，不得有副作用
pub trait GuardrailCheck: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self, content: &str, ctx: &GuardrailContext<'_>) -> CheckResult;
}

#[derive(Error, Debug)]
pub enum GuardrailConfigError {
    #[error("Unknown guardrail check '{name}' for {stage:?} stage")]
    UnknownCheck { name: String, stage: GuardrailStage },

    #[error("Invalid guardrail pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

#[derive(Clone, Default)]
pub struct GuardrailPipeline {
    input: Vec<Arc<dyn GuardrailCheck>>,
    output: Vec<Arc<dyn GuardrailCheck>>,
}

impl GuardrailPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, check: impl GuardrailCheck + 'static) -> Self {
        self.input.push(Arc::new(check));
        self
    }

    pub fn with_output(mut self, check: impl GuardrailCheck + 'static) -> Self {
        self.output.push(Arc::new(check));
        self
    }

    /// 按配置中的检查名与顺序组装
    pub fn from_config(cfg: &GuardrailsSection) -> Result<Self, GuardrailConfigError> {
        let mut pipeline = Self::new();
        for name in &cfg.input_checks {
            let check = build_check(name, cfg, GuardrailStage::Input)?;
            pipeline.input.push(check);
        }
        for name in &cfg.output_checks {
            let check = build_check(name, cfg, GuardrailStage::Output)?;
            pipeline.output.push(check);
        }
        Ok(pipeline)
    }

    pub fn check_names(&self, stage: GuardrailStage) -> Vec<String> {
        self.checks(stage).iter().map(|c| c.name().to_string()).collect()
    }

    fn checks(&self, stage: GuardrailStage) -> &[Arc<dyn GuardrailCheck>] {
        match stage {
            GuardrailStage::Input => &self.input,
            GuardrailStage::Output => &self.output,
        }
    }

    pub fn evaluate(
        &self,
        stage: GuardrailStage,
        content: &str,
        ctx: &GuardrailContext<'_>,
    ) -> GuardrailVerdict {
        let mut current: Option<String> = None;
        let mut reasons: Vec<String> = Vec::new();
        let mut last_check: Option<String> = None;

        for check in self.checks(stage) {
            let seen = current.as_deref().unwrap_or(content);
            match check.check(seen, ctx) {
                CheckResult::Allow => {}
                CheckResult::Block { reason } => {
                    tracing::info!(
                        session = %ctx.session_id,
                        stage = ?stage,
                        check = %check.name(),
                        reason = %reason,
                        "guardrail block"
                    );
                    return GuardrailVerdict {
                        stage,
                        outcome: GuardrailOutcome::Block,
                        reason: Some(reason),
                        replacement: None,
                        original: Some(content.to_string()),
                        check: Some(check.name().to_string()),
                    };
                }
                CheckResult::Rewrite { content: rewritten, reason } => {
                    tracing::debug!(session = %ctx.session_id, check = %check.name(), "guardrail rewrite");
                    current = Some(rewritten);
                    reasons.push(reason);
                    last_check = Some(check.name().to_string());
                }
            }
        }

        match current {
            Some(replacement) => GuardrailVerdict {
                stage,
                outcome: GuardrailOutcome::Rewrite,
                reason: Some(reasons.join("; ")),
                replacement: Some(replacement),
                original: Some(content.to_string()),
                check: last_check,
            },
            None => GuardrailVerdict::allow(stage),
        }
    }
}

fn build_check(
    name: &str,
    cfg: &GuardrailsSection,
    stage: GuardrailStage,
) -> Result<Arc<dyn GuardrailCheck>, GuardrailConfigError> {
    let check: Arc<dyn GuardrailCheck> = match name {
        "max_length" => Arc::new(MaxLengthCheck::new(cfg.max_input_chars)),
        "blocked_terms" => Arc::new(BlockedTermsCheck::new(cfg.blocked_terms.clone())),
        "medical_claims" => Arc::new(MedicalClaimCheck::new(
            &cfg.claim_patterns,
            cfg.claim_notice.clone(),
        )?),
        "redact_contact" => Arc::new(ContactRedactionCheck::new()?),
        other => {
            return Err(GuardrailConfigError::UnknownCheck {
                name: other.to_string(),
                stage,
            })
        }
    };
    Ok(check)
}
