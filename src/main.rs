//! Nutri - 营养助手命令行
//!
//! 入口：初始化日志、按配置构建编排器，并运行交互式 REPL。
//! 命令：`/history`、`/undo`、`/clear`、`/agents`、`/quit`；其余输入作为一个回合。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use nutri::core::{create_builder, spawn_session_reaper, TurnOutcome};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    nutri::observability::init();

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let builder = create_builder(config_path);
    let ttl = Duration::from_secs(builder.config().memory.session_ttl_secs.max(1));
    let orchestrator = Arc::new(builder.build().await.context("Failed to build orchestrator")?);
    let _reaper = spawn_session_reaper(orchestrator.clone(), ttl, ttl / 4);

    let user_id = std::env::var("NUTRI_USER").unwrap_or_else(|_| "local".to_string());
    let session = orchestrator
        .open_session(&user_id)
        .await
        .context("Failed to open session")?;
    println!("nutri ready (session {}). Type /quit to exit.", session);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let input = line.trim();
        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/history" => {
                for m in orchestrator.history(&session, None).await? {
                    println!("#{:<3} {:?} {}", m.seq, m.role, m.content);
                }
            }
            "/undo" => match orchestrator.undo_last(&session).await? {
                Some(m) => println!("removed #{}", m.seq),
                None => println!("nothing to undo"),
            },
            "/clear" => {
                orchestrator.clear_history(&session).await?;
                println!("history cleared");
            }
            "/agents" => {
                let agents = orchestrator.agents();
                for name in agents.names() {
                    let marker = if name == agents.root_name() { "*" } else { " " };
                    println!("{} {}", marker, name);
                }
            }
            _ => match run_turn(&orchestrator, &session, input).await {
                Ok(resp) => {
                    let agent = resp.agent_used.as_deref().unwrap_or("-");
                    match &resp.outcome {
                        TurnOutcome::Refused { reason } => {
                            println!("[{}] {} ({})", agent, resp.text, reason)
                        }
                        _ => println!("[{}] {}", agent, resp.text),
                    }
                    for t in &resp.tools_invoked {
                        println!("  tool: {}", t);
                    }
                }
                Err(failure) => {
                    tracing::warn!(kind = ?failure.kind(), "turn failed");
                    println!("error: {}", failure.error);
                }
            },
        }
    }

    orchestrator
        .close_session(&session)
        .await
        .context("Failed to close session")?;
    Ok(())
}

/// 执行一个回合；回合进行中按 Ctrl-C 取消该回合（不落库）
async fn run_turn(
    orchestrator: &nutri::Orchestrator,
    session: &str,
    input: &str,
) -> Result<nutri::TurnResponse, nutri::TurnFailure> {
    let turn = orchestrator.handle_turn(session, input);
    tokio::pin!(turn);
    tokio::select! {
        r = &mut turn => r,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.cancel_turn(session);
            turn.await
        }
    }
}
