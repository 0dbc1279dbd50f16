//! Muse - 无头交互驱动
//!
//! 从 stdin 逐行读取：普通文本作为请求提交，斜杠命令操作澄清与计划。
//! 宿主执行器不在本进程中，动作只以 dry run 方式记录。

use anyhow::Context;
use muse::core::{Outcome, Phase, SceneObject, Snapshot};
use muse::{config, observability, OrchestratorBuilder, Orchestrator};
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "\
commands:
  <text>              submit a request
  /answer <text>      answer the pending clarification
  /approve <plan_id>  approve a proposed plan
  /reject <plan_id>   reject a proposed plan
  /run <plan_id>      execute an approved plan
  /cancel <plan_id>   cancel a plan
  /plans              list plans
  /scene <a,b,...>    set the objects of the scene snapshot
  /quit";

fn print_phase(phase: &Phase) {
    match phase {
        Phase::Done { outcome } => match outcome {
            Outcome::PlanProposed { plan } => {
                println!("{}", plan.preview());
                println!("(plan id: {}; /approve then /run, or /reject)", plan.id);
            }
            other => println!("{}", other.summary()),
        },
        Phase::Errored { kind, message } => println!("error [{:?}]: {}", kind, message),
        other => println!("[{}]", other.name()),
    }
}

async fn run_command(orch: &mut Orchestrator, scene: &mut Snapshot, line: &str) -> anyhow::Result<bool> {
    let (cmd, arg) = match line.split_once(' ') {
        Some((c, a)) => (c, a.trim()),
        None => (line, ""),
    };
    match cmd {
        "/quit" | "/exit" => return Ok(false),
        "/help" => println!("{}", HELP),
        "/answer" => {
            orch.answer_clarification(arg, scene.clone()).await?;
            print_phase(orch.wait().await);
        }
        "/approve" => {
            let receipt = orch.approve_plan(arg).await?;
            println!("plan {} is {}", receipt.plan_id, receipt.status());
        }
        "/reject" => {
            let receipt = orch.reject_plan(arg).await?;
            println!("plan {} is {}", receipt.plan_id, receipt.status());
        }
        "/run" => {
            orch.execute_plan(arg, scene.clone()).await?;
            print_phase(orch.wait().await);
        }
        "/cancel" if arg.is_empty() => println!("usage: /cancel <plan_id>"),
        "/cancel" => {
            let receipt = orch.cancel_plan(arg).await?;
            println!("plan {} is {}", receipt.plan_id, receipt.status());
        }
        "/plans" => {
            for plan in orch.planner().list().await {
                let (done, total) = plan.progress();
                println!("{}  {:<18} {}/{}  {}", plan.id, plan.status, done, total, plan.title);
            }
        }
        "/scene" => {
            let mut next = Snapshot::empty();
            for name in arg.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                next = next.with_object(SceneObject::new(name, "mesh"));
            }
            *scene = next;
            println!("{}", scene.summary());
        }
        _ => {
            orch.submit(line, scene.clone()).await?;
            print_phase(orch.wait().await);
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init_stderr();

    let cfg = config::load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        config::AppConfig::default()
    });
    let mut orch = OrchestratorBuilder::new(cfg)
        .with_persistence(true)
        .register_global(true)
        .build()
        .await
        .context("Failed to create orchestrator")?;

    println!("muse ready. /help for commands.");
    let mut scene = Snapshot::empty();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match run_command(&mut orch, &mut scene, line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("error: {:#}", e),
        }
    }

    if let Err(e) = orch.services().save_conversation().await {
        tracing::warn!("Failed to save conversation: {:#}", e);
    }
    muse::core::services::teardown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use muse::service::{MockAiService, MockExecutor};

    #[tokio::test]
    async fn test_cancel_requires_a_plan_id() {
        let mut orch = OrchestratorBuilder::new(config::AppConfig::default())
            .with_service(Arc::new(MockAiService::new()))
            .with_executor(Arc::new(MockExecutor::new()))
            .build()
            .await
            .unwrap();
        let mut scene = Snapshot::empty();
        assert!(run_command(&mut orch, &mut scene, "/cancel").await.unwrap());
        assert!(run_command(&mut orch, &mut scene, "/cancel plan_missing")
            .await
            .is_err());
        assert!(!HELP.contains("[plan_id]"));
    }
}
