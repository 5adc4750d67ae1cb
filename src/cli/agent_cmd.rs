use anyhow::{Context, Result};
use console::style;
use serde_json::Value;

use super::runtime::Runtime;
use super::{flag_value, positional};
use crate::core::agent::AgentSpec;
use crate::core::store::types::{AgentRecord, DeploymentStatus, ExecutionStatus};
use crate::core::terminal::{GuideSection, print_error, print_info, print_success};

fn print_usage() {
    GuideSection::new("flowforge agent")
        .command("create", "Create and deploy an agent from a spec file")
        .command("list", "List an owner's agents")
        .command("show <id>", "Show one agent")
        .command("deploy <id>", "(Re)deploy an agent")
        .command("stop <id>", "Stop an agent and any running execution")
        .command("delete <id>", "Stop and remove an agent (history is kept)")
        .command("run <id>", "Execute an agent now")
        .command("executions <id>", "Recent executions, newest first")
        .command("logs <id>", "Lines logged by the agent's code")
        .command("memory <id>", "The agent's persisted memory (--set <json> replaces it)")
        .blank()
        .text("Options: --owner <id>  --spec <file.json>  --input <json>  --limit <n>")
        .blank()
        .hint("flowforge agent create --owner u1 --spec digest.json", "")
        .hint("flowforge agent run 3f2c... --input '{\"label\":\"inbox\"}'", "")
        .print();
    println!();
}

fn status_label(status: DeploymentStatus) -> String {
    match status {
        DeploymentStatus::Deployed => style("DEPLOYED").green().bold().to_string(),
        DeploymentStatus::Pending => style("PENDING").yellow().to_string(),
        DeploymentStatus::Stopped => style("STOPPED").dim().to_string(),
        DeploymentStatus::Error => style("ERROR").red().bold().to_string(),
    }
}

fn print_agent(agent: &AgentRecord) {
    let mut section = GuideSection::new(&format!("Agent · {}", agent.name))
        .status("Id", &agent.id)
        .status("Owner", &agent.owner_id)
        .status("Type", agent.agent_type.as_str())
        .status("Status", &status_label(agent.status));
    if let Some(message) = &agent.status_message {
        section = section.status("Status message", message);
    }
    if let Some(minutes) = agent.configuration.interval_minutes {
        section = section.status("Interval", &format!("{} min", minutes));
    }
    section
        .status("Capabilities", &agent.capabilities.join(", "))
        .status("Description", &agent.description)
        .status("Updated", &agent.updated_at)
        .print();
    println!();
}

fn parse_limit(args: &[String]) -> Result<Option<usize>> {
    flag_value(args, 3, &["--limit", "-n"])
        .map(|raw| {
            raw.parse::<usize>()
                .with_context(|| format!("--limit expects a number, got '{}'", raw))
        })
        .transpose()
}

fn require_id(args: &[String], sub_cmd: &str) -> Result<String> {
    positional(args, 3)
        .with_context(|| format!("usage: flowforge agent {} <agent_id>", sub_cmd))
}

fn require_owner(args: &[String]) -> Result<String> {
    flag_value(args, 3, &["--owner", "-o"]).context("--owner <id> is required")
}

pub async fn run_agent_command(args: &[String]) -> Result<()> {
    let sub_cmd = if args.len() > 2 { args[2].as_str() } else { "" };
    if !matches!(
        sub_cmd,
        "create"
            | "list"
            | "show"
            | "deploy"
            | "stop"
            | "delete"
            | "remove"
            | "run"
            | "executions"
            | "logs"
            | "memory"
    ) {
        print_usage();
        return Ok(());
    }

    let runtime = Runtime::open(true).await?;
    let manager = &runtime.manager;
    manager.vault().initialize().await?;

    match sub_cmd {
        "create" => {
            let owner = require_owner(args)?;
            let spec_path = flag_value(args, 3, &["--spec", "-s"]).context("--spec <file.json> is required")?;
            let raw = tokio::fs::read_to_string(&spec_path)
                .await
                .with_context(|| format!("could not read {}", spec_path))?;
            let spec: AgentSpec = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a valid agent spec", spec_path))?;

            let agent = manager.create_agent(&owner, spec).await?;
            print_success(&format!("Agent '{}' created and deployed.", agent.name));
            print_agent(&agent);
        }
        "list" => {
            let owner = require_owner(args)?;
            let agents = manager.list_agents(&owner).await?;
            if agents.is_empty() {
                GuideSection::new(&format!("Agents · {}", owner))
                    .text("No agents yet.")
                    .print();
            } else {
                let mut section = GuideSection::new(&format!("Agents · {}", owner));
                for agent in &agents {
                    section = section.status(
                        &agent.id,
                        &format!(
                            "{} [{}] {}",
                            agent.name,
                            agent.agent_type,
                            status_label(agent.status)
                        ),
                    );
                }
                section.print();
            }
            println!();
        }
        "show" => {
            let id = require_id(args, sub_cmd)?;
            print_agent(&manager.get_agent(&id).await?);
        }
        "deploy" => {
            let id = require_id(args, sub_cmd)?;
            let agent = manager.deploy_agent(&id).await?;
            print_success(&format!("Agent '{}' deployed.", agent.name));
            print_info("Timers only run inside `flowforge serve` with resume_on_start enabled.");
        }
        "stop" => {
            let id = require_id(args, sub_cmd)?;
            let agent = manager.stop_agent(&id).await?;
            print_success(&format!("Agent '{}' stopped.", agent.name));
        }
        "delete" | "remove" => {
            let id = require_id(args, sub_cmd)?;
            manager.delete_agent(&id).await?;
            print_success(&format!("Agent {} deleted. Its executions are kept.", id));
        }
        "run" => {
            let id = require_id(args, sub_cmd)?;
            let input: Value = match flag_value(args, 3, &["--input", "-i"]) {
                Some(raw) => serde_json::from_str(&raw).context("--input must be JSON")?,
                None => Value::Object(Default::default()),
            };
            match manager.execute_agent(&id, input).await {
                Ok(done) => {
                    print_success(&format!(
                        "Execution {} finished in {}ms",
                        done.execution_id, done.execution_time_ms
                    ));
                    println!("{}", serde_json::to_string_pretty(&done.data)?);
                }
                Err(e) if e.is_execution_class() => {
                    print_error(&format!("{}", e));
                    std::process::exit(2);
                }
                Err(e) => return Err(e.into()),
            }
        }
        "executions" => {
            let id = require_id(args, sub_cmd)?;
            let executions = manager.list_executions(&id, parse_limit(args)?).await?;
            let mut section = GuideSection::new(&format!("Executions · {}", id));
            if executions.is_empty() {
                section = section.text("No executions yet.");
            }
            for execution in &executions {
                let status = match execution.status {
                    ExecutionStatus::Success => style("SUCCESS").green().to_string(),
                    ExecutionStatus::Error => style("ERROR").red().to_string(),
                    ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
                };
                let detail = match (&execution.error_message, execution.execution_time_ms) {
                    (Some(message), _) => message.clone(),
                    (None, Some(ms)) => format!("{}ms", ms),
                    (None, None) => String::new(),
                };
                section = section.status(
                    &execution.id,
                    &format!(
                        "{} {} {} {}",
                        execution.started_at, execution.trigger_type, status, detail
                    ),
                );
            }
            section.print();
            println!();
        }
        "logs" => {
            let id = require_id(args, sub_cmd)?;
            let logs = manager.list_logs(&id, parse_limit(args)?).await?;
            if logs.is_empty() {
                print_info("No log lines recorded.");
            }
            for line in &logs {
                match &line.data {
                    Some(data) => println!("{} {} {}", style(&line.created_at).dim(), line.message, data),
                    None => println!("{} {}", style(&line.created_at).dim(), line.message),
                }
            }
        }
        "memory" => {
            let id = require_id(args, sub_cmd)?;
            manager.get_agent(&id).await?;
            if let Some(raw) = flag_value(args, 3, &["--set"]) {
                let blob: Value = serde_json::from_str(&raw).context("--set must be JSON")?;
                manager.set_memory(&id, &blob).await?;
                print_success("Memory replaced.");
            }
            println!("{}", serde_json::to_string_pretty(&manager.get_memory(&id).await?)?);
        }
        _ => print_usage(),
    }
    Ok(())
}
