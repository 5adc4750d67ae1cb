mod agent_cmd;
mod credential_cmd;
mod runtime;
mod serve;

use anyhow::Result;
use console::style;

use crate::core::terminal::{self, GuideSection, print_error};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Core")
        .command("serve", "Run the agent coordinator until Ctrl+C")
        .print();

    GuideSection::new("Management")
        .command("agent", "Create, run and inspect agents")
        .command("credential", "Seed per-user service credentials")
        .print();

    println!(
        "\n {} {} <command> [subcommand]\n",
        style("Usage:").bold(),
        style("flowforge").green()
    );
}

/// Value following the first occurrence of any of `names`, searching from `start`.
pub(crate) fn flag_value(args: &[String], start: usize, names: &[&str]) -> Option<String> {
    let mut i = start;
    while i < args.len() {
        if names.contains(&args[i].as_str()) {
            if i + 1 < args.len() {
                return Some(args[i + 1].clone());
            }
            return None;
        }
        i += 1;
    }
    None
}

/// First argument from `start` that is neither a flag nor a flag's value.
pub(crate) fn positional(args: &[String], start: usize) -> Option<String> {
    let mut i = start;
    while i < args.len() {
        if args[i].starts_with('-') {
            i += 2;
        } else {
            return Some(args[i].clone());
        }
    }
    None
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        let cmd = args[1].as_str();
        match cmd {
            "serve" => serve::run_serve().await,
            "agent" | "agents" => agent_cmd::run_agent_command(&args).await,
            "credential" | "credentials" => credential_cmd::run_credential_command(&args).await,
            "help" | "--help" | "-h" => {
                print_help();
                Ok(())
            }
            _ => {
                print_error(&format!("Unknown command: {}", cmd));
                print_help();
                Ok(())
            }
        }
    } else {
        print_help();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{flag_value, positional};

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn flag_value_reads_any_alias() {
        let args = argv(&["flowforge", "agent", "create", "-o", "u1", "--spec", "a.json"]);
        assert_eq!(flag_value(&args, 3, &["--owner", "-o"]), Some("u1".into()));
        assert_eq!(flag_value(&args, 3, &["--spec"]), Some("a.json".into()));
        assert_eq!(flag_value(&args, 3, &["--input"]), None);
    }

    #[test]
    fn dangling_flag_has_no_value() {
        let args = argv(&["flowforge", "agent", "executions", "a1", "--limit"]);
        assert_eq!(flag_value(&args, 3, &["--limit"]), None);
    }

    #[test]
    fn positional_skips_flags_and_their_values() {
        let args = argv(&["flowforge", "agent", "run", "--input", "{}", "a1"]);
        assert_eq!(positional(&args, 3), Some("a1".into()));
        let args = argv(&["flowforge", "agent", "run", "a1", "--input", "{}"]);
        assert_eq!(positional(&args, 3), Some("a1".into()));
        let args = argv(&["flowforge", "agent", "run"]);
        assert_eq!(positional(&args, 3), None);
    }
}
