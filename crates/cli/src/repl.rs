//! Interactive chat loop with inline tool-call confirmation.

use std::collections::BTreeMap;
use std::sync::Arc;

use agent::{ChatReply, HistoryEntry, PendingConfirmation, QueuedChannel, SessionManager, ToolDescriptor};
use proto::{AgentId, ConfirmationDecision, PendingToolCall, ServerConfig};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin, Stdout};
use tracing::{debug, info};

use crate::logs::{LogBuffer, LogEntry};

const PROMPT: &str = "toolgate> ";
const DECISION_PROMPT: &str =
    "[y] approve once  [a] always confirm  [n] reject once  [r] always reject > ";

/// A slash command typed at the REPL prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Tools,
    Servers,
    History,
    Clear,
    Logs,
    Set {
        server: String,
        function: Option<String>,
        flag: String,
        value: Value,
    },
    Quit,
    /// Recognised as a command but malformed; carries the message to show.
    Invalid(String),
}

impl ReplCommand {
    /// Parses a slash command. Returns `None` for ordinary chat input.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if !line.starts_with('/') {
            return None;
        }
        let mut parts = line.split_whitespace();
        let head = parts.next().unwrap_or_default();
        let rest: Vec<&str> = parts.collect();

        let command = match head {
            "/tools" => Self::Tools,
            "/servers" => Self::Servers,
            "/history" => Self::History,
            "/clear" => Self::Clear,
            "/logs" => Self::Logs,
            "/quit" | "/exit" => Self::Quit,
            "/set" => match rest.as_slice() {
                [server, flag, value] => Self::Set {
                    server: server.to_string(),
                    function: None,
                    flag: flag.to_string(),
                    value: parse_flag_value(value),
                },
                [server, function, flag, value] => Self::Set {
                    server: server.to_string(),
                    function: Some(function.to_string()),
                    flag: flag.to_string(),
                    value: parse_flag_value(value),
                },
                _ => Self::Invalid("Usage: /set <server> [function] <flag> <value>".to_string()),
            },
            other => Self::Invalid(format!(
                "Unknown command '{other}'. Commands: /tools /servers /history /clear /logs /set /quit"
            )),
        };
        Some(command)
    }
}

/// JSON when it parses (`true`, `"always_confirmed"`), otherwise the raw text as a string.
pub fn parse_flag_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Maps a confirmation keystroke to a decision.
pub fn parse_decision(input: &str) -> Option<ConfirmationDecision> {
    match input.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(ConfirmationDecision::ApproveOnce),
        "a" | "always" => Some(ConfirmationDecision::AlwaysConfirm),
        "n" | "no" => Some(ConfirmationDecision::RejectOnce),
        "r" | "never" => Some(ConfirmationDecision::AlwaysReject),
        _ => None,
    }
}

/// Trims an input line and drops empty lines.
fn normalize_input_line(raw: &str) -> Option<String> {
    let line = raw.trim();
    if line.is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

pub fn format_confirmation(call: &PendingToolCall) -> String {
    let mut out = format!("\nThe assistant wants to call '{}'", call.name);
    if let Some(description) = call.description.as_deref().filter(|d| !d.is_empty()) {
        out.push_str(&format!(" ({description})"));
    }
    out.push_str(&format!("\n  arguments: {}\n", call.arguments));
    out
}

pub fn format_reply(reply: &ChatReply) -> String {
    let mut out = String::new();
    for text in &reply.replies {
        out.push_str(text);
        out.push('\n');
    }
    out.push_str(&format!("(tokens used: {})\n", reply.tokens_used));
    out
}

pub fn format_tools(tools: &[ToolDescriptor]) -> String {
    if tools.is_empty() {
        return "No tools available.\n".to_string();
    }
    tools
        .iter()
        .map(|tool| {
            format!(
                "{} [{}] {}\n",
                tool.name(),
                tool.provider.name,
                tool.definition.description
            )
        })
        .collect()
}

pub fn format_servers(servers: &BTreeMap<String, ServerConfig>) -> String {
    if servers.is_empty() {
        return "No servers configured.\n".to_string();
    }
    let mut out = String::new();
    for (name, server) in servers {
        let state = if server.allowed { "allowed" } else { "disallowed" };
        out.push_str(&format!(
            "{name} ({state}): {} {}\n",
            server.command,
            server.args.join(" ")
        ));
        for (function, policy) in server.functions.iter().flatten() {
            let state = if policy.allowed { "allowed" } else { "disallowed" };
            out.push_str(&format!(
                "  {function} ({state}, {})\n",
                policy.confirmed
            ));
        }
    }
    out
}

pub fn format_history(history: &[HistoryEntry]) -> String {
    if history.is_empty() {
        return "History is empty.\n".to_string();
    }
    history
        .iter()
        .map(|entry| format!("{}: {}\n", entry.role, entry.content))
        .collect()
}

fn format_logs(entries: &[LogEntry]) -> String {
    if entries.is_empty() {
        return "No new log entries.\n".to_string();
    }
    entries
        .iter()
        .map(|e| format!("{} [{}] {}\n", e.time, e.level, e.message))
        .collect()
}

async fn write_out(stdout: &mut Stdout, text: &str) -> std::io::Result<()> {
    stdout.write_all(text.as_bytes()).await?;
    stdout.flush().await
}

/// Reads keystrokes until a valid decision. `None` means stdin closed.
async fn read_decision(
    lines: &mut Lines<BufReader<Stdin>>,
    stdout: &mut Stdout,
    call: &PendingToolCall,
) -> std::io::Result<Option<ConfirmationDecision>> {
    write_out(stdout, &format_confirmation(call)).await?;
    loop {
        write_out(stdout, DECISION_PROMPT).await?;
        let Some(line) = lines.next_line().await? else {
            return Ok(None);
        };
        if let Some(decision) = parse_decision(&line) {
            return Ok(Some(decision));
        }
    }
}

async fn run_command(
    manager: &SessionManager,
    agent: &AgentId,
    logs: &LogBuffer,
    command: ReplCommand,
) -> anyhow::Result<String> {
    let mut session = manager.lock_session(agent).await?;
    let output = match command {
        ReplCommand::Tools => format_tools(&session.list_available_tools()),
        ReplCommand::Servers => format_servers(session.servers()),
        ReplCommand::History => format_history(&session.history()),
        ReplCommand::Clear => {
            session.clear_history();
            "History cleared.\n".to_string()
        }
        ReplCommand::Logs => format_logs(&logs.take()),
        ReplCommand::Set {
            server,
            function,
            flag,
            value,
        } => match session.update_policy_flag(&server, function.as_deref(), &flag, &value) {
            Ok(()) => "Updated.\n".to_string(),
            Err(e) => format!("Error: {e}\n"),
        },
        ReplCommand::Invalid(message) => format!("{message}\n"),
        ReplCommand::Quit => String::new(),
    };
    Ok(output)
}

/// Runs the REPL until `/quit` or end of input.
///
/// While a turn is in flight, confirmation requests from the gate are
/// answered from the same stdin. Closing stdin mid-prompt rejects the call.
pub async fn run(
    manager: Arc<SessionManager>,
    agent: AgentId,
    logs: LogBuffer,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let (channel, mut pending_rx) = QueuedChannel::new();

    info!(agent = %agent, "REPL started");
    write_out(
        &mut stdout,
        &format!("Chatting as agent '{agent}'. Type /quit to exit.\n"),
    )
    .await?;

    loop {
        write_out(&mut stdout, PROMPT).await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let Some(line) = normalize_input_line(&line) else {
            continue;
        };

        if let Some(command) = ReplCommand::parse(&line) {
            if command == ReplCommand::Quit {
                break;
            }
            debug!(command = %line, "Slash command dispatched");
            let output = run_command(&manager, &agent, &logs, command).await?;
            write_out(&mut stdout, &output).await?;
            continue;
        }

        let turn = manager.chat(&agent, &line, Some(&channel));
        tokio::pin!(turn);
        let result = loop {
            tokio::select! {
                result = &mut turn => break result,
                Some(PendingConfirmation { request, reply_tx }) = pending_rx.recv() => {
                    // Dropping reply_tx on end of input reads as a rejection.
                    if let Some(decision) = read_decision(&mut lines, &mut stdout, &request).await? {
                        let _ = reply_tx.send(decision);
                    }
                }
            }
        };

        let output = match result {
            Ok(reply) => format_reply(&reply),
            Err(e) => format!("Error: {e}\n"),
        };
        write_out(&mut stdout, &output).await?;
    }

    manager.shutdown().await;
    info!(agent = %agent, "REPL stopped");
    Ok(())
}
