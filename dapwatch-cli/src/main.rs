//! dapwatch CLI - コマンドラインインターフェース
//!
//! ウォッチポイント層を `setDataBreakpoints` 形式の JSON で操作する REPL です。

use anyhow::Result;
use clap::{Parser, Subcommand};
use dapwatch_core::error::ERR_WATCHPOINT_NOT_FOUND;
use dapwatch_core::parse::format_data_id;
use dapwatch_core::protocol::{data_breakpoint_info, DataBreakpointInfoArguments};
use dapwatch_core::{Command, Location, LocationId, Session, SessionStop, StopReason};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use serde_json::{json, Map, Value};
use std::path::Path;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// dapwatch - hardware watchpoints driven by DAP data breakpoint requests
#[derive(Parser)]
#[command(name = "dapwatch")]
#[command(version = "0.1.0")]
#[command(about = "Data breakpoint (watchpoint) layer for a debug adapter", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: DebugCommand,
}

#[derive(Subcommand)]
enum DebugCommand {
    /// Launch and debug an executable
    Run {
        /// Path to the executable binary
        binary: String,

        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Attach to an existing process
    Attach {
        /// Path to the executable binary
        binary: String,

        /// Process ID to attach to
        #[arg(short, long)]
        pid: i32,
    },
}

/// クライアント側で保持するデータブレークポイントの一覧
///
/// DAP クライアントと同じく、変更のたびに一覧全体を送り直します。
struct Repl {
    session: Session,
    /// 送信する記述子（送信順）
    entries: Vec<Map<String, Value>>,
    /// 直前の応答で各記述子に割り当てられた ID
    ids: Vec<LocationId>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    println!("dapwatch - data breakpoint layer");
    println!("Version 0.1.0");
    println!();

    let mut repl = init_session(cli.command)?;
    run_repl(&mut repl)?;

    Ok(())
}

/// ログ出力を初期化する（`RUST_LOG` が無ければ warn）
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// セッションを初期化してプロセスにアタッチまたは起動する
fn init_session(command: DebugCommand) -> Result<Repl> {
    let mut repl = Repl {
        session: Session::new(),
        entries: Vec::new(),
        ids: Vec::new(),
    };

    match command {
        DebugCommand::Run { binary, args } => {
            repl.session.spawn(&binary, &args)?;
            let pid = repl.session.pid().unwrap_or_default();
            println!("Process {} ({}) spawned and stopped at first instruction", pid, binary);
            println!("Set watchpoints and use 'continue' to continue execution");
            println!();
        }
        DebugCommand::Attach { binary, pid } => {
            println!("Attaching to process: {} ({})", pid, binary);
            check_attached_binary(pid, Path::new(&binary));
            let adopted = repl.session.attach(pid)?;
            println!("Attached to process {}", pid);

            // 既存のウォッチを一覧に取り込み、次の送信で解放されないようにする
            for id in adopted {
                let Some(spec) = repl.session.manager().get(id).and_then(|wp| wp.spec()) else {
                    continue;
                };
                let mut entry = Map::new();
                entry.insert("dataId".to_string(), json!(format_data_id(spec.address, spec.size)));
                entry.insert("accessType".to_string(), json!(spec.access.as_str()));
                repl.entries.push(entry);
                repl.ids.push(id);
                println!("Adopted existing watch as watchpoint {}", id);
            }
            println!();
        }
    }

    Ok(repl)
}

/// アタッチ先が指定されたバイナリを実行しているか確認する（違えば警告のみ）
fn check_attached_binary(pid: i32, binary: &Path) {
    let running = match std::fs::read_link(format!("/proc/{}/exe", pid)) {
        Ok(path) => path,
        Err(e) => {
            debug!("cannot read executable of pid {}: {}", pid, e);
            return;
        }
    };
    match binary.canonicalize() {
        Ok(expected) if expected == running => {}
        Ok(expected) => warn!(
            "pid {} is running {}, not {}",
            pid,
            running.display(),
            expected.display()
        ),
        Err(e) => warn!("cannot resolve {}: {}", binary.display(), e),
    }
}

/// REPLループを実行する
fn run_repl(repl: &mut Repl) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline("(dapwatch) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                match handle_command(repl, line) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("Error: {:#}", e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

/// コマンドを処理する。`false` を返したら REPL を終了する
fn handle_command(repl: &mut Repl, line: &str) -> Result<bool> {
    let Some(command) = Command::parse(line) else {
        println!("Unknown command: {}", line);
        println!("Type 'help' for available commands.");
        return Ok(true);
    };

    match command {
        Command::Help => print_help(),
        Command::Quit => {
            println!("Goodbye!");
            return Ok(false);
        }
        Command::Watch { data_id, access } => {
            let mut entry = Map::new();
            entry.insert("dataId".to_string(), json!(data_id));
            entry.insert("accessType".to_string(), json!(access));
            let mut entries = repl.entries.clone();
            entries.push(entry);
            submit(repl, entries)?;
        }
        Command::Condition { id, expr } => set_field(repl, id, "condition", expr)?,
        Command::HitCondition { id, expr } => set_field(repl, id, "hitCondition", expr)?,
        Command::LogMessage { id, message } => set_field(repl, id, "logMessage", message)?,
        Command::Delete(id) => {
            let index = entry_index(repl, id)?;
            let mut entries = repl.entries.clone();
            entries.remove(index);
            submit(repl, entries)?;
            println!("Watchpoint {} deleted", id);
        }
        Command::List => handle_list(repl),
        Command::Info(name) => {
            let response = data_breakpoint_info(&DataBreakpointInfoArguments { name, bytes: None });
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Continue => handle_continue(repl)?,
    }

    Ok(true)
}

/// ID から一覧上の位置を探す
fn entry_index(repl: &Repl, id: LocationId) -> Result<usize> {
    repl.ids
        .iter()
        .position(|&known| known == id)
        .ok_or_else(|| anyhow::anyhow!("{}: {}", ERR_WATCHPOINT_NOT_FOUND, id))
}

/// 記述子のフィールドを更新して送り直す
fn set_field(repl: &mut Repl, id: LocationId, key: &str, value: Option<String>) -> Result<()> {
    let index = entry_index(repl, id)?;
    let mut entries = repl.entries.clone();
    match value {
        Some(value) => entries[index].insert(key.to_string(), json!(value)),
        None => entries[index].remove(key),
    };
    submit(repl, entries)
}

/// 新しい一覧全体を `setDataBreakpoints` として送り、応答を表示する
///
/// 送信に失敗した場合、手元の一覧は変更しません。
fn submit(repl: &mut Repl, entries: Vec<Map<String, Value>>) -> Result<()> {
    debug!("submitting {} data breakpoint(s)", entries.len());
    let arguments = json!({ "breakpoints": entries });
    let body = match repl.session.set_data_breakpoints(&arguments) {
        Ok(body) => body,
        Err(e) => {
            warn!("setDataBreakpoints failed: {:#}", e);
            return Err(e);
        }
    };

    repl.entries = entries;
    repl.ids = body["breakpoints"]
        .as_array()
        .map(|items| items.iter().filter_map(|bp| bp["id"].as_u64()).collect())
        .unwrap_or_default();

    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

/// List コマンドを処理する
fn handle_list(repl: &Repl) {
    if repl.entries.is_empty() {
        println!("No watchpoints");
        return;
    }

    for (entry, id) in repl.entries.iter().zip(&repl.ids) {
        let target = entry
            .get("dataId")
            .and_then(Value::as_str)
            .unwrap_or("<no dataId>");
        let access = entry
            .get("accessType")
            .and_then(Value::as_str)
            .unwrap_or("?");

        match repl.session.manager().get(*id) {
            Some(wp) if wp.is_verified() => {
                println!("  {}. {} ({}) [{:?}]", id, target, access, wp.state());
            }
            Some(wp) => {
                let message = wp.message().unwrap_or_default();
                println!("  {}. {} ({}) [{:?}] {}", id, target, access, wp.state(), message);
            }
            None => println!("  {}. {} ({}) [rejected]", id, target, access),
        }
    }
}

/// Continue コマンドを処理する
fn handle_continue(repl: &mut Repl) -> Result<()> {
    println!("Continuing execution...");

    let outcome = repl.session.continue_and_wait(evaluate_literal)?;

    for (id, message) in &outcome.logs {
        println!("[watchpoint {}] {}", id, message);
    }

    println!();
    match outcome.stop {
        SessionStop::Watchpoint { id, pc } => {
            println!("Watchpoint {} hit!", id);
            println!("Stopped at 0x{:x}", pc);
            if let Some(wp) = repl.session.manager().get(id) {
                println!("{}", Value::Object(wp.to_json()));
            }
        }
        SessionStop::Target(StopReason::Signal(signal)) => {
            println!("Received signal: {:?}", signal);
        }
        SessionStop::Target(StopReason::Exited(code)) => {
            println!("Process exited with code {}", code);
        }
        SessionStop::Target(StopReason::Trap) => {
            println!("Process stopped (trap without a watch hit)");
        }
        SessionStop::Target(StopReason::Other) => {
            println!("Process stopped (unknown reason)");
        }
    }

    Ok(())
}

/// 条件式とログメッセージの評価
///
/// 式の評価器は持たないので、整数と真偽値のリテラルだけを受け付けます。
fn evaluate_literal(expr: &str) -> std::result::Result<String, String> {
    let expr = expr.trim();
    if expr == "true" || expr == "false" {
        return Ok(expr.to_string());
    }
    if let Ok(value) = expr.parse::<i64>() {
        return Ok(value.to_string());
    }
    if let Some(hex) = expr.strip_prefix("0x") {
        if let Ok(value) = u64::from_str_radix(hex, 16) {
            return Ok(value.to_string());
        }
    }
    Err(format!("cannot evaluate '{}'", expr))
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help                         - Show this help message");
    println!("  quit/exit/q                  - Exit the debugger");
    println!();
    println!("Watchpoint commands:");
    println!("  watch <addr>/<size> [mode]   - Watch a memory region (mode: read, write, readWrite)");
    println!("  watch <addr> <size> [mode]   - Same as above");
    println!("  cond <id> [expr]             - Set or clear a condition");
    println!("  hit <id> [rule]              - Set or clear a hit condition (e.g. '>= 3', '% 2')");
    println!("  log <id> [message]           - Turn a watchpoint into a logpoint ('{{expr}}' is interpolated)");
    println!("  delete <id>                  - Delete a watchpoint");
    println!("  list (ls)                    - List watchpoints");
    println!("  info <addr>[/<size>]         - Show the dataId for an address");
    println!("  continue (c)                 - Continue execution");
    println!();
    println!("Examples:");
    println!("  watch 0x404028/4 write");
    println!("  hit 1 % 10");
    println!("  log 1 counter changed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_repl() -> Repl {
        Repl {
            session: Session::new(),
            entries: Vec::new(),
            ids: Vec::new(),
        }
    }

    #[test]
    fn test_failed_submit_keeps_list() {
        let mut repl = detached_repl();
        assert!(handle_command(&mut repl, "watch 0x1000/4 write").is_err());
        assert!(repl.entries.is_empty());
        assert!(repl.ids.is_empty());
    }

    #[test]
    fn test_unknown_id_is_rejected() {
        let mut repl = detached_repl();
        let err = handle_command(&mut repl, "cond 7 x > 1").unwrap_err();
        assert!(err.to_string().contains(ERR_WATCHPOINT_NOT_FOUND));
        assert!(handle_command(&mut repl, "delete 7").is_err());
    }

    #[test]
    fn test_evaluate_literal() {
        assert_eq!(evaluate_literal(" 42 "), Ok("42".to_string()));
        assert_eq!(evaluate_literal("0x10"), Ok("16".to_string()));
        assert_eq!(evaluate_literal("false"), Ok("false".to_string()));
        assert!(evaluate_literal("counter").is_err());
    }
}
