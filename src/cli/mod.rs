//! Interactive front end
//!
//! Starts one session, then reads commands from stdin and prints results.
//! Notifications are printed as they arrive, independent of the prompt.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;

use crate::commands::{split_words, Cli, ReplCommand, ReplLine};
use crate::common::config::Config;
use crate::common::{paths, Error, Result};
use crate::dap::types::{Scope, StackFrame, Variable};
use crate::session::{
    AttachTarget, AttachTo, BreakpointEntry, BreakpointLocation, BreakpointSpec, BreakpointUnit,
    LaunchTarget, LocalPortAllocator, Notification, SessionHandle, SessionManager, SessionStatus,
    StepKind, ThreadInfo, Watch,
};

const PROMPT: &str = "(dap) ";

/// Run the debugger until the user quits
pub async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let handle = SessionManager::spawn(config, Arc::new(LocalPortAllocator));
    let store = paths::breakpoint_store(&std::env::current_dir()?);

    let loaded = handle.load_breakpoints(store.clone()).await?;
    if loaded > 0 {
        println!("Loaded {} breakpoint(s) from {}", loaded, store.display());
    }
    for location in &cli.breakpoints {
        let spec = BreakpointSpec::new(BreakpointLocation::parse(location)?);
        match handle.add_breakpoint(spec).await {
            Ok(id) => println!("Breakpoint {} at {}", id, location),
            Err(Error::DuplicateBreakpoint { .. }) => {}
            Err(e) => return Err(e),
        }
    }

    let printer = tokio::spawn(print_notifications(handle.subscribe()));

    let started = match (cli.attach, cli.program) {
        (Some(pid), _) => {
            handle
                .attach(AttachTarget {
                    to: AttachTo::Pid(pid),
                    adapter: cli.adapter,
                })
                .await
        }
        (None, Some(program)) => {
            let program = program.canonicalize().unwrap_or(program);
            handle
                .launch(LaunchTarget {
                    args: cli.args,
                    cwd: cli.cwd,
                    stop_on_entry: cli.stop_on_entry,
                    adapter: cli.adapter,
                    ..LaunchTarget::new(program)
                })
                .await
        }
        (None, None) => Err(Error::Config("no program to launch".to_string())),
    };
    match started {
        Ok(id) => println!("Session {} started. Type 'help' for commands.", id),
        Err(e) => eprintln!("{} {}", "error:".red().bold(), e),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(PROMPT.as_bytes()).await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let words = split_words(&line);
        if words.is_empty() {
            continue;
        }

        let command = match ReplLine::try_parse_from(words) {
            Ok(parsed) => parsed.command,
            Err(e) => {
                // Covers `help` as well as usage errors
                println!("{}", e.render());
                continue;
            }
        };
        if command == ReplCommand::Quit {
            break;
        }
        if let Err(e) = execute(&handle, command, &store).await {
            eprintln!("{} {}", "error:".red().bold(), e);
        }
    }

    if let Err(e) = handle.save_breakpoints(store.clone()).await {
        tracing::warn!("Could not save breakpoints to {}: {}", store.display(), e);
    }
    handle.shutdown().await?;
    printer.abort();
    Ok(())
}

async fn execute(handle: &SessionHandle, command: ReplCommand, store: &Path) -> Result<()> {
    match command {
        ReplCommand::Break {
            location,
            condition,
            hit,
            log,
        } => {
            let mut spec = BreakpointSpec::new(BreakpointLocation::parse(&location)?);
            if let Some(condition) = condition {
                spec = spec.with_condition(condition);
            }
            if let Some(hit) = hit {
                spec = spec.with_hit_condition(hit);
            }
            if let Some(log) = log {
                spec = spec.with_log_message(log);
            }
            let id = handle.add_breakpoint(spec).await?;
            println!("Breakpoint {} at {}", id, location);
        }
        ReplCommand::Delete { id } => {
            handle.remove_breakpoint(id).await?;
            println!("Breakpoint {} deleted", id);
        }
        ReplCommand::Close { file } => {
            let removed = handle.close_unit(BreakpointUnit::Source(file.clone())).await?;
            println!("Deleted {} breakpoint(s) in {}", removed.len(), file.display());
        }
        ReplCommand::Enable { id: Some(id) } => handle.enable_breakpoint(id, true).await?,
        ReplCommand::Enable { id: None } => handle.enable_all_breakpoints(true).await?,
        ReplCommand::Disable { id: Some(id) } => handle.enable_breakpoint(id, false).await?,
        ReplCommand::Disable { id: None } => handle.enable_all_breakpoints(false).await?,
        ReplCommand::Breakpoints => print_breakpoints(&handle.breakpoints(None).await?),
        ReplCommand::Save { path } => {
            let path = path.unwrap_or_else(|| store.to_path_buf());
            handle.save_breakpoints(path.clone()).await?;
            println!("Breakpoints saved to {}", path.display());
        }
        ReplCommand::Load { path } => {
            let path = path.unwrap_or_else(|| store.to_path_buf());
            let count = handle.load_breakpoints(path).await?;
            println!("Loaded {} breakpoint(s)", count);
        }

        ReplCommand::Continue => handle.continue_execution(None).await?,
        ReplCommand::Next => handle.step(StepKind::Over, None).await?,
        ReplCommand::Step => handle.step(StepKind::In, None).await?,
        ReplCommand::Finish => handle.step(StepKind::Out, None).await?,
        ReplCommand::Pause => handle.pause(None).await?,

        ReplCommand::Threads => print_threads(&handle.threads().await?),
        ReplCommand::Thread { id } => {
            handle.select_thread(id).await?;
            print_frames(&handle.frames(None).await?);
        }
        ReplCommand::Backtrace => print_frames(&handle.frames(None).await?),
        ReplCommand::Frame { index } => {
            let frame = handle.select_frame(index).await?;
            println!("#{} {}", index, frame);
        }
        ReplCommand::Scopes => print_scopes(&handle.scopes(None).await?),
        ReplCommand::Vars { reference } => print_variables(&handle.variables(reference).await?),
        ReplCommand::Print { expression } => {
            let result = handle.evaluate(&expression.join(" "), None).await?;
            match (&result.type_name, result.variables_reference) {
                (Some(ty), 0) => println!("{} ({})", result.result, ty.dimmed()),
                (Some(ty), r) => println!("{} ({}) [ref {}]", result.result, ty.dimmed(), r),
                (None, 0) => println!("{}", result.result),
                (None, r) => println!("{} [ref {}]", result.result, r),
            }
        }
        ReplCommand::Watch { expression } => {
            let id = handle.add_watch(&expression.join(" ")).await?;
            println!("Watch {} added", id);
        }
        ReplCommand::Unwatch { id } => handle.remove_watch(id).await?,
        ReplCommand::Watches => print_watches(&handle.watches().await?),

        ReplCommand::Output { tail, clear } => {
            for line in handle.output(tail, clear).await? {
                print!("{}", line.text);
            }
        }
        ReplCommand::Status => match handle.status().await? {
            Some(status) => print_status(&status),
            None => println!("No session"),
        },
        ReplCommand::Restart => handle.restart().await?,
        ReplCommand::Detach => handle.detach().await?,
        ReplCommand::Kill => handle.terminate().await?,
        ReplCommand::Quit => {}
    }
    Ok(())
}

async fn print_notifications(mut rx: broadcast::Receiver<Notification>) {
    loop {
        match rx.recv().await {
            Ok(notification) => print_notification(&notification),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("Missed {} notifications", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_notification(notification: &Notification) {
    match notification {
        Notification::StateChanged { new, reason, .. } => {
            tracing::debug!(state = %new, reason = %reason, "State changed");
        }
        Notification::Stopped {
            thread_id,
            reason,
            description,
            frame,
            ..
        } => {
            let what = description.as_deref().unwrap_or(reason);
            match frame {
                Some(frame) => println!(
                    "\n{} thread {} ({}) in {}",
                    "Stopped:".yellow().bold(),
                    thread_id,
                    what,
                    frame
                ),
                None => println!("\n{} thread {} ({})", "Stopped:".yellow().bold(), thread_id, what),
            }
        }
        Notification::BreakpointsChanged { unit, .. } => {
            tracing::debug!(%unit, "Breakpoints changed");
        }
        Notification::BreakpointWarning(warning) => {
            println!(
                "\n{} breakpoint {} at {}: {}",
                "warning:".yellow(),
                warning.id,
                warning.location,
                warning.message
            );
        }
        Notification::WatchesUpdated { watches } => print_watches(watches),
        Notification::Output { category, text } => match category.as_str() {
            "stderr" => eprint!("{}", text.red()),
            "console" | "important" => print!("{}", text.dimmed()),
            _ => print!("{}", text),
        },
        Notification::TargetCrashed { detail, .. } => {
            println!("\n{} {}", "Target crashed:".red().bold(), detail);
        }
        Notification::Exited { code, .. } => match code {
            Some(code) => println!("\n{} with code {}", "Program exited".green(), code),
            None => println!("\n{}", "Program exited".green()),
        },
    }
}

fn print_breakpoints(entries: &[BreakpointEntry]) {
    if entries.is_empty() {
        println!("No breakpoints set");
        return;
    }
    for entry in entries {
        let status = match (entry.spec.enabled, entry.is_bound()) {
            (false, _) => "disabled".dimmed(),
            (true, true) => "bound".green(),
            (true, false) => "pending".yellow(),
        };
        print!("{:>3} {} [{}]", entry.id, entry.location(), status);
        if let Some(condition) = &entry.spec.condition {
            print!(" if {}", condition);
        }
        if let Some(hit) = &entry.spec.hit_condition {
            print!(" hit {}", hit);
        }
        if let Some(message) = &entry.spec.log_message {
            print!(" log \"{}\"", message);
        }
        if let Some(message) = &entry.binding.message {
            print!(" ({})", message.dimmed());
        }
        println!();
    }
}

fn print_threads(threads: &[ThreadInfo]) {
    for thread in threads {
        let state = if thread.stopped { "stopped" } else { "running" };
        println!("{:>4} {} [{}]", thread.id, thread.name, state);
    }
}

fn print_frames(frames: &[StackFrame]) {
    for (index, frame) in frames.iter().enumerate() {
        match (frame.source_path(), &frame.instruction_pointer_reference) {
            (Some(path), _) => println!("#{:<3} {} at {}:{}", index, frame.name.bold(), path, frame.line),
            (None, Some(addr)) => println!("#{:<3} {} at {}", index, frame.name.bold(), addr),
            (None, None) => println!("#{:<3} {}", index, frame.name.bold()),
        }
    }
}

fn print_scopes(scopes: &[Scope]) {
    for scope in scopes {
        let note = if scope.expensive { " (expensive)" } else { "" };
        println!("{} [ref {}]{}", scope.name.bold(), scope.variables_reference, note.dimmed());
    }
}

fn print_variables(variables: &[Variable]) {
    for var in variables {
        print!("  {}", var.name.cyan());
        if let Some(ty) = &var.type_name {
            print!(": {}", ty.dimmed());
        }
        print!(" = {}", var.value);
        if var.is_expandable() {
            print!(" [ref {}]", var.variables_reference);
        }
        println!();
    }
}

fn print_watches(watches: &[Watch]) {
    for watch in watches {
        println!("  {} {} = {}", format!("#{}", watch.id).dimmed(), watch.expression.cyan(), watch.value);
    }
}

fn print_status(status: &SessionStatus) {
    println!("Session {}: {} ({})", status.session, status.state.to_string().bold(), status.target);
    if let Some(pid) = status.adapter_pid {
        println!("  adapter pid: {}", pid);
    }
    if let (Some(thread), Some(reason)) = (status.stopped_thread, &status.stop_reason) {
        println!("  stopped: thread {} ({})", thread, reason);
    }
    if let Some(frame) = status.selected_frame {
        println!("  frame: #{}", frame);
    }
    if let Some(code) = status.exit_code {
        println!("  exit code: {}", code);
    }
    if let Some(reason) = &status.termination {
        println!("  ended: {}", reason);
    }
    if !status.features.is_empty() {
        println!("  adapter supports: {}", status.features.join(", "));
    }
}
