use clap::Parser;
use colloquy::dispatch::ProjectReader;
use colloquy::engine::{ChatEngine, PanelEvent};
use colloquy::logging::{init_tracing, setup_panic_hook};
use colloquy::main_helper::{build_client, open_store};
use colloquy::*;
use colored::*;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

/// Prints the tail of the transcript as snapshots arrive.
#[derive(Default)]
struct TranscriptPrinter {
    index: Option<usize>,
    reasoning_printed: usize,
    content_printed: usize,
}

impl TranscriptPrinter {
    fn reset(&mut self) {
        self.index = None;
        self.reasoning_printed = 0;
        self.content_printed = 0;
    }

    fn render(&mut self, messages: &[Message]) {
        let Some(idx) = messages.len().checked_sub(1) else {
            self.reset();
            return;
        };
        let last = &messages[idx];
        if last.role != Role::Assistant || last.hidden {
            return;
        }
        if self.index != Some(idx) {
            self.reset();
            self.index = Some(idx);
            println!();
        }

        let mut out = std::io::stdout().lock();
        if let Some(reasoning) = &last.reasoning {
            if let Some(fresh) = reasoning.get(self.reasoning_printed..) {
                let _ = write!(out, "{}", fresh.dimmed());
                self.reasoning_printed = reasoning.len();
            }
        }
        if let Some(content) = &last.content {
            if self.content_printed == 0 && self.reasoning_printed > 0 && !content.is_empty() {
                let _ = writeln!(out);
            }
            if let Some(fresh) = content.get(self.content_printed..) {
                let _ = write!(out, "{}", fresh);
                self.content_printed = content.len();
            }
        }
        let _ = out.flush();
    }
}

async fn render_events(mut rx: broadcast::Receiver<PanelEvent>) {
    let mut printer = TranscriptPrinter::default();
    loop {
        match rx.recv().await {
            Ok(PanelEvent::MessagesChanged(messages)) => printer.render(&messages),
            Ok(PanelEvent::LoadingChanged(true)) => printer.reset(),
            Ok(PanelEvent::LoadingChanged(false)) => println!(),
            Ok(PanelEvent::ToolDispatched { name, succeeded }) => {
                let mark = if succeeded { "ok".green() } else { "failed".red() };
                println!("\n{} {} {}", "[tool]".cyan(), name, mark);
            }
            Ok(PanelEvent::SessionChanged(Some(header))) => {
                println!("{} {} ({})", "[session]".cyan(), header.title, header.id);
            }
            Ok(PanelEvent::SessionChanged(None)) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Renderer lagged by {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_usage(engine: &ChatEngine) {
    let snapshot = engine.snapshot();
    let info = snapshot
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .and_then(|m| m.generation_info);
    if let Some(info) = info {
        println!(
            "{}",
            format!(
                "[{} prompt + {} completion tokens, ${:.6}]",
                info.tokens_prompt, info.tokens_completion, info.total_cost
            )
            .dimmed()
        );
    }
}

async fn list_sessions(engine: &ChatEngine) -> Result<()> {
    let sessions = engine.list_sessions().await?;
    if sessions.is_empty() {
        println!("No sessions.");
    }
    for s in sessions {
        println!(
            "{}  {}  {}",
            s.id.yellow(),
            s.created_at.format("%Y-%m-%d %H:%M"),
            s.title
        );
    }
    Ok(())
}

/// Handles one REPL line. Returns false when the user asked to quit.
async fn handle_line(
    engine: &ChatEngine,
    reader: &ProjectReader,
    line: &str,
    attachments: &mut Vec<AttachedItem>,
) -> Result<bool> {
    let line = line.trim();
    match line.split_once(' ').map_or((line, ""), |(c, rest)| (c, rest.trim())) {
        ("", _) => {}
        ("/quit", _) | ("/exit", _) => return Ok(false),
        ("/new", _) => engine.new_session().await?,
        ("/sessions", _) => list_sessions(engine).await?,
        ("/load", id) => engine.load_session(id).await?,
        ("/rename", title) => match engine.active_session() {
            Some(s) => engine.rename_session(&s.id, title).await?,
            None => println!("No active session."),
        },
        ("/delete", _) => match engine.active_session() {
            Some(s) => engine.delete_session(&s.id).await?,
            None => println!("No active session."),
        },
        ("/regen", _) => {
            let len = engine.snapshot().len();
            engine.regenerate_response(len).await?;
            print_usage(engine);
        }
        _ => {
            let attached = std::mem::take(attachments);
            let hidden = reader.attachment_context(&attached).await?;
            engine.send_chat_message(line, attached, hidden).await?;
            print_usage(engine);
        }
    }
    Ok(true)
}

async fn run(args: Args) -> Result<()> {
    let store = open_store(&args).await?;
    let client = build_client(&args)?;
    let reader = Arc::new(ProjectReader::new(args.project_root()));
    let engine = Arc::new(ChatEngine::new(args.engine_config(), client, store, reader.clone()));

    if args.list_sessions {
        return list_sessions(&engine).await;
    }
    if let Some(id) = &args.rename_session {
        let title = args.title.as_deref().unwrap_or_default();
        engine.rename_session(id, title).await?;
        println!("Renamed {}", id);
        return Ok(());
    }
    if let Some(id) = &args.delete_session {
        engine.delete_session(id).await?;
        println!("Deleted {}", id);
        return Ok(());
    }
    if args.delete_all_sessions {
        engine.delete_all_sessions().await?;
        println!("Deleted all sessions for this project and profile");
        return Ok(());
    }

    let renderer = tokio::spawn(render_events(engine.subscribe()));

    {
        let engine = engine.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if engine.is_loading() {
                    if let Err(e) = engine.stop_response().await {
                        tracing::error!("Failed to stop response: {}", e);
                    }
                    println!("\n{}", "[stopped]".yellow());
                } else {
                    std::process::exit(130);
                }
            }
        });
    }

    if let Some(id) = &args.session {
        engine.load_session(id).await?;
    }

    let mut attachments = args.attachments();
    if let Some(prompt) = args.one_shot_prompt() {
        let hidden = reader.attachment_context(&attachments).await?;
        engine.send_chat_message(&prompt, attachments, hidden).await?;
        print_usage(&engine);
    } else {
        println!(
            "{} {} ({}). /new /sessions /load <id> /rename <title> /delete /regen /quit",
            "colloquy".bold(),
            engine.config().model,
            engine.config().provider_kind()
        );
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("{} ", ">".green().bold());
            let _ = std::io::stdout().flush();
            let Some(line) = lines.next_line().await? else {
                break;
            };
            match handle_line(&engine, &reader, &line, &mut attachments).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => eprintln!("{} {}", "error:".red(), e),
            }
        }
    }

    renderer.abort();
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let _guard = match init_tracing(&args.log_dir, args.json_logs) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("Failed to initialize logging in {}: {}", args.log_dir.display(), e);
            std::process::exit(1);
        }
    };
    setup_panic_hook();

    tracing::info!(
        "colloquy starting: model={} mode={} stream={}",
        args.model,
        args.mode,
        !args.no_stream
    );

    if let Err(e) = run(args).await {
        tracing::error!("Fatal: {}\n{}", e, e.span_trace);
        eprintln!("{} {}", "error:".red(), e);
        std::process::exit(1);
    }
}
