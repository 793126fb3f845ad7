//! strata-chat: Drive a conversation session from the command line.
//!
//! The engine is a [`ScriptedEngine`] loaded from a JSON script, so the
//! whole session surface (templating, streaming, history, cancellation by
//! budget) can be exercised without model weights.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::time::Instant;

use clap::Parser;
use serde::Serialize;

use strata_session::cli::{self, ChatCommand};
use strata_session::{
    ConversationTurn, GenerationOutput, ScriptedLoader, Session, SessionConfig, TemplatingMode,
};

#[derive(Parser)]
#[command(name = "strata-chat", about = "Chat with a scripted engine through a session")]
struct Args {
    /// Path to the engine script (JSON)
    #[arg(short = 's', long)]
    script: PathBuf,

    /// Session config file (JSON)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// User message
    #[arg(short = 'p', long, conflicts_with_all = ["file", "stdin", "context"])]
    prompt: Option<String>,

    /// Read the user message from a file
    #[arg(short = 'f', long, conflicts_with_all = ["stdin", "context"])]
    file: Option<PathBuf>,

    /// Read the user message from stdin
    #[arg(long, conflicts_with = "context")]
    stdin: bool,

    /// Generate from a full turn sequence (JSON) without touching history
    #[arg(long)]
    context: Option<PathBuf>,

    /// Earlier messages to seed the history with (JSON array of strings)
    #[arg(long)]
    history: Option<PathBuf>,

    /// Use the reasoning prompt template
    #[arg(long)]
    reasoning: bool,

    /// Keep only the latest exchange between requests
    #[arg(long)]
    no_history: bool,

    /// Maximum engine steps per response
    #[arg(short = 'n', long)]
    max_new_tokens: Option<usize>,

    /// System prompt override
    #[arg(long)]
    system: Option<String>,

    /// Output format: text or json
    #[arg(long, default_value = "text", value_parser = cli::validate_output_format)]
    output_format: String,

    /// Suppress all logging
    #[arg(long)]
    log_disable: bool,
}

#[derive(Serialize)]
struct Timings {
    load_ms: f64,
    prefill_ms: f64,
    decode_ms: f64,
    total_ms: f64,
    prefill_tok_per_sec: f64,
    decode_tok_per_sec: f64,
}

#[derive(Serialize)]
struct JsonOutput {
    script: String,
    mode: TemplatingMode,
    prompt: String,
    output: String,
    raw_output: String,
    stop_reason: String,
    engine_steps: usize,
    prompt_tokens: u64,
    generated_tokens: u64,
    timings: Timings,
    history: Vec<ConversationTurn>,
}

fn main() {
    let args = Args::parse();
    cli::init_logging(args.log_disable);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn build_config(args: &Args) -> Result<SessionConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::default(),
    };
    if args.reasoning {
        config.templating_mode = TemplatingMode::Reasoning;
    }
    if args.no_history {
        config.retain_history = false;
    }
    if let Some(n) = args.max_new_tokens {
        config.max_new_tokens = n;
    }
    if let Some(system) = &args.system {
        config.system_prompt = Some(system.clone());
    }
    Ok(config)
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let total_start = Instant::now();

    let config = build_config(&args)?;
    let seed = match &args.history {
        Some(path) => cli::read_seed(path)?,
        None => Vec::new(),
    };
    let session = Session::new(config, &seed)?;

    let load_start = Instant::now();
    session.load(&ScriptedLoader, &args.script)?;
    let load_ms = load_start.elapsed().as_secs_f64() * 1000.0;

    let streaming = args.output_format == "text";
    let mut stdout = std::io::stdout();
    let mut print_unit = |unit: &str| -> bool {
        if streaming {
            // A closed stdout stops generation.
            return write!(stdout, "{}", unit).and_then(|_| stdout.flush()).is_ok();
        }
        true
    };

    let (prompt_display, output) = if let Some(path) = &args.context {
        let turns = cli::read_turns(path)?;
        let display = turns.last().map(|t| t.content.clone()).unwrap_or_default();
        (display, session.submit_with_history(turns, &mut print_unit)?)
    } else {
        match cli::read_input(args.prompt.as_deref(), args.file.as_deref(), args.stdin)? {
            Some(input) => {
                let output = session.submit(&input, &mut print_unit)?;
                (input, output)
            }
            None => return interactive(&session, streaming),
        }
    };

    if streaming {
        println!();
        return Ok(());
    }

    let total_ms = total_start.elapsed().as_secs_f64() * 1000.0;
    let json = json_output(&args, &session, prompt_display, output, load_ms, total_ms);
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

fn json_output(
    args: &Args,
    session: &Session,
    prompt: String,
    output: GenerationOutput,
    load_ms: f64,
    total_ms: f64,
) -> JsonOutput {
    let result = output.result;
    JsonOutput {
        script: args.script.display().to_string(),
        mode: session.templating_mode(),
        prompt,
        output: output.response,
        raw_output: output.diagnostics.raw_response,
        stop_reason: output.stop_reason.to_string(),
        engine_steps: output.diagnostics.engine_steps,
        prompt_tokens: result.prompt_tokens,
        generated_tokens: result.generated_tokens,
        timings: Timings {
            load_ms,
            prefill_ms: output.diagnostics.prefill_duration.as_secs_f64() * 1000.0,
            decode_ms: output.diagnostics.decode_duration.as_secs_f64() * 1000.0,
            total_ms,
            prefill_tok_per_sec: result.prefill_tokens_per_sec(),
            decode_tok_per_sec: result.decode_tokens_per_sec(),
        },
        history: session.history(),
    }
}

/// Read lines from stdin until EOF or `/quit`, answering each message.
fn interactive(session: &Session, streaming: bool) -> Result<(), Box<dyn std::error::Error>> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    for line in stdin.lock().lines() {
        let line = line?;
        let command = match cli::parse_command(&line) {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };

        match command {
            ChatCommand::Say(text) if text.trim().is_empty() => continue,
            ChatCommand::Say(text) => {
                let output = session.submit(&text, &mut |unit: &str| {
                    !streaming || write!(stdout, "{}", unit).and_then(|_| stdout.flush()).is_ok()
                })?;
                if streaming {
                    println!();
                } else {
                    println!("{}", serde_json::to_string(&output)?);
                }
            }
            ChatCommand::Reset => session.reset(),
            ChatCommand::Clear(keep) => session.clear_history(keep),
            ChatCommand::System(text) => session.set_system_prompt(text)?,
            ChatCommand::Config(patch) => {
                if let Err(e) = session.update_config(&patch) {
                    eprintln!("Error: {}", e);
                }
            }
            ChatCommand::History => {
                print!("{}", strata_session::history::render_transcript(&session.history()));
            }
            ChatCommand::Quit => break,
        }
    }
    Ok(())
}
