// Module declarations
mod config;
mod db;
mod detection;
mod dispatch;
mod models;
mod paths;
mod processing;
mod prompts;
mod screenshot;

use std::io::Write as IoWrite;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use log::{error, info, warn};
use tokio::sync::broadcast;

use config::{add_model, load_config, remove_model, save_config, set_active_model};
use models::{AiModelConfig, AppEvent, ProblemInfo, ProviderKind, SolutionResult};
use paths::{DEBUG_QUEUE, MAIN_QUEUE};
use processing::{
    ProcessingOrchestrator, EVT_DEBUG_START, EVT_DEBUG_SUCCESS, EVT_INITIAL_START,
    EVT_NO_SCREENSHOTS, EVT_PROBLEM_EXTRACTED, EVT_SOLUTION_SUCCESS, EVT_STREAM_CHUNK,
};
use screenshot::ScreenshotQueue;

#[derive(Parser, Debug)]
#[command(
    name = "snapsolve",
    version,
    about = "SnapSolve - screenshot to AI solution assistant"
)]
struct Cli {
    /// Print pipeline events as JSON lines
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Capture a screenshot into a queue
    Capture(QueueArgs),
    /// List queued screenshots, oldest first
    List(QueueArgs),
    /// Delete one queued screenshot by path
    Delete {
        #[command(flatten)]
        queue: QueueArgs,
        /// Path of the screenshot to delete
        path: PathBuf,
    },
    /// Delete every screenshot in a queue
    Clear(QueueArgs),
    /// Probe the local network for running AI servers
    Detect(DetectArgs),
    /// List the models the active endpoint advertises
    Models,
    /// Extract the problem from the main queue and generate a solution
    Solve(SolveArgs),
    /// Re-run the last solution against error screenshots in the debug queue
    Debug(DebugArgs),
    /// Manage saved AI model configurations
    Config(ConfigArgs),
    /// Show or clear past runs
    History(HistoryArgs),
    /// Delete all app data: queues, saved models and history
    Reset,
}

#[derive(Args, Debug)]
struct QueueArgs {
    /// Queue to operate on: main or debug
    #[arg(long, default_value = "main")]
    queue: String,
}

#[derive(Args, Debug)]
struct DetectArgs {
    /// Extra host to probe (repeatable)
    #[arg(long = "host")]
    hosts: Vec<String>,
    /// Extra port to probe (repeatable)
    #[arg(long = "port")]
    ports: Vec<u16>,
    /// Scan every candidate instead of stopping at the first hit
    #[arg(long, action = ArgAction::SetTrue)]
    all: bool,
    /// Save the first detected server as a model config and make it active
    #[arg(long, action = ArgAction::SetTrue)]
    save: bool,
}

#[derive(Args, Debug)]
struct SolveArgs {
    /// Language the solution should be written in
    #[arg(long, default_value = "python")]
    language: String,
    /// Wait for the full answer instead of streaming chunks
    #[arg(long, action = ArgAction::SetTrue)]
    no_stream: bool,
}

#[derive(Args, Debug)]
struct DebugArgs {
    /// Language the corrected solution should be written in
    #[arg(long, default_value = "python")]
    language: String,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the saved model list and the active selection
    Show,
    /// Save a new model configuration
    AddModel {
        /// Unique id for the new entry
        #[arg(long)]
        id: String,
        /// Display name
        #[arg(long)]
        name: String,
        /// Provider kind: lmstudio, ollama or custom
        #[arg(long)]
        provider: String,
        /// Server base URL, e.g. http://127.0.0.1:1234
        #[arg(long)]
        base_url: String,
        /// Model name the server should load
        #[arg(long)]
        model: String,
        /// Bearer token, if the endpoint needs one
        #[arg(long)]
        api_key: Option<String>,
        /// Mark the model as able to read images
        #[arg(long, action = ArgAction::SetTrue)]
        multimodal: bool,
    },
    /// Remove a saved model configuration
    RemoveModel {
        /// Id of the entry to remove
        id: String,
    },
    /// Select the active model
    SetActive {
        /// Id of the entry to activate
        id: String,
    },
    /// Set or replace the API key of a saved model
    SetKey {
        /// Id of the entry to update
        id: String,
        /// New bearer token
        key: String,
    },
}

#[derive(Args, Debug)]
struct HistoryArgs {
    /// Number of recent runs to show
    #[arg(long, default_value_t = 10)]
    limit: i64,
    /// Clear all stored runs instead of listing them
    #[arg(long, action = ArgAction::SetTrue)]
    clear: bool,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    match cli.command {
        Commands::Capture(args) => cmd_capture(&args),
        Commands::List(args) => cmd_list(&args),
        Commands::Delete { queue, path } => open_queue(&queue.queue)?.delete(&path),
        Commands::Clear(args) => open_queue(&args.queue)?.clear(),
        Commands::Detect(args) => cmd_detect(args, cli.json).await,
        Commands::Models => cmd_models().await,
        Commands::Solve(args) => cmd_solve(args, cli.json).await,
        Commands::Debug(args) => cmd_debug(args, cli.json).await,
        Commands::Config(args) => cmd_config(args.command),
        Commands::History(args) => cmd_history(&args),
        Commands::Reset => {
            paths::clear_app_data()?;
            info!("app data cleared");
            Ok(())
        }
    }
}

fn open_queue(name: &str) -> Result<ScreenshotQueue, String> {
    match name {
        MAIN_QUEUE | DEBUG_QUEUE => ScreenshotQueue::open(name),
        other => Err(format!(
            "Unknown queue '{}'; expected '{}' or '{}'",
            other, MAIN_QUEUE, DEBUG_QUEUE
        )),
    }
}

// ============ Queue Commands ============

fn cmd_capture(args: &QueueArgs) -> Result<(), String> {
    let queue = open_queue(&args.queue)?;
    let path = queue.capture()?;
    println!("{}", path.display());
    Ok(())
}

fn cmd_list(args: &QueueArgs) -> Result<(), String> {
    let queue = open_queue(&args.queue)?;
    let entries = queue.list()?;
    if entries.is_empty() {
        info!("queue '{}' is empty", args.queue);
        return Ok(());
    }
    for path in entries {
        println!("{}", path.display());
    }
    Ok(())
}

// ============ Detection Commands ============

async fn cmd_detect(args: DetectArgs, json: bool) -> Result<(), String> {
    let servers = if args.all {
        detection::scan_all(&args.hosts, &args.ports).await?
    } else {
        detection::detect_server(&args.hosts, &args.ports)
            .await?
            .into_iter()
            .collect()
    };

    if servers.is_empty() {
        warn!("no AI servers detected");
        return Ok(());
    }

    for server in &servers {
        if json {
            println!(
                "{}",
                serde_json::to_string(server).map_err(|e| format!("Failed to serialize: {}", e))?
            );
        } else {
            println!(
                "{} at {} ({} models: {})",
                server.provider.as_str(),
                server.base_url,
                server.models.len(),
                server.models.join(", ")
            );
        }
    }

    if args.save {
        let server = &servers[0];
        let model_name = server
            .models
            .first()
            .cloned()
            .ok_or_else(|| "Detected server advertises no models to save".to_string())?;
        let mut config = load_config()?;
        let entry = AiModelConfig {
            id: format!("{}-detected", server.provider.as_str()),
            name: format!("{} ({})", server.provider.as_str(), server.base_url),
            provider: server.provider,
            base_url: server.base_url.clone(),
            api_key: None,
            model: model_name.clone(),
            multimodal: detection::is_multimodal_model(&model_name),
        };
        let id = entry.id.clone();
        if config.models.iter().any(|m| m.id == id) {
            remove_model(&mut config, &id)?;
        }
        add_model(&mut config, entry)?;
        set_active_model(&mut config, &id)?;
        save_config(&config)?;
        info!("saved detected server as active model '{}'", id);
    }
    Ok(())
}

async fn cmd_models() -> Result<(), String> {
    let config = load_config()?;
    let model = config
        .active_model()
        .ok_or_else(|| "No active model configured; run 'detect --save' or 'config add-model'".to_string())?;
    let models = detection::list_models(model).await?;
    for name in models {
        println!("{}", name);
    }
    Ok(())
}

// ============ Pipeline Commands ============

async fn cmd_solve(args: SolveArgs, json: bool) -> Result<(), String> {
    let config = load_config()?;
    let model = config
        .active_model()
        .ok_or_else(|| "No active model configured; run 'detect --save' or 'config add-model'".to_string())?;

    let queue = ScreenshotQueue::open(MAIN_QUEUE)?;
    let orchestrator = ProcessingOrchestrator::new();
    let printer = tokio::spawn(print_events(orchestrator.emitter().subscribe(), json));

    let result = tokio::select! {
        res = orchestrator.process_screenshots(model, &queue, &args.language, !args.no_stream) => res,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.cancel_ongoing_requests();
            Err("Request cancelled".to_string())
        }
    };

    drop(orchestrator);
    let _ = printer.await;

    let (problem, solution) = result?;
    if !json {
        print_solution(&problem, &solution, &args.language);
    }
    Ok(())
}

async fn cmd_debug(args: DebugArgs, json: bool) -> Result<(), String> {
    let config = load_config()?;
    let model = config
        .active_model()
        .ok_or_else(|| "No active model configured; run 'detect --save' or 'config add-model'".to_string())?;

    // Debugging iterates on the most recent run, whatever its kind
    let last = db::get_history_internal(1)?
        .pop()
        .ok_or_else(|| "No previous run to debug; run 'solve' first".to_string())?;
    let problem = ProblemInfo {
        problem_statement: last.problem_statement.clone(),
        constraints: None,
        example_input: None,
        example_output: None,
    };
    let prior: SolutionResult = serde_json::from_str(&last.solution_json)
        .map_err(|e| format!("Failed to parse stored solution: {}", e))?;

    let queue = ScreenshotQueue::open(DEBUG_QUEUE)?;
    let orchestrator = ProcessingOrchestrator::new();
    let printer = tokio::spawn(print_events(orchestrator.emitter().subscribe(), json));

    let result = tokio::select! {
        res = orchestrator.process_extra_screenshots(model, &queue, &problem, &prior, &args.language) => res,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.cancel_ongoing_requests();
            Err("Request cancelled".to_string())
        }
    };

    drop(orchestrator);
    let _ = printer.await;

    let solution = result?;
    if !json {
        print_solution(&problem, &solution, &args.language);
    }
    Ok(())
}

/// Drains orchestrator events until the emitter closes
async fn print_events(mut rx: broadcast::Receiver<AppEvent>, json: bool) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("event printer lagged, skipped {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if json {
            println!(
                "{}",
                serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string())
            );
            continue;
        }

        match event.name.as_str() {
            EVT_STREAM_CHUNK => {
                print!("{}", event.payload["chunk"].as_str().unwrap_or_default());
                let _ = std::io::stdout().flush();
            }
            EVT_INITIAL_START | EVT_DEBUG_START => {
                info!(
                    "processing {} screenshot(s)",
                    event.payload["screenshots"].as_u64().unwrap_or_default()
                );
            }
            EVT_PROBLEM_EXTRACTED => {
                info!(
                    "problem extracted: {}",
                    event.payload["problem_statement"].as_str().unwrap_or_default()
                );
            }
            EVT_SOLUTION_SUCCESS | EVT_DEBUG_SUCCESS => {
                // Streamed chunks may have left the cursor mid-line
                println!();
                info!("solution generated");
            }
            EVT_NO_SCREENSHOTS => {
                warn!(
                    "queue '{}' has no screenshots",
                    event.payload["queue"].as_str().unwrap_or_default()
                );
            }
            _ => info!("{}: {}", event.name, event.payload),
        }
    }
}

fn print_solution(problem: &ProblemInfo, solution: &SolutionResult, language: &str) {
    println!("\nProblem:\n{}\n", problem.problem_statement);
    for thought in &solution.thoughts {
        println!("- {}", thought);
    }
    println!("\n```{}\n{}\n```", language, solution.code);
    if let Some(time) = solution.time_complexity.as_deref() {
        println!("Time:  {}", time);
    }
    if let Some(space) = solution.space_complexity.as_deref() {
        println!("Space: {}", space);
    }
}

// ============ Config Commands ============

fn cmd_config(command: ConfigCommands) -> Result<(), String> {
    match command {
        ConfigCommands::Show => {
            let config = load_config()?;
            if config.models.is_empty() {
                info!("no saved models");
                return Ok(());
            }
            for model in &config.models {
                let marker = if config.active_model_id.as_deref() == Some(model.id.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{} {}  {}  {}  {}  multimodal={}",
                    marker, model.id, model.provider.as_str(), model.base_url, model.model,
                    model.multimodal
                );
            }
            Ok(())
        }
        ConfigCommands::AddModel {
            id,
            name,
            provider,
            base_url,
            model,
            api_key,
            multimodal,
        } => {
            let provider = parse_provider(&provider)?;
            let mut config = load_config()?;
            add_model(
                &mut config,
                AiModelConfig {
                    id,
                    name,
                    provider,
                    base_url,
                    api_key,
                    model,
                    multimodal,
                },
            )?;
            save_config(&config)
        }
        ConfigCommands::RemoveModel { id } => {
            let mut config = load_config()?;
            remove_model(&mut config, &id)?;
            save_config(&config)
        }
        ConfigCommands::SetActive { id } => {
            let mut config = load_config()?;
            set_active_model(&mut config, &id)?;
            save_config(&config)
        }
        ConfigCommands::SetKey { id, key } => {
            let mut config = load_config()?;
            let entry = config
                .models
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or_else(|| format!("No model with id '{}'", id))?;
            entry.api_key = Some(key);
            save_config(&config)
        }
    }
}

fn parse_provider(raw: &str) -> Result<ProviderKind, String> {
    match raw.to_lowercase().as_str() {
        "lmstudio" => Ok(ProviderKind::Lmstudio),
        "ollama" => Ok(ProviderKind::Ollama),
        "custom" => Ok(ProviderKind::Custom),
        other => Err(format!(
            "Unknown provider '{}'; expected lmstudio, ollama or custom",
            other
        )),
    }
}

// ============ History Commands ============

fn cmd_history(args: &HistoryArgs) -> Result<(), String> {
    if args.clear {
        db::clear_history_internal()?;
        info!("history cleared");
        return Ok(());
    }
    let entries = db::get_history_internal(args.limit)?;
    if entries.is_empty() {
        info!("no stored runs");
        return Ok(());
    }
    for entry in entries {
        println!(
            "[{}] {} ({}) {}",
            entry.timestamp,
            entry.kind,
            entry.language,
            truncate(&entry.problem_statement, 80)
        );
    }
    Ok(())
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_provider_accepts_known_kinds_case_insensitively() {
        assert_eq!(parse_provider("lmstudio").unwrap(), ProviderKind::Lmstudio);
        assert_eq!(parse_provider("Ollama").unwrap(), ProviderKind::Ollama);
        assert_eq!(parse_provider("CUSTOM").unwrap(), ProviderKind::Custom);
        assert!(parse_provider("openai").is_err());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 80), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("héllo wörld", 5), "héllo...");
    }

    #[test]
    fn open_queue_rejects_unknown_names() {
        assert!(open_queue("main").is_ok());
        assert!(open_queue("debug").is_ok());
        assert!(open_queue("other").is_err());
    }
}
