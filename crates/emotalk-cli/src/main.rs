use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use emotalk_core::case::FileCaseStore;
use emotalk_core::config::{Config, LoggingConfig};
use emotalk_core::persona::{FilePersonaStore, PersonaStore};
use emotalk_core::protocol::{ServerEvent, decode_audio};
use emotalk_gateway::GatewayState;
use emotalk_session::{ConversationSession, Services, SessionFeedback, review_conversation};

#[derive(Parser)]
#[command(
    name = "emotalk",
    about = "Real-time emotional voice conversation server",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the conversation gateway
    Serve {
        /// Port to listen on (default: 8000)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Talk to a persona in the terminal (one-shot or interactive)
    Chat {
        /// Persona to talk to
        #[arg(short, long)]
        persona: Option<String>,

        /// Message to send (omit for interactive mode)
        #[arg(short, long)]
        message: Option<String>,
    },

    /// List available personas
    Personas,

    /// List counseling practice cases (talk to one with `--persona case:<id>`)
    Cases,

    /// Score a logged practice conversation as a counseling supervisor
    Feedback {
        /// Conversation id from the conversation log
        conversation_id: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show capability status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;

    init_tracing(
        &config.logging.clone().unwrap_or_default(),
        cli.verbose,
    );

    match cli.command {
        Commands::Serve { port } => {
            let port = port.unwrap_or_else(|| config.gateway_port());
            tracing::info!("Starting emotalk gateway on port {port}");
            let services = Arc::new(Services::from_config(&config));
            let state = Arc::new(GatewayState::new(Arc::new(config), services));
            emotalk_gateway::start_gateway(state, port).await?;
        }
        Commands::Chat { persona, message } => {
            run_chat(&config, persona.as_deref(), message).await?;
        }
        Commands::Personas => {
            let dir = config.personas_dir();
            let personas = FilePersonaStore::new(dir.clone()).list().await?;
            if personas.is_empty() {
                println!(
                    "No personas in {} (the built-in default is used)",
                    dir.display()
                );
            }
            for persona in personas {
                println!("{:<16} {:<20} {}", persona.id, persona.name, persona.description);
            }
        }
        Commands::Cases => {
            let dir = config.cases_dir();
            let cases = FileCaseStore::new(dir.clone()).list().await?;
            if cases.is_empty() {
                println!("No cases in {}", dir.display());
            }
            for case in cases {
                println!("{:<16} {:<20} {}", case.id, case.name, case.presenting_issue);
            }
        }
        Commands::Feedback {
            conversation_id,
            json,
        } => {
            let services = Services::from_config(&config);
            let feedback = review_conversation(&services, &conversation_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&feedback)?);
            } else {
                print_feedback(&feedback);
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("configuration has {} error(s)", errors.len());
                }
                println!("Configuration OK ({} warning(s))", warnings.len());
            }
        },
        Commands::Status => {
            let services = Services::from_config(&config);
            let availability = services.availability();
            println!("emotalk v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Personas: {}", config.personas_dir().display());
            println!("Cases: {}", config.cases_dir().display());
            match config.store_dir() {
                Some(dir) => println!("Conversation log: {}", dir.display()),
                None => println!("Conversation log: disabled"),
            }
            println!("Gateway: {}:{}", config.gateway_bind(), config.gateway_port());
            println!("Recognition: {}", on_off(availability.recognition));
            println!("Reply generation: {}", on_off(availability.reply));
            println!("Synthesis: {}", on_off(availability.synthesis));
        }
    }

    Ok(())
}

fn on_off(available: bool) -> &'static str {
    if available { "available" } else { "unavailable" }
}

/// `RUST_LOG` wins; otherwise the configured level plus per-crate filters.
fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose {
            "debug"
        } else {
            logging.level.as_deref().unwrap_or("info")
        };
        let mut filter = EnvFilter::new(level);
        for directive in &logging.filters {
            match directive.parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => eprintln!("Ignoring invalid log filter {directive:?}: {e}"),
            }
        }
        filter
    });

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (logging.format.as_str(), logging.output.as_str()) {
        ("json", "stdout") => builder.json().with_writer(std::io::stdout).init(),
        ("json", _) => builder.json().with_writer(std::io::stderr).init(),
        (_, "stdout") => builder.with_writer(std::io::stdout).init(),
        _ => builder.with_writer(std::io::stderr).init(),
    }
}

fn print_feedback(feedback: &SessionFeedback) {
    match &feedback.case_id {
        Some(case) => println!("Conversation {} (case {case})", feedback.conversation_id),
        None => println!("Conversation {}", feedback.conversation_id),
    }
    println!("Overall: {:.0}/100", feedback.overall_score);
    for category in &feedback.categories {
        println!("  {:<20} {:>3.0}  {}", category.name, category.score, category.comment);
    }
    println!();
    println!("{}", feedback.summary);
    for (title, items) in [
        ("Strengths", &feedback.strengths),
        ("To improve", &feedback.improvements),
        ("Practice", &feedback.recommendations),
    ] {
        if items.is_empty() {
            continue;
        }
        println!("\n{title}:");
        for item in items {
            println!("  - {item}");
        }
    }
}

/// Run text turns through a local session, printing what a client would see.
async fn run_chat(
    config: &Config,
    persona: Option<&str>,
    message: Option<String>,
) -> anyhow::Result<()> {
    let services = Arc::new(Services::from_config(config));
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut session = ConversationSession::new(services, event_tx);
    session.initialize(persona).await?;

    let name = session
        .persona()
        .map(|p| p.name.clone())
        .unwrap_or_else(|| "emotalk".into());

    match message {
        Some(message) => {
            if message.trim().is_empty() {
                anyhow::bail!("--message must not be empty");
            }
            session.submit_text(&message);
            print_turn(&mut event_rx, &name).await;
        }
        None => {
            println!("Talking to {name}. Type a message, or /quit to exit.");
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                let line = line.trim();
                if line == "/quit" {
                    break;
                }
                if line.is_empty() {
                    continue;
                }
                session.submit_text(line);
                print_turn(&mut event_rx, &name).await;
            }
        }
    }

    session.stop().await;
    Ok(())
}

/// Print events up to the end-of-audio marker of one turn.
async fn print_turn(events: &mut mpsc::UnboundedReceiver<ServerEvent>, name: &str) {
    let mut chunks = 0usize;
    let mut bytes = 0usize;
    while let Some(event) = events.recv().await {
        match event {
            ServerEvent::Status { text } => {
                tracing::debug!(status = ?text, "Session status");
            }
            ServerEvent::Transcript { text, .. } => println!("you: {text}"),
            ServerEvent::Emotion { emotion, intensity } => {
                println!("[{emotion} {intensity:.2}]");
            }
            ServerEvent::Response { text, .. } => println!("{name}: {text}"),
            ServerEvent::Error { text } => println!("[error] {text}"),
            ServerEvent::Audio {
                audio_data,
                is_final,
            } => {
                if let Some(data) = audio_data {
                    chunks += 1;
                    bytes += decode_audio(&data).map(|b| b.len()).unwrap_or(0);
                }
                if is_final {
                    if chunks > 0 {
                        println!("[audio: {chunks} chunks, {bytes} bytes]");
                    }
                    return;
                }
            }
        }
    }
}
