use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use easel_canvas::{CanvasDocument, InMemoryCanvas, LayoutPlanner};
use easel_core::config::{Config, Framing};
use easel_core::types::Point;
use easel_reconciler::{Reconciler, ReconcilerEvent, TurnSummary, tool_definitions};
use easel_stream::{ChatRequest, DecoderOptions, HttpTransport, byte_stream_from, decode, decode_transport};

mod logging;

#[derive(Parser)]
#[command(
    name = "easel",
    about = "Reconcile streamed agent tool calls onto a canvas",
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
    /// Replay a recorded agent stream against an in-memory canvas
    Replay {
        /// Recorded response body
        file: PathBuf,

        /// Wire format (default: from config)
        #[arg(long, value_enum)]
        framing: Option<FramingArg>,

        /// Turn id to use when the stream carries none
        #[arg(long)]
        turn: Option<String>,
    },

    /// Print planned positions for a batch of nodes
    Plan {
        #[arg(long)]
        count: i64,

        #[arg(long, default_value_t = 0.0)]
        x: f64,

        #[arg(long, default_value_t = 0.0)]
        y: f64,
    },

    /// Print the tool definitions sent to the agent
    Tools,

    /// Send one message to the configured agent endpoint (Ctrl-C cancels)
    Chat {
        #[arg(short, long)]
        message: String,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value (dotted path)
    Get { key: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum FramingArg {
    DataStream,
    Sse,
}

impl From<FramingArg> for Framing {
    fn from(arg: FramingArg) -> Self {
        match arg {
            FramingArg::DataStream => Framing::DataStream,
            FramingArg::Sse => Framing::Sse,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;

    logging::init(&config.logging.clone().unwrap_or_default(), cli.verbose);

    let (warnings, errors) = config.validate();
    for warning in &warnings {
        tracing::warn!("{warning}");
    }
    if !errors.is_empty() {
        anyhow::bail!("invalid config {}: {}", config_path.display(), errors.join("; "));
    }

    match cli.command {
        Commands::Replay {
            file,
            framing,
            turn,
        } => {
            let body = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let framing = framing.map(Framing::from).unwrap_or_else(|| config.framing());
            let stream = decode(byte_stream_from(vec![body]), framing, decoder_options(&config, turn));

            let mut reconciler = reconciler(&config);
            let summary = run(&mut reconciler, stream, CancellationToken::new()).await;
            print_result(&reconciler, &summary)?;
        }
        Commands::Plan { count, x, y } => {
            let planner = LayoutPlanner::from_config(&config.layout());
            let positions = planner.plan(count, Point::new(x, y))?;
            println!("{}", serde_json::to_string_pretty(&positions)?);
        }
        Commands::Tools => {
            println!("{}", serde_json::to_string_pretty(&tool_definitions())?);
        }
        Commands::Chat { message } => {
            let stream_config = config.stream();
            let endpoint = config
                .endpoint()
                .context("stream.endpoint is not configured")?;
            let transport = HttpTransport::new(endpoint, stream_config.resolve_api_key());

            let mut request = ChatRequest::user(message);
            request.model = stream_config.model.clone();
            request.tools = Some(tool_definitions());

            let stream = decode_transport(
                &transport,
                &request,
                config.framing(),
                decoder_options(&config, None),
            )
            .await?;

            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Interrupted, cancelling turn");
                    ctrl_c.cancel();
                }
            });

            let mut reconciler = reconciler(&config);
            let summary = run(&mut reconciler, stream, cancel).await;
            print_result(&reconciler, &summary)?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("no config value at {key}"),
            },
        },
    }

    Ok(())
}

fn decoder_options(config: &Config, turn: Option<String>) -> DecoderOptions {
    let mut options = DecoderOptions {
        client_actions: config.client_actions_enabled(),
        ..Default::default()
    };
    if let Some(turn) = turn {
        options.default_turn_id = turn;
    }
    options
}

fn reconciler(config: &Config) -> Reconciler<InMemoryCanvas> {
    Reconciler::with_config(
        InMemoryCanvas::default(),
        LayoutPlanner::from_config(&config.layout()),
        config.reconciler(),
    )
}

/// Drive one stream while printing its events as they arrive.
async fn run(
    reconciler: &mut Reconciler<InMemoryCanvas>,
    stream: easel_stream::EventStream,
    cancel: CancellationToken,
) -> TurnSummary {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            render(&event);
        }
    });
    let summary = reconciler.run_turn(stream, cancel, tx).await;
    if let Err(e) = printer.await {
        tracing::warn!(%e, "Event printer failed");
    }
    summary
}

fn render(event: &ReconcilerEvent) {
    match event {
        ReconcilerEvent::TextDelta { delta, .. } => {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
        ReconcilerEvent::ToolCall { tool, args, .. } => {
            eprintln!("\n[{tool}] {args}");
        }
        ReconcilerEvent::ToolResult {
            tool,
            content,
            is_error,
            ..
        } => {
            let tag = if *is_error { "error" } else { "ok" };
            eprintln!("[{tool}:{tag}] {content}");
        }
        ReconcilerEvent::AgentError { message, .. } => eprintln!("[agent error] {message}"),
        ReconcilerEvent::TurnStarted { .. }
        | ReconcilerEvent::AgentResult { .. }
        | ReconcilerEvent::TurnFinished { .. } => {}
    }
}

fn print_result(reconciler: &Reconciler<InMemoryCanvas>, summary: &TurnSummary) -> anyhow::Result<()> {
    println!();
    let output = serde_json::json!({
        "summary": summary,
        "nodes": reconciler.canvas().nodes(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
