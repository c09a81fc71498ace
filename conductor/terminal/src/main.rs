//! Palaver - Terminal Front End
//!
//! Runs one conversation on stdin/stdout. Logs go to stderr so they never
//! interleave with the streamed reply.
//!
//! # Usage
//!
//! ```bash
//! # Defaults (Generalbot, structured intents, local Ollama)
//! palaver
//!
//! # Sales persona with the single-letter classifier
//! palaver --persona Salesbot --classifier letter
//!
//! # Custom config file and model
//! palaver --config ./palaver.toml --model llama3.1:70b
//!
//! # Verbose logging
//! RUST_LOG=debug palaver
//! ```
//!
//! Ctrl-C or end of input ends the conversation.

mod stdio;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use palaver_core::{
    default_config_path, load_config_from_path, spawn_keepalive, ClassifierStrategy, Completions,
    ConfigOverrides, ConnectionPool, ConversationHost, HttpSiteReader, ImageService, Ingestor,
    OllamaBackend, OllamaFactory, PalaverConfig, Services, StableDiffusionClient,
};
use palaver_core::config::DEFAULT_ENDPOINT_PREFIX;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stdio::StdioSink;

/// HTTP timeout for a single chat completion
const CHAT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Palaver - conversations with local models
#[derive(Parser, Debug)]
#[command(name = "palaver")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "PALAVER_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Persona (Generalbot or Salesbot)
    #[arg(short = 'p', long, env = "PALAVER_PERSONA")]
    persona: Option<String>,

    /// Intent classifier (structured or letter)
    #[arg(long, env = "PALAVER_CLASSIFIER")]
    classifier: Option<ClassifierStrategy>,

    /// Model for the default endpoint
    #[arg(short = 'm', long)]
    model: Option<String>,

    /// Maximum concurrent model requests
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "PALAVER_LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("palaver={level},palaver_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

fn resolve_config(args: &Args) -> Result<PalaverConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(ref persona) = args.persona {
        overrides = overrides.with_persona(persona.clone());
    }
    if let Some(classifier) = args.classifier {
        overrides = overrides.with_classifier(classifier);
    }
    if let Some(ref model) = args.model {
        overrides = overrides.with_default_model(model.clone());
    }
    if let Some(max) = args.max_concurrent {
        overrides = overrides.with_max_concurrent(max);
    }
    overrides.apply(&mut config);

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn build_services(config: &PalaverConfig) -> Result<Services> {
    let factory = OllamaFactory::new(CHAT_REQUEST_TIMEOUT).context("Failed to create chat client")?;
    let pool = ConnectionPool::new(config.endpoints.clone(), Arc::new(factory), &config.pool);
    let completions =
        Completions::new(Arc::new(pool)).with_max_output_tokens(config.conversation.max_output_tokens);

    let image_client =
        StableDiffusionClient::new(&config.image).context("Failed to create image client")?;
    let images = ImageService::new(Arc::new(image_client), config.image.wait_timeout);

    let reader = HttpSiteReader::new(config.fetch.timeout).context("Failed to create web client")?;
    let ingestor = Ingestor::new(Arc::new(reader), completions.clone(), config.fetch.timeout);

    Ok(Services {
        completions,
        images: Arc::new(images),
        ingestor,
    })
}

/// Warn early when the default model server is unreachable
async fn check_default_endpoint(config: &PalaverConfig) {
    let Some(endpoint) = config.endpoint(DEFAULT_ENDPOINT_PREFIX) else {
        return;
    };
    let backend =
        match OllamaBackend::new(&endpoint.base_url, &endpoint.model, CHAT_REQUEST_TIMEOUT) {
            Ok(backend) => backend,
            Err(e) => {
                warn!(error = %e, "Failed to create health check client");
                return;
            }
        };
    if backend.health_check().await {
        info!(url = %endpoint.base_url, model = %backend.model(), "Model server reachable");
    } else {
        warn!(url = %endpoint.base_url, "Model server not reachable, replies will fail");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = resolve_config(&args)?;
    info!(
        source = %config.source(),
        persona = %config.conversation.persona,
        classifier = ?config.conversation.classifier,
        "Configuration loaded"
    );

    check_default_endpoint(&config).await;
    let services = build_services(&config)?;
    let cancel = CancellationToken::new();

    let keepalive = config
        .conversation
        .keepalive_interval
        .map(|interval| spawn_keepalive(services.completions.clone(), interval, cancel.child_token()));

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, ending conversation");
            ctrl_c_cancel.cancel();
        }
    });

    let pool = Arc::clone(services.completions.pool());
    let host = ConversationHost::new(services, config.conversation.classifier);
    let sink = StdioSink::new();
    let result = host
        .begin(&config.conversation.persona)
        .context("Failed to start conversation")?
        .run(&sink, &cancel)
        .await;

    cancel.cancel();
    // A keepalive still waiting for a permit fails fast
    pool.close();
    if let Some(handle) = keepalive {
        let _ = handle.await;
    }

    match result {
        Ok(()) => {
            info!("Conversation ended");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Conversation stopped with error");
            Err(e.into())
        }
    }
}
