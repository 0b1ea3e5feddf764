use querysmith::config::EngineConfig;
use querysmith::db::{ConnectionParams, DatabaseDriver, InMemoryDriver, PostgresDriver};
use querysmith::llm::{DisabledGenerator, LlmClient, TextGenerator};
use querysmith::orchestrator::{ConversionRequest, QueryEngine};

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "querysmith")]
#[command(about = "Turn natural-language questions into validated SQL")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(ClapArgs)]
struct Target {
    /// Database server (host[:port])
    #[arg(long, default_value = "localhost")]
    server: String,

    /// Database name
    #[arg(long, default_value = "postgres")]
    database: String,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Driver: postgres or memory
    #[arg(long, default_value = "postgres")]
    driver: String,

    /// JSON dataset served by the memory driver
    #[arg(long)]
    data: Option<PathBuf>,
}

impl Target {
    fn params(&self) -> ConnectionParams {
        let mut params = ConnectionParams::new(&self.server, &self.database);
        params.username = self.username.clone();
        params.password = self.password.clone();
        params.driver = Some(self.driver.clone());
        params
    }

    fn driver(&self) -> Result<Arc<dyn DatabaseDriver>> {
        match self.driver.as_str() {
            "memory" => {
                let path = self
                    .data
                    .as_ref()
                    .context("--data is required with the memory driver")?;
                let driver = InMemoryDriver::from_json_file(path)
                    .with_context(|| format!("failed to load dataset {}", path.display()))?;
                Ok(Arc::new(driver))
            }
            "postgres" => Ok(Arc::new(PostgresDriver::new())),
            other => anyhow::bail!("no driver available for '{}'", other),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a question to SQL and optionally run it
    Ask {
        /// The question in natural language
        query: String,

        #[command(flatten)]
        target: Target,

        /// Execute the statement and include the rows
        #[arg(long)]
        execute: bool,

        /// Extra context passed to the intent prompt
        #[arg(long)]
        context: Option<String>,
    },
    /// Print the schema summary the pipeline sees
    Schema {
        #[command(flatten)]
        target: Target,
    },
}

fn text_generator(config: &EngineConfig) -> Result<Arc<dyn TextGenerator>> {
    if config.llm.api_key.is_some() {
        Ok(Arc::new(LlmClient::from_config(&config.llm)?))
    } else {
        warn!("OPENAI_API_KEY not set; running with template generation only");
        Ok(Arc::new(DisabledGenerator))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = EngineConfig::from_env()?;

    match args.command {
        Commands::Ask {
            query,
            target,
            execute,
            context,
        } => {
            let engine = QueryEngine::new(config.clone(), target.driver()?, text_generator(&config)?);
            let mut request = ConversionRequest::new(query, target.params());
            request.execute = execute;
            request.additional_context = context;

            let response = engine.convert_text_to_sql(request).await;
            info!("Request {} finished (success: {})", response.request_id, response.success);
            println!("{}", serde_json::to_string_pretty(&response)?);
            if !response.success {
                std::process::exit(1);
            }
        }
        Commands::Schema { target } => {
            let engine = QueryEngine::new(config.clone(), target.driver()?, Arc::new(DisabledGenerator));
            let schema = engine.schema(&target.params()).await?;
            println!("{}", schema.summary(None));
        }
    }

    Ok(())
}
