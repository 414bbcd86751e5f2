use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use lorekeeper_core::config::Config;
use lorekeeper_core::supervisor::ServiceEndpoint;
use lorekeeper_core::{Answer, GenerationClient, Runtime};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "lorekeeper")]
#[command(about = "Ask questions of an offline Wikipedia snapshot", long_about = None)]
#[command(version)]
struct Cli {
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Start the services and answer questions read from stdin")]
    Run,

    #[command(about = "Start the services and answer a single question")]
    Ask {
        #[arg(required = true, help = "The question to answer")]
        question: Vec<String>,
    },

    #[command(about = "Show current configuration")]
    Show,

    #[command(about = "List models known to the Ollama server")]
    Models {
        #[arg(short, long, help = "Ollama base URL (defaults to llm.base_url)")]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lorekeeper_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run(&cli.config).await,
        Commands::Ask { question } => ask(&cli.config, &question.join(" ")).await,
        Commands::Show => show_config(&cli.config),
        Commands::Models { url } => list_models(&cli.config, url).await,
    }
}

fn load_config(config_path: &Path) -> Result<Config> {
    if config_path.exists() {
        Config::load(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))
    } else {
        Ok(Config::default())
    }
}

async fn bootstrap(config_path: &Path) -> Result<Runtime> {
    let config = load_config(config_path)?;

    println!("{} Starting services...", "→".blue());
    let runtime = Runtime::bootstrap(&config)
        .await
        .context("Failed to start lorekeeper")?;
    println!("{} Ready ({})", "✓".green().bold(), config.model.name.cyan());

    Ok(runtime)
}

async fn run(config_path: &Path) -> Result<()> {
    let runtime = bootstrap(config_path).await?;

    println!("Ask a question, or type {} to leave.", "exit".bold());
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        println!("{}", "Question:".bold());

        let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if question.eq_ignore_ascii_case("exit") || question.eq_ignore_ascii_case("quit") {
            break;
        }

        match runtime.orchestrator().answer(question).await {
            Ok(answer) => print_answer(&answer),
            Err(e) => eprintln!("{} {e}", "✗".red().bold()),
        }
        println!();
    }

    Ok(())
}

async fn ask(config_path: &Path, question: &str) -> Result<()> {
    let runtime = bootstrap(config_path).await?;
    let answer = runtime
        .orchestrator()
        .answer(question)
        .await
        .context("Failed to answer question")?;

    print_answer(&answer);
    Ok(())
}

fn print_answer(answer: &Answer) {
    match answer {
        Answer::NoSupport => println!("{}", answer.to_string().yellow()),
        Answer::Answered { reply, .. } => {
            println!("{reply}");
            if let Some(citation) = answer.citation_line() {
                println!();
                println!("{}", citation.dimmed());
            }
        }
    }
}

fn show_config(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let pipeline = config.pipeline();

    println!("{}", "Current Configuration:".bold().green());
    println!();
    println!("{}", "Model:".bold());
    println!("  Name:           {}", config.model.name.cyan());
    println!("  Base URL:       {}", config.llm.base_url);
    println!("  Temperature:    {}", config.llm.temperature);
    println!("  Context Tokens: {}", config.llm.context_tokens);
    if let Some(threads) = config.llm.num_threads {
        println!("  Threads:        {threads}");
    }
    println!();
    println!("{}", "Wiki:".bold());
    println!("  ZIM:            {}", config.wiki.zim.display());
    println!("  Address:        {}:{}", config.wiki.bind, config.wiki.kiwix_port);
    println!();
    println!("{}", "Retrieval:".bold());
    println!("  Top K:          {}", pipeline.k);
    println!("  Max Articles:   {}", pipeline.max_articles);
    println!("  Rerank:         {}", pipeline.rerank_enabled);
    if pipeline.rerank_enabled {
        println!("  Reranker Model: {}", config.reranker.onnx_model.display());
        println!("  Tokenizer:      {}", config.reranker.tokenizer.display());
        println!("  Max Seq Len:    {}", pipeline.max_seq_len);
    }

    Ok(())
}

async fn list_models(config_path: &Path, url: Option<String>) -> Result<()> {
    let base_url = match url {
        Some(url) => url,
        None => load_config(config_path)?.llm.base_url,
    };
    let endpoint = ServiceEndpoint::from_url(&base_url, "/api/tags")
        .context("Invalid Ollama URL")?;
    let client = GenerationClient::new(reqwest::Client::new(), &endpoint);

    println!("{} Fetching models from {}...", "→".blue(), base_url);
    println!();

    let models = client
        .list_models()
        .await
        .context("Failed to connect to Ollama. Is it running?")?;

    if models.is_empty() {
        println!("{}", "No models found. Start a session to pull the configured model".yellow());
        return Ok(());
    }

    println!("{}", "Available models:".bold().green());
    println!();

    for model in models {
        let size_gb = model.size as f64 / (1024.0 * 1024.0 * 1024.0);
        println!("  {} {} ({:.2} GB)", "•".cyan(), model.name.bold(), size_gb);
    }

    Ok(())
}
