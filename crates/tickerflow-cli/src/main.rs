//! Command-line front end for the tickerflow pipeline
//!
//! Runs one analysis for a ticker, prints each stage transition and the final
//! result, and optionally drops into a chat session grounded in it.
//!
//! # Usage
//!
//! ```bash
//! export OPENAI_API_KEY="sk-..."
//! export OPENAI_API_BASE="http://localhost:1234/v1"   # optional
//! export TICKERFLOW_MODEL="gpt-4o-mini"              # optional
//!
//! cargo run -p tickerflow-cli -- AAPL --full-narrative --chat
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tickerflow_llm::LLMProvider;
use tickerflow_llm::providers::OpenAIProvider;
use tickerflow_pipeline::stages::{
    LlmBackend, LlmChatResponder, LlmIndicatorDeriver, LlmNarrativeAnalyzer, PivotPointDeriver,
    StagePayload, YahooMarketDataFetcher,
};
use tickerflow_pipeline::{
    IndicatorDeriver, Orchestrator, OrchestratorHandle, PipelineConfig, PipelineError,
    PipelineSnapshot, PipelineStage, Sender, StageSet,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tickerflow")]
#[command(about = "Fetch, derive and analyze a ticker with an LLM", long_about = None)]
struct Args {
    /// Ticker symbol, e.g. AAPL, BRK.B or ^GSPC
    ticker: String,

    /// Follow the analysis with an automatic comprehensive chat turn
    #[arg(long)]
    full_narrative: bool,

    /// Compute pivot levels locally instead of asking the model
    #[arg(long)]
    local_pivots: bool,

    /// Enter an interactive chat session once the analysis settles
    #[arg(long)]
    chat: bool,

    /// Print the final snapshot as JSON
    #[arg(long)]
    json: bool,

    /// Override the generation model
    #[arg(short, long)]
    model: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tickerflow_utils::init_tracing();

    let args = Args::parse();

    let mut config = PipelineConfig::from_env().context("Invalid pipeline configuration")?;
    if let Some(model) = args.model.clone() {
        config.model = model;
        config.validate()?;
    }

    let provider: Arc<dyn LLMProvider> = Arc::new(
        OpenAIProvider::from_env().context("Failed to configure the OpenAI-compatible provider")?,
    );
    info!(model = %config.model, local_pivots = args.local_pivots, "Starting tickerflow");

    let stages = build_stages(provider, &config, args.local_pivots)?;
    let handle = Orchestrator::spawn(config, stages)?;

    let progress = (!args.json).then(|| spawn_progress_printer(&handle));

    handle
        .submit_top_level_request(&args.ticker, args.full_narrative)
        .await?;
    let snapshot = handle
        .wait_until(|s| s.session.stage().is_terminal() && !s.chat_pending)
        .await?;

    if let Some(progress) = progress {
        progress.abort();
    }

    if args.json {
        println!("{}", snapshot.to_json()?);
    } else {
        print_report(&snapshot);
    }

    if args.chat {
        run_chat(&handle).await?;
    }

    handle.shutdown().await?;
    Ok(())
}

fn build_stages(
    provider: Arc<dyn LLMProvider>,
    config: &PipelineConfig,
    local_pivots: bool,
) -> Result<StageSet> {
    let backend = LlmBackend::new(provider, config)?;

    let deriver: Arc<dyn IndicatorDeriver> = if local_pivots {
        Arc::new(PivotPointDeriver::new())
    } else {
        Arc::new(LlmIndicatorDeriver::new(Arc::clone(&backend)))
    };

    Ok(StageSet::new(
        Arc::new(YahooMarketDataFetcher::new(config)?),
        deriver,
        Arc::new(LlmNarrativeAnalyzer::new(Arc::clone(&backend))),
        Arc::new(LlmChatResponder::new(backend)),
    ))
}

/// Print every stage transition as it is published
fn spawn_progress_printer(handle: &OrchestratorHandle) -> tokio::task::JoinHandle<()> {
    let mut updates = handle.subscribe();
    tokio::spawn(async move {
        let mut last = PipelineStage::Idle;
        while updates.changed().await.is_ok() {
            let stage = updates.borrow_and_update().session.stage();
            if stage != last {
                println!("  -> {stage}");
                last = stage;
            }
        }
    })
}

fn print_report(snapshot: &PipelineSnapshot) {
    let session = &snapshot.session;
    println!();

    if let Some(failure) = session.failure() {
        println!("{failure}");
    }

    if let Some(data) = session.fetch().and_then(|record| record.payload()) {
        println!("Market data:  {}", data.summary());
    }
    if let Some(derived) = session.derive().and_then(|record| record.payload()) {
        println!("Levels:       {}", derived.summary());
    }
    if let Some(takeaways) = session.analyze().and_then(|record| record.payload()) {
        println!("Takeaways:");
        println!("{}", takeaways.summary());
    }

    if let Some(reply) = snapshot.last_reply() {
        println!();
        println!("{}", reply.text);
    }

    print_stats(snapshot);
}

fn print_stats(snapshot: &PipelineSnapshot) {
    let stats = &snapshot.stats;
    println!();
    println!(
        "Usage: {} calls, {} input / {} output units, ${:.4}",
        stats.call_count, stats.total_input_units, stats.total_output_units, stats.total_cost
    );
}

fn print_chat_help() {
    println!();
    println!("Chat about the analysis. Commands:");
    println!("  /clear  - clear the transcript");
    println!("  /stats  - show usage so far");
    println!("  /exit   - quit");
    println!();
}

async fn run_chat(handle: &OrchestratorHandle) -> Result<()> {
    print_chat_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"you> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();

        match input {
            "" => continue,
            "/exit" | "/quit" => break,
            "/clear" => {
                handle.clear_chat_transcript().await?;
                println!("Transcript cleared.");
                continue;
            }
            "/stats" => {
                print_stats(&handle.snapshot());
                continue;
            }
            "/help" => {
                print_chat_help();
                continue;
            }
            _ => {}
        }

        match handle.submit_chat_turn(input).await {
            Ok(()) => {}
            Err(PipelineError::ChatBusy) => {
                println!("Still waiting on the previous reply.");
                continue;
            }
            Err(err) => {
                warn!(error = %err, "Chat turn rejected");
                println!("Error: {err}");
                continue;
            }
        }

        let snapshot = handle.wait_until(|s| !s.chat_pending).await?;
        let reply = snapshot
            .transcript
            .last()
            .filter(|turn| turn.sender == Sender::Assistant);
        match reply {
            Some(turn) if turn.is_error => println!("error> {}", turn.text),
            Some(turn) => println!("bot> {}", turn.text),
            None => println!("bot> (no reply)"),
        }
    }

    Ok(())
}
