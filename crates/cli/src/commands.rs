//! CLI subcommand handlers

use std::{
    io::{self, BufRead, Write},
    path::Path,
    sync::Arc,
};

use anyhow::{Context, Result};
use colored::Colorize;
use locaited::{
    initialize_locaited, workflow::stepping, AppConfig, CacheStore, DiscoveryRequest,
    DiscoveryResponse,
};
use tokio_util::sync::CancellationToken;

use crate::{config, output, DiscoverArgs};

/// What the user typed at a step prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepInput {
    Continue,
    Stop,
}

fn parse_step_input(line: &str) -> StepInput {
    match line.trim().to_lowercase().as_str() {
        "q" | "quit" | "stop" => StepInput::Stop,
        _ => StepInput::Continue,
    }
}

/// Block on stdin for one step answer; EOF stops the run
fn read_step_input() -> StepInput {
    print!("{} ", "[Enter] continue, [q] stop:".dimmed());
    let _ = io::stdout().flush();
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => StepInput::Stop,
        Ok(_) => parse_step_input(&line),
    }
}

fn build_request(args: &DiscoverArgs) -> DiscoveryRequest {
    let mut request =
        DiscoveryRequest::new(args.location.clone(), args.days, args.interests.clone())
            .with_cache(!args.no_cache);
    if let Some(query) = &args.query {
        request = request.with_query(query.clone());
    }
    request
}

/// Run one discovery request and print the outcome
pub async fn discover(config: AppConfig, args: DiscoverArgs) -> Result<()> {
    let config = config::apply_flags(config, &args);
    let min_score = config.workflow.min_event_score;
    let mut orchestrator =
        initialize_locaited(config)
            .await
            .context("Failed to initialize the discovery engine")?;

    let controller = if args.step {
        let (observer, mut handle) = stepping();
        orchestrator = orchestrator.with_observer(Arc::new(observer));
        Some(tokio::spawn(async move {
            while let Some(report) = handle.next_report().await {
                output::print_stage_report(&report);
                let input = tokio::task::spawn_blocking(read_step_input)
                    .await
                    .unwrap_or(StepInput::Stop);
                match input {
                    StepInput::Continue => handle.resume().await,
                    StepInput::Stop => handle.stop().await,
                }
            }
        }))
    } else {
        None
    };

    let progress = if args.json || args.step {
        None
    } else {
        let mut events = orchestrator.subscribe();
        Some(tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                output::print_progress(&event);
            }
        }))
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling run");
            on_interrupt.cancel();
        }
    });

    let outcome = orchestrator.run(build_request(&args), cancel).await;
    let totals = outcome.state.metrics.clone();
    let response = DiscoveryResponse::from_outcome(outcome, min_score);

    // Dropping the orchestrator closes the observer and event channels
    drop(orchestrator);
    if let Some(controller) = controller {
        let _ = controller.await;
    }
    if let Some(progress) = progress {
        let _ = progress.await;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        output::print_response(&response);
        output::print_cost_breakdown(&totals);
    }

    Ok(())
}

/// Print the effective configuration
pub fn show_config(config: &AppConfig, path: Option<&Path>) -> Result<()> {
    output::print_header("Configuration");
    match path {
        Some(path) => output::print_info(&format!("Loaded from {}", path.display())),
        None => output::print_info("Defaults, ./locaited.toml and LOCAITED__* overrides"),
    }
    println!();
    println!("{}", config::render(config)?);
    Ok(())
}

async fn open_cache(config: &AppConfig) -> Result<CacheStore> {
    let store = CacheStore::open(&config.cache)
        .await
        .with_context(|| format!("Failed to open cache at {}", config.cache.directory.display()))?;
    store.purge_expired().await?;
    Ok(store)
}

/// Print statistics for the configured result cache
pub async fn cache_stats(config: &AppConfig) -> Result<()> {
    let store = open_cache(config).await?;
    output::print_header("Result cache");
    output::print_cache_stats(&store.stats(), store.directory());
    Ok(())
}

/// Delete every cached result
pub async fn cache_clear(config: &AppConfig) -> Result<()> {
    let store = open_cache(config).await?;
    let cleared = store.stats().entry_count;
    store.invalidate_all().await.context("Failed to clear the cache")?;
    output::print_success(&format!("Cleared {} cached results", cleared));
    Ok(())
}
