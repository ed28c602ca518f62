//! Output formatting and terminal rendering

use std::path::Path;

use colored::Colorize;
use locaited::{
    CacheStats, DiscoveryResponse, Event, LedgerTotals, ResponseStatus, StageReport, WorkflowEvent,
};

/// Truncate to `max` characters, marking the cut with an ellipsis
fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let kept: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    } else {
        text.to_string()
    }
}

/// Print a section header
pub fn print_header(text: &str) {
    println!();
    println!("{}", format!("▶ {}", text).bright_yellow().bold());
    println!("{}", "─".repeat(60).dimmed());
}

pub fn print_success(text: &str) {
    println!("{} {}", "✓".bright_green(), text.bright_white());
}

pub fn print_error(text: &str) {
    println!("{} {}", "✗".bright_red(), text.bright_red());
}

pub fn print_warning(text: &str) {
    println!("{} {}", "⚠".bright_yellow(), text.yellow());
}

pub fn print_info(text: &str) {
    println!("{} {}", "ℹ".bright_blue(), text);
}

/// One line of live progress from the workflow event stream
pub fn print_progress(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::RunStarted {
            location, interests, ..
        } => print_info(&format!(
            "Searching {} for {}",
            location,
            interests.join(", ")
        )),
        WorkflowEvent::StageCompleted {
            stage,
            summary,
            metrics,
            duration_ms,
            ..
        } => println!(
            "  {} {:<18} {} {}",
            "•".bright_cyan(),
            stage.display_name(),
            summary,
            format!(
                "({} calls, {} cached, ${:.4}, {}ms)",
                metrics.calls, metrics.cache_hits, metrics.cost_usd, duration_ms
            )
            .dimmed()
        ),
        WorkflowEvent::StageFailed { stage, error, .. } => {
            print_error(&format!("{} failed: {}", stage.display_name(), error))
        }
        WorkflowEvent::CycleRetry {
            cycle,
            iteration,
            feedback,
            ..
        } => print_warning(&format!("{:?} retry #{}: {}", cycle, iteration, feedback)),
        WorkflowEvent::RunFinished { .. } => {}
    }
}

/// Stage report shown while stepping
pub fn print_stage_report(report: &StageReport) {
    print_header(&format!(
        "{} (pass {}, retry {})",
        report.stage.display_name(),
        report.outer_iteration,
        report.inner_iteration
    ));
    if report.success {
        print_success(&report.summary);
    } else {
        print_error(&report.summary);
    }
    if report.budget_exhausted {
        print_warning("Budget exhausted during this stage");
    }
    println!(
        "  {} {} calls, {} cached, {} tokens, ${:.4}, {}ms",
        "Spend:".dimmed(),
        report.metrics.calls,
        report.metrics.cache_hits,
        report.metrics.tokens,
        report.metrics.cost_usd,
        report.execution_time_ms
    );
}

/// Print the ranked events table
pub fn print_events_table(events: &[Event]) {
    println!();
    println!(
        "{}",
        format!(
            "{:>5}  {:<40} {:<12} {:<8} {:<28}",
            "Score", "Title", "Date", "Time", "Location"
        )
        .bright_white()
        .bold()
    );
    println!("{}", "─".repeat(98).dimmed());

    for event in events {
        let score = format!("{:>5}", event.score);
        let score_colored = match event.score {
            80..=100 => score.bright_green(),
            60..=79 => score.bright_yellow(),
            _ => score.normal(),
        };
        println!(
            "{}  {:<40} {:<12} {:<8} {:<28}",
            score_colored,
            truncate(&event.title, 40).bright_white(),
            event.date,
            event.time.as_deref().unwrap_or("-"),
            truncate(&event.location, 28).dimmed()
        );
        if let Some(url) = &event.source_url {
            println!("       {}", url.bright_blue());
        }
    }
    println!();
}

/// Print the run summary: outcome, iterations and spend
pub fn print_response(response: &DiscoveryResponse) {
    print_header("Results");
    match response.status {
        ResponseStatus::Success => print_success(&response.message),
        ResponseStatus::NoResults => print_warning(&response.message),
        ResponseStatus::Error => print_error(&response.message),
    }
    if !response.events.is_empty() {
        print_events_table(&response.events);
    }
    println!(
        "  {} ${:.4} | {} {} | {} outer {}, inner {}",
        "Cost:".dimmed(),
        response.cost_usd,
        "Cache hits:".dimmed(),
        response.cache_hits,
        "Retries:".dimmed(),
        response.outer_iteration,
        response.inner_iteration
    );
    println!("  {} {}", "Run:".dimmed(), response.run_id.to_string().dimmed());
}

/// Per-stage spend of a run
pub fn print_cost_breakdown(totals: &LedgerTotals) {
    if totals.per_stage.is_empty() {
        return;
    }
    println!();
    println!(
        "{}",
        format!("{:<18} {:>6} {:>7} {:>9} {:>10}", "Stage", "Calls", "Cached", "Tokens", "Cost")
            .bright_white()
            .bold()
    );
    for (stage, metrics) in &totals.per_stage {
        println!(
            "{:<18} {:>6} {:>7} {:>9} {:>10}",
            stage.display_name(),
            metrics.calls,
            metrics.cache_hits,
            metrics.tokens,
            format!("${:.4}", metrics.cost_usd).bright_cyan()
        );
    }
}

/// Entry count and hit statistics of the result cache
pub fn print_cache_stats(stats: &CacheStats, directory: Option<&Path>) {
    match directory {
        Some(dir) => println!("  {} {}", "Directory:".dimmed(), dir.display()),
        None => print_warning("Persistence disabled; results are kept in memory for one run only"),
    }
    println!(
        "  {} {}",
        "Entries:".dimmed(),
        stats.entry_count.to_string().bright_white().bold()
    );
    println!(
        "  {} {} hits, {} misses ({:.0}% hit rate)",
        "Lookups:".dimmed(),
        stats.hits,
        stats.misses,
        stats.hit_rate * 100.0
    );
}
