//! Output formatting for batch results and persisted state

use anyhow::Result;
use serde_json::json;
use std::time::Duration;

use flagrun_common::{format_duration, FailureCounters, ProcessedSet, TaskResult};

const DETAIL_WIDTH: usize = 48;

/// Print batch results in the specified format
pub fn print_results(results: &[TaskResult], format: &str, elapsed: Duration) -> Result<()> {
    match format.trim().to_lowercase().as_str() {
        "json" | "j" => println!("{}", results_json(results, elapsed)?),
        _ => print_table(results, elapsed),
    }
    Ok(())
}

fn print_table(results: &[TaskResult], elapsed: Duration) {
    if results.is_empty() {
        println!("\nNo results to display.\n");
        return;
    }

    println!("\n{:-<100}", "");
    println!("{:<44} {:<8} {:<48}", "URL", "SOLVED", "FLAG / DETAIL");
    println!("{:-<100}", "");

    let mut solved = 0;
    let mut timed_out = 0;
    for result in results {
        if result.flag_found {
            solved += 1;
        } else if result.is_timeout() {
            timed_out += 1;
        }
        println!(
            "{:<44} {:<8} {:<48}",
            result.url,
            if result.flag_found { "yes" } else { "no" },
            detail(&result.flag_content)
        );
    }

    println!("{:-<100}", "");
    println!("\nSummary:");
    println!("  Total challenges: {}", results.len());
    println!("  Solved: {}", solved);
    println!("  Timed out: {}", timed_out);
    println!("  Duration: {}", format_duration(elapsed));
    println!();
}

/// First line of the content, shortened to fit the table.
fn detail(content: &str) -> String {
    let line = content.lines().next().unwrap_or("").trim();
    if line.chars().count() > DETAIL_WIDTH {
        let cut: String = line.chars().take(DETAIL_WIDTH - 3).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}

fn results_json(results: &[TaskResult], elapsed: Duration) -> Result<String> {
    let solved = results.iter().filter(|r| r.flag_found).count();
    let output = json!({
        "run_info": {
            "duration_seconds": elapsed.as_secs_f64(),
            "duration_formatted": format_duration(elapsed),
            "total": results.len(),
            "solved": solved,
        },
        "results": results,
    });
    Ok(serde_json::to_string_pretty(&output)?)
}

/// Print the persisted failure counters and processed set
pub fn print_status(counters: &FailureCounters, processed: &ProcessedSet, format: &str) -> Result<()> {
    if format.trim().eq_ignore_ascii_case("json") {
        let output = json!({
            "failure_counts": counters,
            "processed": processed,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("\nFailure counters by code:");
    if counters.by_code.is_empty() {
        println!("  (none)");
    }
    for (code, count) in &counters.by_code {
        println!("  {:<40} {}", code, count);
    }
    println!("\nFailure counters by url:");
    if counters.by_url.is_empty() {
        println!("  (none)");
    }
    for (url, count) in &counters.by_url {
        println!("  {:<60} {}", url, count);
    }
    println!(
        "\nProcessed: {} codes, {} urls\n",
        processed.processed_codes.len(),
        processed.processed_urls.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_output_lists_results() {
        let results = vec![
            TaskResult::found("http://a", "flag{x}"),
            TaskResult::timeout("http://b"),
        ];
        let text = results_json(&results, Duration::from_secs(2)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["run_info"]["solved"], 1);
        assert_eq!(value["results"][1]["flag_content"], "execution timeout");
    }

    #[test]
    fn detail_is_shortened() {
        assert_eq!(detail("flag{x}\nmore"), "flag{x}");
        let long = "x".repeat(100);
        let shown = detail(&long);
        assert_eq!(shown.chars().count(), DETAIL_WIDTH);
        assert!(shown.ends_with("..."));
    }

    #[test]
    fn printing_does_not_fail() {
        let results = vec![TaskResult::failed("http://a", "no flag")];
        print_results(&results, "text", Duration::from_millis(20)).unwrap();
        print_results(&[], "text", Duration::ZERO).unwrap();

        let mut counters = FailureCounters::new();
        counters.record(Some("1"), "http://a", false);
        print_status(&counters, &ProcessedSet::new(), "text").unwrap();
        print_status(&counters, &ProcessedSet::new(), "json").unwrap();
    }
}
