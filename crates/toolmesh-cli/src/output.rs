//! Table and JSON rendering

use comfy_table::{Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use serde_json::{Value, json};
use toolmesh_core::discovery::DescribeReport;
use toolmesh_core::{AggregatedResult, AttemptFailure, Execution, MeshClient};

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header);
    table
}

fn millis(d: std::time::Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

pub fn print_servers(client: &MeshClient) {
    let servers = client.servers();
    if servers.is_empty() {
        println!("No servers registered");
        return;
    }

    let mut table = table(vec![
        "Server", "Status", "Address", "Capabilities", "Pool", "Circuit", "EMA ms",
    ]);
    for server in &servers {
        let pool = client.pool_stats(&server.id).map_or_else(
            || "-".to_string(),
            |s| format!("{}/{} ({} idle)", s.live, s.max, s.idle),
        );
        let capabilities: Vec<&str> = server.capabilities.iter().map(String::as_str).collect();
        table.add_row(vec![
            server.id.clone(),
            server.status.to_string(),
            server.address.describe(),
            capabilities.join(", "),
            pool,
            client.circuit_state(&server.id).to_string(),
            server
                .ema_latency_ms
                .map_or_else(|| "-".to_string(), |ms| format!("{ms:.1}")),
        ]);
    }
    println!("{table}");
}

pub fn print_discovery(reports: &[DescribeReport]) {
    if reports.is_empty() {
        println!("No pooled servers to ask");
        return;
    }

    let mut table = table(vec!["Server", "Tools", "New", "Latency ms", "Error"]);
    for report in reports {
        let tools: Vec<&str> = report.tool_names().collect();
        table.add_row(vec![
            report.server_id.clone(),
            tools.join(", "),
            report.added.to_string(),
            format!("{:.1}", millis(report.latency)),
            report
                .error
                .as_ref()
                .map_or_else(|| "-".to_string(), ToString::to_string),
        ]);
    }
    println!("{table}");
}

fn failure_json(failure: &AttemptFailure) -> Value {
    json!({
        "server": failure.server_id,
        "latencyMs": millis(failure.latency),
        "error": failure.error.to_string(),
    })
}

pub fn execution_json(done: &Execution) -> Value {
    json!({
        "server": done.server_id,
        "latencyMs": millis(done.latency),
        "failedAttempts": done.failed_attempts.iter().map(failure_json).collect::<Vec<_>>(),
        "result": done.result,
    })
}

pub fn aggregated_json(aggregated: &AggregatedResult) -> Value {
    let successes: Vec<Value> = aggregated
        .successes
        .iter()
        .map(|s| {
            json!({
                "server": s.server_id,
                "latencyMs": millis(s.latency),
                "score": s.score,
                "result": s.result,
            })
        })
        .collect();

    json!({
        "capability": aggregated.capability,
        "selected": aggregated.best().map(|s| s.server_id.clone()),
        "mergedContent": aggregated.merged_content(),
        "successes": successes,
        "failures": aggregated.failures.iter().map(failure_json).collect::<Vec<_>>(),
        "cancelled": aggregated.cancelled,
    })
}
