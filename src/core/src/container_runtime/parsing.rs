//! Decoding of the `docker` client's `{{json .}}` output.

use std::collections::HashMap;

use serde::Deserialize;

use super::types::{ContainerInfo, ResourceStats, RuntimeEvent};
use crate::error_handling::types::RuntimeError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    running: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectOutput {
    id: String,
    name: String,
    state: InspectState,
    #[serde(default)]
    config: InspectConfig,
}

pub fn parse_inspect(line: &str) -> Result<ContainerInfo, RuntimeError> {
    let output: InspectOutput = serde_json::from_str(strip_to_json(line))?;
    Ok(ContainerInfo {
        id: output.id,
        name: output.name.trim_start_matches('/').to_string(),
        running: output.state.running,
        labels: output.config.labels.unwrap_or_default(),
    })
}

#[derive(Debug, Deserialize)]
struct PsOutput {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

pub fn parse_ps_line(line: &str) -> Result<ContainerInfo, RuntimeError> {
    let output: PsOutput = serde_json::from_str(strip_to_json(line))?;
    let name = output
        .names
        .split(',')
        .next()
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_string();
    Ok(ContainerInfo {
        id: output.id,
        name,
        running: output.state.eq_ignore_ascii_case("running"),
        labels: parse_labels(&output.labels),
    })
}

/// Parses the `k=v,k2=v2` label list printed by `docker ps`.
pub fn parse_labels(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

#[derive(Debug, Default, Deserialize)]
struct EventActor {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct EventOutput {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Actor", default)]
    actor: EventActor,
    #[serde(rename = "id", default)]
    legacy_id: String,
}

pub fn parse_event_line(line: &str) -> Result<RuntimeEvent, RuntimeError> {
    let output: EventOutput = serde_json::from_str(strip_to_json(line))?;
    let actor_id = if output.actor.id.is_empty() {
        output.legacy_id
    } else {
        output.actor.id
    };
    // Health checks report as "exec_start: <cmd>"; keep only the verb.
    let action = output
        .action
        .split(':')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    Ok(RuntimeEvent {
        kind: output.kind,
        actor_id,
        action,
        attributes: output.actor.attributes,
    })
}

#[derive(Debug, Deserialize)]
struct StatsOutput {
    #[serde(rename = "CPUPerc", default)]
    cpu: String,
    #[serde(rename = "MemUsage", default)]
    memory: String,
    #[serde(rename = "NetIO", default)]
    net: String,
    #[serde(rename = "BlockIO", default)]
    block: String,
}

pub fn parse_stats_line(line: &str) -> Result<ResourceStats, RuntimeError> {
    let output: StatsOutput = serde_json::from_str(strip_to_json(line))?;
    let (memory_used, memory_total) = parse_pair(&output.memory)?;
    let (net_read, net_write) = parse_pair(&output.net)?;
    let (io_read, io_write) = parse_pair(&output.block)?;
    let cpu_usage = output
        .cpu
        .trim()
        .trim_end_matches('%')
        .parse::<f64>()
        .unwrap_or(0.0);

    Ok(ResourceStats {
        memory_usage_mb: memory_used / 1024 / 1024,
        memory_total_mb: memory_total / 1024 / 1024,
        cpu_usage,
        io_read_kb: io_read / 1024,
        io_write_kb: io_write / 1024,
        net_read_kb: net_read / 1024,
        net_write_kb: net_write / 1024,
    })
}

fn parse_pair(raw: &str) -> Result<(u64, u64), RuntimeError> {
    let (left, right) = raw
        .split_once('/')
        .ok_or_else(|| RuntimeError::Parse(format!("expected `a / b`, got `{}`", raw)))?;
    let left = parse_size(left).ok_or_else(|| RuntimeError::Parse(left.trim().to_string()))?;
    let right = parse_size(right).ok_or_else(|| RuntimeError::Parse(right.trim().to_string()))?;
    Ok((left, right))
}

/// Parses human readable sizes like `12.5MiB`, `648B` or `1.2kB` into bytes.
pub fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let number: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1_000.0,
        "KiB" => 1_024.0,
        "MB" => 1_000_000.0,
        "MiB" => 1_048_576.0,
        "GB" => 1_000_000_000.0,
        "GiB" => 1_073_741_824.0,
        "TB" => 1_000_000_000_000.0,
        "TiB" => 1_099_511_627_776.0,
        _ => return None,
    };
    Some((number * multiplier) as u64)
}

/// Drops anything before the first `{`, such as the terminal control
/// sequences `docker stats` emits between samples.
pub fn strip_to_json(line: &str) -> &str {
    match line.find('{') {
        Some(start) => &line[start..],
        None => line,
    }
}
