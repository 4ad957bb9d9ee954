use std::collections::BTreeMap;
use std::fs;

use chrono::{DateTime, Utc};
use rmpv::Value;

use crate::orchestrator::Controller;
use crate::wire::envelope::PayloadMap;

const PROC_STATUS_PATH: &str = "/proc/self/status";

/// Document returned for an operator STATUS request.
pub fn build_status_payload(controller: &Controller, now: DateTime<Utc>) -> PayloadMap {
    let mut payload = PayloadMap::new();
    payload.insert(
        "application".to_owned(),
        application_status(controller.started_at(), now),
    );
    payload.insert("memory".to_owned(), memory_stats());
    payload.insert(
        "heartbeat".to_owned(),
        crate::wire::codec::json_value_to_rmpv(&controller.heartbeat_policy().metadata_payload()),
    );
    payload.insert("peers".to_owned(), counters(controller.peers().count_by_role()));
    payload.insert("nodes".to_owned(), counters(controller.nodes().count_by_status()));
    payload.insert("jobs".to_owned(), counters(controller.jobs().count_by_state()));
    payload.insert("connections".to_owned(), connections(controller));
    payload
}

/// One entry per live peer, in accept order.
fn connections(controller: &Controller) -> Value {
    let peers = controller.peers();
    Value::Array(
        peers
            .ids()
            .into_iter()
            .filter_map(|peer_id| peers.get(peer_id))
            .map(|peer| {
                Value::Map(vec![
                    entry("peer_id", Value::from(peer.id())),
                    entry("role", Value::String(peer.role().as_str().into())),
                    entry("remote_addr", Value::String(peer.remote_addr().into())),
                    entry("connected_at", Value::String(peer.connected_at().to_rfc3339().into())),
                    entry("node", peer.node_name().map_or(Value::Nil, |name| Value::String(name.into()))),
                    entry("pending_calls", Value::from(peer.pending_call_count() as u64)),
                ])
            })
            .collect(),
    )
}

pub fn application_status(started_at: DateTime<Utc>, now: DateTime<Utc>) -> Value {
    let uptime_seconds = (now - started_at).num_seconds().max(0);
    Value::Map(vec![
        entry("name", Value::String(env!("CARGO_PKG_NAME").into())),
        entry("version", Value::String(env!("CARGO_PKG_VERSION").into())),
        entry(
            "build_date_utc",
            Value::String(env!("CONVOY_BUILD_DATE_UTC").into()),
        ),
        entry(
            "git_revision",
            Value::String(env!("CONVOY_GIT_REVISION").into()),
        ),
        entry("started_at", Value::String(started_at.to_rfc3339().into())),
        entry("now", Value::String(now.to_rfc3339().into())),
        entry("uptime_seconds", Value::Integer(uptime_seconds.into())),
        entry("pid", Value::Integer(i64::from(std::process::id()).into())),
    ])
}

pub fn memory_stats() -> Value {
    let status = fs::read_to_string(PROC_STATUS_PATH).unwrap_or_default();
    let (vm_rss_kb, vm_size_kb, vm_peak_kb) = parse_memory_fields(&status);

    Value::Map(vec![
        entry("source", Value::String(PROC_STATUS_PATH.into())),
        entry(
            "available",
            Value::Boolean(vm_rss_kb.is_some() || vm_size_kb.is_some() || vm_peak_kb.is_some()),
        ),
        entry("vm_rss_kb", optional_integer(vm_rss_kb)),
        entry("vm_size_kb", optional_integer(vm_size_kb)),
        entry("vm_peak_kb", optional_integer(vm_peak_kb)),
    ])
}

fn parse_memory_fields(status: &str) -> (Option<i64>, Option<i64>, Option<i64>) {
    let mut vm_rss_kb = None;
    let mut vm_size_kb = None;
    let mut vm_peak_kb = None;
    for line in status.lines() {
        if line.starts_with("VmRSS:") {
            vm_rss_kb = parse_kb_field(line);
        } else if line.starts_with("VmSize:") {
            vm_size_kb = parse_kb_field(line);
        } else if line.starts_with("VmPeak:") {
            vm_peak_kb = parse_kb_field(line);
        }
    }
    (vm_rss_kb, vm_size_kb, vm_peak_kb)
}

fn parse_kb_field(line: &str) -> Option<i64> {
    line.split_whitespace().nth(1)?.parse::<i64>().ok()
}

fn counters(counts: BTreeMap<&'static str, usize>) -> Value {
    let total: usize = counts.values().sum();
    let mut fields: Vec<(Value, Value)> = counts
        .into_iter()
        .map(|(name, count)| entry(name, Value::from(count as u64)))
        .collect();
    fields.push(entry("total", Value::from(total as u64)));
    Value::Map(fields)
}

fn optional_integer(value: Option<i64>) -> Value {
    value.map_or(Value::Nil, |v| Value::Integer(v.into()))
}

fn entry(key: &str, value: Value) -> (Value, Value) {
    (Value::String(key.into()), value)
}
