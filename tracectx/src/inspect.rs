// Offline views of the correlation maps and of single frames.

use std::path::Path;

use anyhow::{Context, Result, anyhow, ensure};
use aya::maps::{HashMap, Map, MapData};
use serde_json::{Map as JsonMap, Number as JsonNumber, Value};

use tracectx_common::conn::{ipv4_checksum_ok, read_frame};
use tracectx_common::host::{FrameBuf, HostMaps, StaticSockets};
use tracectx_common::inject::Injection;
use tracectx_common::{
    ConnectionInfo, ContextMap, ContextState, Dispatcher, EgressKey, INCOMING_TRACE_MAP,
    InsertMode, OUTGOING_TRACE_MAP, Outcome, TracePidInfo,
};

/// Parses a hex string, ignoring whitespace and `:` separators.
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let digits: String = input
        .chars()
        .filter(|c| !c.is_ascii_whitespace() && *c != ':')
        .collect();
    hex::decode(&digits).with_context(|| format!("invalid hex input {digits:?}"))
}

pub fn parse_trace_id(input: &str) -> Result<[u8; 16]> {
    ensure!(
        input.len() == 32,
        "trace id must be 32 hex characters, got {}",
        input.len()
    );
    let mut trace_id = [0u8; 16];
    hex::decode_to_slice(input, &mut trace_id)
        .with_context(|| format!("invalid trace id {input:?}"))?;
    ensure!(trace_id != [0u8; 16], "trace id must not be all zeros");
    Ok(trace_id)
}

fn state_name(state: ContextState) -> &'static str {
    match state {
        ContextState::Consumed => "consumed",
        ContextState::Pending => "pending",
        ContextState::SpanAssigned => "span_assigned",
    }
}

fn entry_json(info: &TracePidInfo) -> JsonMap<String, Value> {
    let mut obj = JsonMap::new();
    obj.insert("trace_id".to_string(), Value::String(hex::encode(info.tp.trace_id)));
    obj.insert("span_id".to_string(), Value::String(hex::encode(info.tp.span_id)));
    obj.insert("pid".to_string(), Value::Number(JsonNumber::from(info.pid)));
    obj.insert(
        "state".to_string(),
        Value::String(state_name(info.state()).to_string()),
    );
    obj.insert("written".to_string(), Value::Bool(info.written_by_l7()));
    obj
}

fn outgoing_json(key: &EgressKey, info: &TracePidInfo) -> Value {
    let mut obj = entry_json(info);
    obj.insert("s_port".to_string(), Value::Number(JsonNumber::from(key.s_port)));
    obj.insert("d_port".to_string(), Value::Number(JsonNumber::from(key.d_port)));
    Value::Object(obj)
}

fn incoming_json(conn: &ConnectionInfo, info: &TracePidInfo) -> Value {
    let mut obj = entry_json(info);
    obj.insert("connection".to_string(), Value::String(conn.to_string()));
    Value::Object(obj)
}

fn open_pinned(pin_dir: &Path, name: &str) -> Result<Map> {
    let path = pin_dir.join(name);
    let map_data = MapData::from_pin(&path)
        .map_err(|e| anyhow!("failed to open pinned map {}: {}", path.display(), e))?;
    Map::from_map_data(map_data).map_err(|e| anyhow!("invalid map type: {}", e))
}

/// Dumps the pinned outgoing context map as a JSON array.
pub fn dump_outgoing(pin_dir: &Path) -> Result<Value> {
    let map = HashMap::<_, EgressKey, TracePidInfo>::try_from(open_pinned(
        pin_dir,
        OUTGOING_TRACE_MAP,
    )?)
    .map_err(|e| anyhow!("failed to convert to HashMap: {}", e))?;

    let mut entries = Vec::new();
    for item in map.iter() {
        let (key, info) = item.map_err(|e| anyhow!("aya iter error: {}", e))?;
        entries.push(outgoing_json(&key, &info));
    }
    Ok(Value::Array(entries))
}

/// Dumps the pinned incoming context map as a JSON array.
pub fn dump_incoming(pin_dir: &Path) -> Result<Value> {
    let map = HashMap::<_, ConnectionInfo, TracePidInfo>::try_from(open_pinned(
        pin_dir,
        INCOMING_TRACE_MAP,
    )?)
    .map_err(|e| anyhow!("failed to convert to HashMap: {}", e))?;

    let mut entries = Vec::new();
    for item in map.iter() {
        let (conn, info) = item.map_err(|e| anyhow!("aya iter error: {}", e))?;
        entries.push(incoming_json(&conn, &info));
    }
    Ok(Value::Array(entries))
}

/// Registers a pending outgoing context, the way the request
/// instrumentation does when it sees a new outbound request.
pub fn seed_outgoing(pin_dir: &Path, key: EgressKey, trace_id: [u8; 16], pid: u32) -> Result<()> {
    let mut map = HashMap::<_, EgressKey, TracePidInfo>::try_from(open_pinned(
        pin_dir,
        OUTGOING_TRACE_MAP,
    )?)
    .map_err(|e| anyhow!("failed to convert to HashMap: {}", e))?;
    map.insert(key, TracePidInfo::pending(trace_id, pid), 0)
        .with_context(|| format!("failed to seed entry {}->{}", key.s_port, key.d_port))
}

fn outcome_name(outcome: Outcome) -> String {
    match outcome {
        Outcome::Skipped => "skipped".to_string(),
        Outcome::Recorded => "recorded".to_string(),
        Outcome::Injection(Injection::NoContext) => "no_context".to_string(),
        Outcome::Injection(Injection::WrittenByL7) => "written_by_l7".to_string(),
        Outcome::Injection(Injection::Consumed) => "consumed".to_string(),
        Outcome::Injection(Injection::NotInjectable) => "not_injectable".to_string(),
        Outcome::Injection(Injection::Injected) => "injected".to_string(),
        Outcome::Injection(Injection::Failed(err)) => format!("failed: {err}"),
    }
}

/// Runs one frame through the packet pipeline against empty in-memory maps.
/// With `inject`, a pending outgoing context is registered for the frame's
/// connection first.
pub fn decode_frame(bytes: Vec<u8>, inject: Option<[u8; 16]>) -> Result<Value> {
    let mut frame = FrameBuf::new(bytes);
    let (conn, proto) = read_frame(&frame).context("not a readable TCP/IP frame")?;
    let canonical = conn.canonical();

    let maps = HostMaps::with_max_entries(16);
    if let Some(trace_id) = inject {
        maps.outgoing
            .insert(
                &canonical.egress_key(),
                &TracePidInfo::pending(trace_id, 0),
                InsertMode::Any,
            )
            .map_err(|e| anyhow!("failed to register context: {e}"))?;
    }
    let checksum_ok = proto.is_ipv4().then(|| ipv4_checksum_ok(&frame, &proto));
    let sockets = StaticSockets::new();
    let outcome = Dispatcher::new(&maps, &sockets).process(&mut frame);

    let mut obj = JsonMap::new();
    obj.insert("connection".to_string(), Value::String(conn.to_string()));
    obj.insert("canonical".to_string(), Value::String(canonical.to_string()));
    obj.insert("seq".to_string(), Value::Number(JsonNumber::from(proto.seq)));
    obj.insert("ack".to_string(), Value::Number(JsonNumber::from(proto.ack)));
    obj.insert(
        "ip_len".to_string(),
        Value::Number(JsonNumber::from(proto.ip_len)),
    );
    if let Some(checksum_ok) = checksum_ok {
        obj.insert("checksum_ok".to_string(), Value::Bool(checksum_ok));
    }
    obj.insert("outcome".to_string(), Value::String(outcome_name(outcome)));
    if let Some(info) = maps.incoming.get(&canonical) {
        obj.insert("context".to_string(), Value::Object(entry_json(&info)));
    }
    if outcome == Outcome::Injection(Injection::Injected) {
        if let Some((_, after)) = read_frame(&frame) {
            if after.is_ipv4() {
                obj.insert(
                    "checksum_ok".to_string(),
                    Value::Bool(ipv4_checksum_ok(&frame, &after)),
                );
            }
        }
        obj.insert("frame".to_string(), Value::String(hex::encode(frame.as_bytes())));
    }
    Ok(Value::Object(obj))
}
