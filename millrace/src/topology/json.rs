//! The JSON front-end: topology descriptions in, dumps and stats out.

use std::collections::HashMap;

use serde_json::{json, Map};

use crate::error::Error;
use crate::object::Value;
use crate::pool::ThreadPoolArgs;
use crate::port::PortInfo;
use crate::runtime::Runtime;
use crate::topology::{flatten, real_blocks_with_heritage, Connector, EndpointKind, Topology, TopologyInner};

/// Which view a topology dump renders.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DumpMode {
    /// Hierarchy preserved; sub-topologies appear with nested blocks and
    /// connections.
    Top,
    /// Hierarchy fully expanded to real blocks.
    Flat,
    /// The active flat flows currently installed.
    Rendered,
}

fn ports_json(infos: &[PortInfo], signal_side: bool) -> Vec<serde_json::Value> {
    infos
        .iter()
        .map(|info| {
            let mut object = Map::new();
            object.insert("name".to_owned(), json!(info.name));
            object.insert("dtype".to_owned(), json!(info.dtype.name()));
            if let Some(alias) = &info.alias {
                object.insert("alias".to_owned(), json!(alias));
            }
            if info.sig_slot {
                let kind = if signal_side { "signal" } else { "slot" };
                object.insert("type".to_owned(), json!(kind));
            }
            serde_json::Value::Object(object)
        })
        .collect()
}

fn block_entry(handle: &crate::runtime::BlockHandle, name: &str) -> serde_json::Value {
    let mut object = Map::new();
    object.insert("name".to_owned(), json!(name));
    let inputs = ports_json(&handle.input_port_info(), false);
    if !inputs.is_empty() {
        object.insert("inputs".to_owned(), serde_json::Value::Array(inputs));
    }
    let outputs = ports_json(&handle.output_port_info(), true);
    if !outputs.is_empty() {
        object.insert("outputs".to_owned(), serde_json::Value::Array(outputs));
    }
    serde_json::Value::Object(object)
}

fn surface_ports_json(names: &[String]) -> Vec<serde_json::Value> {
    use itertools::Itertools;
    names
        .iter()
        .unique()
        .map(|name| json!({"name": name, "dtype": ""}))
        .collect()
}

fn dump_top(inner: &TopologyInner) -> serde_json::Value {
    let mut blocks = Map::new();
    for flow in &inner.flows {
        for endpoint in [&flow.src, &flow.dst] {
            match &endpoint.kind {
                EndpointKind::Block(handle) => {
                    let key = handle.uid().to_string();
                    if !blocks.contains_key(&key) {
                        blocks.insert(key, block_entry(handle, &handle.name()));
                    }
                }
                EndpointKind::Topology(topology) => {
                    let key = topology.uid().to_string();
                    if !blocks.contains_key(&key) {
                        let guard = topology.lock_inner();
                        let mut entry = Map::new();
                        entry.insert("name".to_owned(), json!(guard.name));
                        let inputs = surface_ports_json(&guard.input_names);
                        if !inputs.is_empty() {
                            entry.insert("inputs".to_owned(), serde_json::Value::Array(inputs));
                        }
                        let outputs = surface_ports_json(&guard.output_names);
                        if !outputs.is_empty() {
                            entry.insert("outputs".to_owned(), serde_json::Value::Array(outputs));
                        }
                        let sub = dump_top(&guard);
                        if let serde_json::Value::Object(sub) = sub {
                            for (key, value) in sub {
                                entry.insert(key, value);
                            }
                        }
                        blocks.insert(key, serde_json::Value::Object(entry));
                    }
                }
                EndpointKind::Own => {}
            }
        }
    }

    let connections: Vec<serde_json::Value> = inner
        .flows
        .iter()
        .map(|flow| {
            json!({
                "srcId": flow.src.uid(inner.uid).to_string(),
                "srcName": flow.src.port,
                "dstId": flow.dst.uid(inner.uid).to_string(),
                "dstName": flow.dst.port,
            })
        })
        .collect();

    json!({
        "blocks": serde_json::Value::Object(blocks),
        "connections": connections,
    })
}

fn dump_flat(inner: &TopologyInner) -> serde_json::Value {
    let mut blocks = Map::new();
    for (handle, heritage) in real_blocks_with_heritage(inner) {
        blocks.insert(handle.uid().to_string(), block_entry(&handle, &heritage));
    }
    let connections: Vec<serde_json::Value> = flatten(inner)
        .iter()
        .map(|flow| {
            json!({
                "srcId": flow.src.0.uid().to_string(),
                "srcName": flow.src.1,
                "dstId": flow.dst.0.uid().to_string(),
                "dstName": flow.dst.1,
            })
        })
        .collect();
    json!({
        "blocks": serde_json::Value::Object(blocks),
        "connections": connections,
    })
}

fn dump_rendered(inner: &TopologyInner) -> serde_json::Value {
    let mut blocks = Map::new();
    for flow in &inner.active_flat {
        for (handle, _) in [&flow.src, &flow.dst] {
            let key = handle.uid().to_string();
            if !blocks.contains_key(&key) {
                blocks.insert(key, block_entry(handle, &handle.name()));
            }
        }
    }
    let connections: Vec<serde_json::Value> = inner
        .active_flat
        .iter()
        .map(|flow| {
            json!({
                "srcId": flow.src.0.uid().to_string(),
                "srcName": flow.src.1,
                "dstId": flow.dst.0.uid().to_string(),
                "dstName": flow.dst.1,
            })
        })
        .collect();
    json!({
        "blocks": serde_json::Value::Object(blocks),
        "connections": connections,
    })
}

impl Topology {
    /// Dumps the topology structure as JSON.
    pub fn dump(&self, mode: DumpMode) -> serde_json::Value {
        let inner = self.lock_inner();
        match mode {
            DumpMode::Top => dump_top(&inner),
            DumpMode::Flat => dump_flat(&inner),
            DumpMode::Rendered => dump_rendered(&inner),
        }
    }

    /// Per-block work stats for every real block of this topology, keyed
    /// by block uid.
    pub fn stats(&self) -> serde_json::Value {
        let blocks: Vec<_> = {
            let inner = self.lock_inner();
            real_blocks_with_heritage(&inner)
        };
        let mut stats = Map::new();
        for (handle, _) in blocks {
            stats.insert(handle.uid().to_string(), handle.stats());
        }
        serde_json::Value::Object(stats)
    }

    /// Builds a topology from a JSON description: thread pools, blocks by
    /// factory path, applied calls, and connections. `self`, `this`, and
    /// the empty string denote the topology being constructed.
    ///
    /// `description` may be inline JSON or a path to a JSON file.
    pub fn from_json(runtime: &Runtime, description: &str) -> Result<Topology, Error> {
        let text = if std::fs::metadata(description).is_ok() {
            std::fs::read_to_string(description)
                .map_err(|e| Error::data_format(format!("failed to read {description:?}: {e}")))?
        } else {
            description.to_owned()
        };
        let document: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| Error::data_format(format!("invalid JSON: {e}")))?;
        let top = document
            .as_object()
            .ok_or_else(|| Error::data_format("description must be a JSON object"))?;

        let mut pools = HashMap::new();
        if let Some(pool_descs) = top.get("threadPools") {
            let pool_descs = pool_descs
                .as_object()
                .ok_or_else(|| Error::data_format("threadPools must be an object"))?;
            for (name, desc) in pool_descs {
                let args: ThreadPoolArgs = serde_json::from_value(desc.clone())
                    .map_err(|e| Error::data_format(format!("threadPools[{name}]: {e}")))?;
                let pool = match runtime.pool(name) {
                    Some(existing) => existing,
                    None => runtime.create_pool(name, args)?,
                };
                pools.insert(name.clone(), pool);
            }
        }

        let topology = Topology::new(runtime);
        let mut ids: HashMap<String, Option<Connector>> = HashMap::new();
        ids.insert("self".to_owned(), None);
        ids.insert("this".to_owned(), None);
        ids.insert(String::new(), None);

        if let Some(blocks) = top.get("blocks") {
            let blocks = blocks
                .as_array()
                .ok_or_else(|| Error::data_format("blocks must be an array"))?;
            for (index, desc) in blocks.iter().enumerate() {
                let desc = desc
                    .as_object()
                    .ok_or_else(|| Error::data_format(format!("blocks[{index}] must be an object")))?;
                let id = desc
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::data_format(format!("blocks[{index}] missing 'id'")))?;
                let path = desc
                    .get("path")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::data_format(format!("blocks[{id}] missing 'path'")))?;

                let args = match desc.get("args") {
                    Some(args) => json_args(args, &format!("blocks[{id}].args"))?,
                    None => Vec::new(),
                };
                let handle = runtime
                    .make(path, &args)
                    .map_err(|e| Error::data_format(format!("blocks[{id}]: {e}")))?;
                handle.set_name(id);

                if let Some(calls) = desc.get("calls") {
                    let calls = calls
                        .as_array()
                        .ok_or_else(|| Error::data_format(format!("blocks[{id}].calls must be an array")))?;
                    for call in calls {
                        let call = call.as_object().ok_or_else(|| {
                            Error::data_format(format!("blocks[{id}].calls entries must be objects"))
                        })?;
                        let name = call.get("name").and_then(|v| v.as_str()).ok_or_else(|| {
                            Error::data_format(format!("blocks[{id}].calls entry missing 'name'"))
                        })?;
                        let call_args = match call.get("args") {
                            Some(args) => json_args(args, &format!("blocks[{id}].calls"))?,
                            None => Vec::new(),
                        };
                        handle.call(name, &call_args)?;
                    }
                }

                let pool_name = desc
                    .get("threadPool")
                    .and_then(|v| v.as_str())
                    .unwrap_or("default");
                if let Some(pool) = pools.get(pool_name) {
                    handle.set_thread_pool(pool);
                } else if pool_name != "default" {
                    return Err(Error::data_format(format!(
                        "blocks[{id}] unknown threadPool {pool_name:?}"
                    )));
                }

                ids.insert(id.to_owned(), Some(Connector::Block(handle)));
            }
        }

        if let Some(connections) = top.get("connections") {
            let connections = connections
                .as_array()
                .ok_or_else(|| Error::data_format("connections must be an array"))?;
            for (index, conn) in connections.iter().enumerate() {
                let conn = conn.as_array().ok_or_else(|| {
                    Error::data_format(format!("connections[{index}] must be an array"))
                })?;
                if conn.len() != 4 {
                    return Err(Error::data_format(format!(
                        "connections[{index}] must have 4 entries"
                    )));
                }
                let src_id = json_ident(&conn[0]);
                let src_port = json_ident(&conn[1]);
                let dst_id = json_ident(&conn[2]);
                let dst_port = json_ident(&conn[3]);

                let src = ids.get(&src_id).ok_or_else(|| {
                    Error::data_format(format!("connections[{index}] no such id {src_id:?}"))
                })?;
                let dst = ids.get(&dst_id).ok_or_else(|| {
                    Error::data_format(format!("connections[{index}] no such id {dst_id:?}"))
                })?;
                let src = src.clone().unwrap_or(Connector::Topology(topology.clone()));
                let dst = dst.clone().unwrap_or(Connector::Topology(topology.clone()));
                topology.connect(src, src_port, dst, dst_port)?;
            }
        }

        Ok(topology)
    }
}

fn json_ident(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Maps description argument arrays into `Value`s. Strings are taken
/// literally; expression evaluation belongs to an external evaluator.
fn json_args(value: &serde_json::Value, context: &str) -> Result<Vec<Value>, Error> {
    let array = value
        .as_array()
        .ok_or_else(|| Error::data_format(format!("{context} must be an array")))?;
    array.iter().map(|v| json_value(v, context)).collect()
}

fn json_value(value: &serde_json::Value, context: &str) -> Result<Value, Error> {
    Ok(match value {
        serde_json::Value::Null => Value::Unit,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(json_value(item, context)?);
            }
            Value::List(out)
        }
        serde_json::Value::Object(_) => {
            return Err(Error::data_format(format!(
                "{context}: object arguments are not supported"
            )));
        }
    })
}
