//! The transactional commit protocol.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::actor::Control;
use crate::buffer::resolve_manager;
use crate::error::Error;
use crate::port::Subscriber;
use crate::runtime::{BlockHandle, Uid};
use crate::topology::{flatten, FlatFlow, TopologyInner};

/// True when the flow carries stream data and needs a buffer manager.
fn is_stream_flow(flow: &FlatFlow) -> bool {
    let src = flow
        .src
        .0
        .output_index(&flow.src.1)
        .and_then(|i| flow.src.0.output_info(i));
    let dst = flow
        .dst
        .0
        .input_index(&flow.dst.1)
        .and_then(|i| flow.dst.0.input_info(i));
    matches!((src, dst), (Some(s), Some(d)) if !s.dtype.is_empty() && !d.dtype.is_empty())
}

fn wrap_domain_error(error: Error, src_domain: &str, dst_domain: &str) -> Error {
    match error {
        Error::PortDomain { .. } => error,
        other => Error::PortDomain {
            src_domain: src_domain.to_owned(),
            dst_domain: dst_domain.to_owned(),
            reason: other.to_string(),
        },
    }
}

/// Computes the new flat set, validates and negotiates everything fallible,
/// then applies the difference against the previous commit.
pub(crate) fn commit_inner(inner: &mut TopologyInner) -> Result<(), Error> {
    let flat = flatten(inner);

    // No stream input may be driven by more than one output. Message-only
    // destinations legally fan in.
    let mut driven: HashSet<(Uid, String)> = HashSet::new();
    for flow in flat.iter().filter(|f| is_stream_flow(f)) {
        let key = (flow.dst.0.uid(), flow.dst.1.clone());
        if !driven.insert(key) {
            return Err(Error::connect(format!(
                "input port {}[{}] is driven by more than one output",
                flow.dst.0.name(),
                flow.dst.1
            )));
        }
    }

    let old_keys: HashSet<_> = inner.active_flat.iter().map(|f| f.key()).collect();
    let new_keys: HashSet<_> = flat.iter().map(|f| f.key()).collect();
    let added: Vec<&FlatFlow> = flat.iter().filter(|f| !old_keys.contains(&f.key())).collect();
    let removed: Vec<FlatFlow> = inner
        .active_flat
        .iter()
        .filter(|f| !new_keys.contains(&f.key()))
        .cloned()
        .collect();

    // Everything fallible happens before any mutation: a failed commit
    // leaves the topology exactly as it was.
    let mut installs: Vec<(BlockHandle, usize, Box<dyn crate::buffer::BufferManager>)> = Vec::new();
    for flow in added.iter().filter(|f| is_stream_flow(f)) {
        let (src_block, src_port) = (&flow.src.0, &flow.src.1);
        let (dst_block, dst_port) = (&flow.dst.0, &flow.dst.1);
        let src_index = src_block
            .output_index(src_port)
            .ok_or_else(|| Error::no_port(src_block.name(), src_port.clone()))?;
        let dst_index = dst_block
            .input_index(dst_port)
            .ok_or_else(|| Error::no_port(dst_block.name(), dst_port.clone()))?;
        let src_domain = src_block
            .output_info(src_index)
            .map(|p| p.domain)
            .unwrap_or_default();
        let dst_domain = dst_block
            .input_info(dst_index)
            .map(|p| p.domain)
            .unwrap_or_default();

        let from_producer = src_block
            .negotiate_output(src_index, &dst_domain)
            .map_err(|e| wrap_domain_error(e, &src_domain, &dst_domain))?;
        let from_consumer = dst_block
            .negotiate_input(dst_index, &src_domain)
            .map_err(|e| wrap_domain_error(e, &src_domain, &dst_domain))?;
        let manager = resolve_manager(&src_domain, &dst_domain, from_producer, from_consumer)?;
        installs.push((src_block.clone(), src_index, manager));
    }

    // Apply removals: producers stop producing first.
    for flow in &removed {
        let src_index = match flow.src.0.output_index(&flow.src.1) {
            Some(index) => index,
            None => continue,
        };
        let dst_index = match flow.dst.0.input_index(&flow.dst.1) {
            Some(index) => index,
            None => continue,
        };
        let dst_uid = flow.dst.0.uid();
        flow.src.0.control_sync(|reply| Control::Unsubscribe {
            port: src_index,
            block: dst_uid,
            dst_port: dst_index,
            reply,
        });
        if is_stream_flow(flow) {
            flow.dst.0.control_sync(|reply| Control::SetUpstream {
                port: dst_index,
                upstream: None,
                reply,
            });
        }
    }

    // Install negotiated managers, then subscribe the added flows.
    for (block, port, manager) in installs {
        block.control_sync(move |reply| Control::InstallManager {
            port,
            manager,
            reply,
        });
    }
    for flow in &added {
        let src_index = match flow.src.0.output_index(&flow.src.1) {
            Some(index) => index,
            None => continue,
        };
        let dst_index = match flow.dst.0.input_index(&flow.dst.1) {
            Some(index) => index,
            None => continue,
        };
        let dst_cell = flow.dst.0.cell();
        let subscriber = Subscriber {
            block: flow.dst.0.uid(),
            port: dst_index,
            cell: Arc::downgrade(dst_cell),
            inbox: Arc::clone(&dst_cell.inboxes[dst_index]),
        };
        flow.src.0.control_sync(move |reply| Control::Subscribe {
            port: src_index,
            subscriber,
            reply,
        });
        if is_stream_flow(flow) {
            let upstream = Some((flow.src.0.uid(), Arc::downgrade(flow.src.0.cell())));
            flow.dst.0.control_sync(move |reply| Control::SetUpstream {
                port: dst_index,
                upstream,
                reply,
            });
        }
    }

    // Block transitions: deactivate blocks whose last flow was removed,
    // then activate newcomers.
    let mut new_blocks: HashMap<Uid, BlockHandle> = HashMap::new();
    for flow in &flat {
        new_blocks.entry(flow.src.0.uid()).or_insert_with(|| flow.src.0.clone());
        new_blocks.entry(flow.dst.0.uid()).or_insert_with(|| flow.dst.0.clone());
    }
    for (uid, block) in inner.committed.iter() {
        if !new_blocks.contains_key(uid) {
            block.control_sync(|reply| Control::Deactivate { reply });
        }
    }
    if let Some(pool) = inner.pool.clone() {
        for (uid, block) in new_blocks.iter() {
            if !inner.committed.contains_key(uid) {
                block.set_thread_pool(&pool);
            }
        }
    }
    for block in new_blocks.values() {
        if !block.is_active() {
            block.control_sync(|reply| Control::Activate { reply });
        }
    }

    inner.active_flat = flat;
    inner.committed = new_blocks;
    Ok(())
}
