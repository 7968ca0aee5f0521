//! Flattening of hierarchical topologies into flat flows.
//!
//! Every (topology, port-name) pair is a transparent *junction*: a
//! sub-topology port is a pure alias, and self-edges declared on a
//! topology behave as pipes. Flattening walks, from every flow with a real
//! source port, all real destinations reachable through junctions. The
//! walk is deterministic (flows in declaration order, sources before
//! destinations), deduplicated, and cycle-guarded, which makes it a fixed
//! point by construction: flattening a flat graph returns it unchanged.

use std::collections::HashSet;

use crate::runtime::{BlockHandle, Uid};
use crate::topology::{EndpointKind, FlatFlow, Flow, Topology, TopologyInner};

enum REnd {
    Real { block: BlockHandle, port: String },
    Junction { topology: Uid, port: String },
}

struct RFlow {
    src: REnd,
    dst: REnd,
}

fn resolve_end(owner: Uid, endpoint: &crate::topology::Endpoint, pending: &mut Vec<Topology>) -> REnd {
    match &endpoint.kind {
        EndpointKind::Block(handle) => REnd::Real {
            block: handle.clone(),
            port: endpoint.port.clone(),
        },
        EndpointKind::Topology(topology) => {
            pending.push(topology.clone());
            REnd::Junction {
                topology: topology.uid(),
                port: endpoint.port.clone(),
            }
        }
        EndpointKind::Own => REnd::Junction {
            topology: owner,
            port: endpoint.port.clone(),
        },
    }
}

fn push_flows(owner: Uid, flows: &[Flow], out: &mut Vec<RFlow>, pending: &mut Vec<Topology>) {
    for flow in flows {
        out.push(RFlow {
            src: resolve_end(owner, &flow.src, pending),
            dst: resolve_end(owner, &flow.dst, pending),
        });
    }
}

/// Gathers the flows of a topology and of every reachable sub-topology,
/// outer flows first, in declaration order.
fn collect(inner: &TopologyInner) -> Vec<RFlow> {
    let mut flows = Vec::new();
    let mut pending = Vec::new();
    let mut visited = HashSet::new();
    visited.insert(inner.uid);
    push_flows(inner.uid, &inner.flows, &mut flows, &mut pending);

    let mut index = 0;
    while index < pending.len() {
        let sub = pending[index].clone();
        index += 1;
        if !visited.insert(sub.uid()) {
            continue;
        }
        let guard = sub.lock_inner();
        let mut discovered = Vec::new();
        push_flows(guard.uid, &guard.flows, &mut flows, &mut discovered);
        drop(guard);
        pending.extend(discovered);
    }
    flows
}

fn resolve_dst(
    flows: &[RFlow],
    end: &REnd,
    visited: &mut HashSet<(Uid, String)>,
    emit: &mut dyn FnMut(&BlockHandle, &str),
) {
    match end {
        REnd::Real { block, port } => emit(block, port),
        REnd::Junction { topology, port } => {
            if visited.insert((*topology, port.clone())) {
                for flow in flows {
                    if let REnd::Junction {
                        topology: src_topology,
                        port: src_port,
                    } = &flow.src
                    {
                        if src_topology == topology && src_port == port {
                            resolve_dst(flows, &flow.dst, visited, emit);
                        }
                    }
                }
            }
        }
    }
}

/// Computes the set of flat flows declared by a topology.
pub(crate) fn flatten(inner: &TopologyInner) -> Vec<FlatFlow> {
    let flows = collect(inner);
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for flow in &flows {
        if let REnd::Real { block, port } = &flow.src {
            let mut visited = HashSet::new();
            resolve_dst(&flows, &flow.dst, &mut visited, &mut |dst_block, dst_port| {
                let key = (
                    block.uid(),
                    port.clone(),
                    dst_block.uid(),
                    dst_port.to_owned(),
                );
                if seen.insert(key) {
                    result.push(FlatFlow {
                        src: (block.clone(), port.clone()),
                        dst: (dst_block.clone(), dst_port.to_owned()),
                    });
                }
            });
        }
    }
    result
}

/// Every real block reachable from a topology, first-appearance order,
/// with heritage display names (`Outer/Inner/Block`).
pub(crate) fn real_blocks_with_heritage(inner: &TopologyInner) -> Vec<(BlockHandle, String)> {
    let mut out = Vec::new();
    let mut seen_blocks = HashSet::new();
    let mut seen_topologies = HashSet::new();
    seen_topologies.insert(inner.uid);
    walk(
        &inner.flows,
        "",
        &mut out,
        &mut seen_blocks,
        &mut seen_topologies,
    );
    out
}

fn walk(
    flows: &[Flow],
    prefix: &str,
    out: &mut Vec<(BlockHandle, String)>,
    seen_blocks: &mut HashSet<Uid>,
    seen_topologies: &mut HashSet<Uid>,
) {
    for flow in flows {
        for endpoint in [&flow.src, &flow.dst] {
            match &endpoint.kind {
                EndpointKind::Block(handle) => {
                    if seen_blocks.insert(handle.uid()) {
                        out.push((handle.clone(), format!("{prefix}{}", handle.name())));
                    }
                }
                EndpointKind::Topology(topology) => {
                    if seen_topologies.insert(topology.uid()) {
                        let guard = topology.lock_inner();
                        let sub_prefix = format!("{prefix}{}/", guard.name);
                        walk(
                            &guard.flows,
                            &sub_prefix,
                            out,
                            seen_blocks,
                            seen_topologies,
                        );
                    }
                }
                EndpointKind::Own => {}
            }
        }
    }
}
