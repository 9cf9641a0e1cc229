// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{CollectiveOp, ExecutionContext, Payload};
use crate::error::{CollectiveError, Result};
use crate::message::{Batch, OpKind};

fn gather_parts<'a>(
    payload: Payload<'a>,
) -> Result<(&'a [u8], &'a [usize], &'a mut Vec<u8>)> {
    match payload {
        Payload::Gather {
            input,
            counts,
            output,
        } => Ok((input, counts, output)),
        _ => Err(CollectiveError::InvalidArgument(
            "allgather needs a gather payload".to_string(),
        )),
    }
}

/// Concatenation over the global communicator.
pub struct FabricAllgather;

impl CollectiveOp for FabricAllgather {
    fn name(&self) -> &str {
        "fabric_allgather"
    }

    fn enabled(&self, batch: &Batch, _ctx: &ExecutionContext<'_>) -> bool {
        batch.kind == OpKind::Gather
    }

    fn execute(&self, _batch: &Batch, payload: Payload<'_>, ctx: &ExecutionContext<'_>) -> Result<()> {
        let (input, counts, output) = gather_parts(payload)?;
        *output = ctx.comms.global.allgatherv(input, counts)?;
        Ok(())
    }
}

/// Gather within each node, then exchange whole node blocks across nodes.
///
/// Requires node-major rank numbering so that node blocks concatenated in node
/// order are in global rank order.
pub struct HierarchicalAllgather;

impl CollectiveOp for HierarchicalAllgather {
    fn name(&self) -> &str {
        "hierarchical_allgather"
    }

    fn enabled(&self, batch: &Batch, ctx: &ExecutionContext<'_>) -> bool {
        batch.kind == OpKind::Gather
            && ctx.parameters.hierarchical_allgather
            && ctx.topology.is_multi_node()
            && ctx.topology.homogeneous
            && ctx.topology.node_major
    }

    fn execute(&self, _batch: &Batch, payload: Payload<'_>, ctx: &ExecutionContext<'_>) -> Result<()> {
        let (input, counts, output) = gather_parts(payload)?;
        let local_size = ctx.topology.local_size;
        if counts.len() != ctx.topology.size {
            return Err(CollectiveError::InvalidArgument(format!(
                "{} counts for {} ranks",
                counts.len(),
                ctx.topology.size
            )));
        }

        let node_start = ctx.topology.cross_rank * local_size;
        let local_counts = &counts[node_start..node_start + local_size];
        let node_block = ctx.comms.local.allgatherv(input, local_counts)?;

        let node_counts: Vec<usize> = counts
            .chunks(local_size)
            .map(|c| c.iter().sum())
            .collect();
        *output = ctx.comms.cross.allgatherv(&node_block, &node_counts)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectivesConfig;
    use crate::state::Parameters;
    use crate::tensor::DataType;
    use crate::transport::LocalCluster;
    use std::thread;

    #[test]
    fn test_hierarchical_gather_preserves_rank_order() {
        let sets = LocalCluster::new(2, 2).unwrap();
        // rank r contributes r + 1 bytes of value r
        let counts = vec![1usize, 2, 3, 4];
        let handles: Vec<_> = sets
            .into_iter()
            .map(|set| {
                let counts = counts.clone();
                thread::spawn(move || {
                    let mut topology = set.topology();
                    topology.homogeneous = true;
                    topology.node_major = true;
                    let parameters = Parameters::from(&CollectivesConfig::default());
                    let ctx = ExecutionContext {
                        comms: &set,
                        topology: &topology,
                        parameters: &parameters,
                    };
                    let input = vec![topology.rank as u8; topology.rank + 1];
                    let batch = Batch {
                        kind: OpKind::Gather,
                        names: vec!["g".into()],
                        dtype: DataType::U8,
                        root_rank: None,
                        gather_dims: counts.clone(),
                        error: None,
                    };
                    let mut output = Vec::new();
                    HierarchicalAllgather
                        .execute(
                            &batch,
                            Payload::Gather {
                                input: &input,
                                counts: &counts,
                                output: &mut output,
                            },
                            &ctx,
                        )
                        .unwrap();
                    output
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), vec![0, 1, 1, 2, 2, 2, 3, 3, 3, 3]);
        }
    }
}
