// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fusion buffers.
//!
//! One scratch buffer per device, owned by the coordination loop. A fused batch packs
//! its members back to back, zero-pads to the required alignment, runs a single
//! collective over the whole region and then copies every member back out. The
//! buffer grows on demand and is never shrunk.

use std::collections::HashMap;

use bytes::Bytes;

use crate::tensor::Device;

/// Alignment of every fused transfer, in bytes. A multiple of every element size.
pub const FUSION_ALIGNMENT_BYTES: usize = 64;

/// Round `len` up to a multiple of `alignment`.
pub fn padded_len(len: usize, alignment: usize) -> usize {
    let alignment = alignment.max(1);
    len.div_ceil(alignment) * alignment
}

#[derive(Default)]
pub struct FusionBufferManager {
    buffers: HashMap<Device, Vec<u8>>,
}

impl FusionBufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current size of the buffer for `device`.
    pub fn capacity(&self, device: Device) -> usize {
        self.buffers.get(&device).map_or(0, Vec::len)
    }

    /// Copy `inputs` into the buffer for `device` and return the padded region.
    ///
    /// The returned slice borrows the manager, so the previous batch's outputs must
    /// have been copied out before the next call.
    pub fn pack<'a, I>(&mut self, device: Device, inputs: I, alignment: usize) -> &mut [u8]
    where
        I: IntoIterator<Item = &'a [u8]>,
        I::IntoIter: Clone,
    {
        let inputs = inputs.into_iter();
        let total: usize = inputs.clone().map(<[u8]>::len).sum();
        let padded = padded_len(total, alignment);

        let buffer = self.buffers.entry(device).or_default();
        if buffer.len() < padded {
            tracing::debug!(%device, from = buffer.len(), to = padded, "growing fusion buffer");
            buffer.resize(padded, 0);
        }

        let mut offset = 0;
        for input in inputs {
            buffer[offset..offset + input.len()].copy_from_slice(input);
            offset += input.len();
        }
        buffer[total..padded].fill(0);
        &mut buffer[..padded]
    }
}

/// Split the front of a fused buffer into per-member outputs of `sizes` bytes.
pub fn unpack(buffer: &[u8], sizes: &[usize]) -> Vec<Bytes> {
    let mut offset = 0;
    sizes
        .iter()
        .map(|size| {
            let out = Bytes::copy_from_slice(&buffer[offset..offset + size]);
            offset += size;
            out
        })
        .collect()
}
