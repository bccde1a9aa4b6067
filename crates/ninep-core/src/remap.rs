// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Collision-free qid paths for exports spanning several host devices
//!
//! The fast path gives each (device, inode-prefix) combination a
//! variable-length suffix drawn from an inverted Exponential-Golomb code and
//! appends it below the inode number. When the 16-bit suffix counter runs out,
//! a full (device, inode) table hands out counter-based ids instead, tagged
//! with the reserved suffix of index `2^16`.

use std::collections::HashMap;

use tracing::{error, warn};

use crate::config::MultiDevicePolicy;
use crate::error::{FsError, FsResult};

/// Exponential-Golomb parameter
const EXP_GOLOMB_K: u32 = 0;

/// Variable-length bit pattern
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Affix {
    pub value: u64,
    pub bits: u32,
}

/// Exponential-Golomb code of `n` (a prefix code, most significant bit first).
fn exp_golomb_encode(n: u64, k: u32) -> Affix {
    let value = n + (1u64 << k) - 1;
    let bits = 64 - value.leading_zeros();
    Affix {
        value,
        bits: bits + bits.saturating_sub(1 + k),
    }
}

/// Bit-mirror a prefix code into a suffix code.
fn invert(affix: Affix) -> Affix {
    Affix {
        value: affix.value.reverse_bits() >> (64 - affix.bits),
        bits: affix.bits,
    }
}

/// Suffix for the `index`-th (device, prefix) combination.
pub fn affix_for_index(index: u64) -> Affix {
    invert(exp_golomb_encode(index, EXP_GOLOMB_K))
}

/// Inode to qid-path mapping for one session
#[derive(Debug)]
pub struct InodeRemapper {
    policy: MultiDevicePolicy,
    root_dev: Option<u64>,
    warned: bool,
    /// Device to number of high inode bits used as the lookup prefix.
    prefix_bits: HashMap<u64, u32>,
    /// (device, inode prefix) to assigned suffix.
    suffixes: HashMap<(u64, u16), Affix>,
    /// (device, inode) to full-map id.
    full: HashMap<(u64, u64), u64>,
    next_affix: u16,
    next_full: u64,
}

impl InodeRemapper {
    pub fn new(policy: MultiDevicePolicy) -> Self {
        Self {
            policy,
            root_dev: None,
            warned: false,
            prefix_bits: HashMap::new(),
            suffixes: HashMap::new(),
            full: HashMap::new(),
            next_affix: 1,
            next_full: 1,
        }
    }

    pub fn policy(&self) -> MultiDevicePolicy {
        self.policy
    }

    /// Record the export root device. Only the first call has an effect.
    pub fn set_root_device(&mut self, dev: u64) {
        self.root_dev.get_or_insert(dev);
    }

    pub fn root_device(&self) -> Option<u64> {
        self.root_dev
    }

    /// Client-visible path for `(dev, ino)`.
    pub fn map(&mut self, dev: u64, ino: u64) -> FsResult<u64> {
        if self.policy != MultiDevicePolicy::Remap {
            return self.passthrough(dev, ino);
        }
        match self.suffix_map(dev, ino) {
            Some(path) => Ok(path),
            None => self.full_map(dev, ino),
        }
    }

    fn passthrough(&mut self, dev: u64, ino: u64) -> FsResult<u64> {
        match self.root_dev {
            Some(root) if root != dev => {
                if self.policy == MultiDevicePolicy::Forbid {
                    if !self.warned {
                        self.warned = true;
                        error!(
                            root_dev = root,
                            dev, "export spans multiple devices; access denied (multidevs=forbid)"
                        );
                    }
                    return Err(FsError::MultipleDevices);
                }
                if !self.warned {
                    self.warned = true;
                    warn!(
                        root_dev = root,
                        dev,
                        "export spans multiple devices; inode numbers may collide (use multidevs=remap)"
                    );
                }
                Ok(ino)
            }
            _ => Ok(ino),
        }
    }

    /// Prefix width for `dev`, fixed at the device's first sighting. `None`
    /// for a new device once no suffix is left to size it by.
    fn device_prefix_bits(&mut self, dev: u64) -> Option<u32> {
        if let Some(bits) = self.prefix_bits.get(&dev) {
            return Some(*bits);
        }
        if self.next_affix == 0 {
            return None;
        }
        let bits = affix_for_index(self.next_affix as u64).bits;
        self.prefix_bits.insert(dev, bits);
        Some(bits)
    }

    /// Fast path. `None` once the suffix space is exhausted.
    fn suffix_map(&mut self, dev: u64, ino: u64) -> Option<u64> {
        let bits = self.device_prefix_bits(dev)?;
        let key = (dev, (ino >> (64 - bits)) as u16);
        let affix = match self.suffixes.get(&key) {
            Some(affix) => *affix,
            None => {
                if self.next_affix == 0 {
                    if !self.warned {
                        self.warned = true;
                        warn!("inode suffix space exhausted; falling back to full inode map");
                    }
                    return None;
                }
                let affix = affix_for_index(self.next_affix as u64);
                self.next_affix = self.next_affix.wrapping_add(1);
                self.suffixes.insert(key, affix);
                affix
            }
        };
        Some((ino << affix.bits) | affix.value)
    }

    fn full_map(&mut self, dev: u64, ino: u64) -> FsResult<u64> {
        if let Some(path) = self.full.get(&(dev, ino)) {
            return Ok(*path);
        }
        if self.next_full == 0 {
            error!(dev, ino, "no more ids available for remapping inodes");
            return Err(FsError::RemapExhausted);
        }
        let affix = affix_for_index(1 << 16);
        let path = (self.next_full << affix.bits) | affix.value;
        self.next_full = (self.next_full + 1) & ((1u64 << (64 - affix.bits)) - 1);
        self.full.insert((dev, ino), path);
        Ok(path)
    }

    #[cfg(test)]
    fn with_counters(policy: MultiDevicePolicy, next_affix: u16, next_full: u64) -> Self {
        Self {
            next_affix,
            next_full,
            ..Self::new(policy)
        }
    }
}
