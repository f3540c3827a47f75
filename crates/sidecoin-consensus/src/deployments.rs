//! Version-bits (BIP9) deployment tracking.
//!
//! https://github.com/bitcoin/bitcoin/blob/6f9db1ebcab4064065ccd787161bf2b87e03cc1f/src/versionbits.cpp

use bitcoin::BlockHash;
use bitflags::bitflags;
use parking_lot::RwLock;
use sidecoin_primitives::{Bip9Deployment, ChainedHeader, ConsensusParams, Height};
use std::collections::HashMap;
use std::sync::Arc;

/// Top bits of a block version that signals version-bits deployments.
pub const VERSIONBITS_TOP_BITS: i32 = 0x20000000;
/// Mask of the version-bits marker.
pub const VERSIONBITS_TOP_MASK: i32 = 0xE0000000u32 as i32;

/// Name of the relative lock-time deployment.
pub const CSV_DEPLOYMENT: &str = "csv";
/// Name of the segregated witness deployment.
pub const SEGWIT_DEPLOYMENT: &str = "segwit";

bitflags! {
    /// Script verification flags enforced for a block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ScriptFlags: u32 {
        const NONE = 0;
        const P2SH = 1 << 0;
        const STRICTENC = 1 << 1;
        const DERSIG = 1 << 2;
        const NULLDUMMY = 1 << 4;
        const CHECKLOCKTIMEVERIFY = 1 << 9;
        const CHECKSEQUENCEVERIFY = 1 << 10;
        const WITNESS = 1 << 11;
    }
}

bitflags! {
    /// Lock-time rules enforced for a block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LockTimeFlags: u32 {
        const NONE = 0;
        /// Enforce BIP68 relative lock-times.
        const VERIFY_SEQUENCE = 1 << 0;
        /// Evaluate time locks against the median time past.
        const MEDIAN_TIME_PAST = 1 << 1;
    }
}

/// Rules in force for a block, derived from the deployment states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeploymentFlags {
    pub script_flags: ScriptFlags,
    pub lock_time_flags: LockTimeFlags,
    active: u64,
}

impl Default for DeploymentFlags {
    fn default() -> Self {
        Self {
            script_flags: ScriptFlags::P2SH
                | ScriptFlags::STRICTENC
                | ScriptFlags::DERSIG
                | ScriptFlags::CHECKLOCKTIMEVERIFY,
            lock_time_flags: LockTimeFlags::NONE,
            active: 0,
        }
    }
}

impl DeploymentFlags {
    /// Whether the deployment at `index` is active.
    pub fn is_active(&self, index: usize) -> bool {
        index < 64 && self.active & (1 << index) != 0
    }
}

/// State of a deployment for a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThresholdState {
    Defined,
    Started,
    LockedIn,
    Active,
    Failed,
}

/// Whether `version` signals `deployment`.
pub fn signals(version: i32, deployment: &Bip9Deployment) -> bool {
    (version & VERSIONBITS_TOP_MASK) == VERSIONBITS_TOP_BITS
        && (version & (1i32 << deployment.bit)) != 0
}

/// Block version signalling all `deployments` bits.
pub fn signalling_version<'a>(deployments: impl IntoIterator<Item = &'a Bip9Deployment>) -> i32 {
    deployments
        .into_iter()
        .fold(VERSIONBITS_TOP_BITS, |version, deployment| {
            version | (1i32 << deployment.bit)
        })
}

/// Deployment states cached per window.
///
/// States are keyed by the hash of the last block of a window, `None` standing for the parent
/// of genesis. A state only depends on the ancestry of that block, so entries stay valid
/// across reorgs.
pub struct ThresholdConditionCache {
    params: Arc<ConsensusParams>,
    cache: RwLock<Vec<HashMap<Option<BlockHash>, ThresholdState>>>,
}

impl ThresholdConditionCache {
    pub fn new(params: Arc<ConsensusParams>) -> Self {
        let cache = vec![HashMap::new(); params.deployments.len()];
        Self {
            params,
            cache: RwLock::new(cache),
        }
    }

    /// Returns the state of `deployment` for the block following `prev`.
    pub fn get_state(&self, prev: Option<&Arc<ChainedHeader>>, deployment: usize) -> ThresholdState {
        let params = &self.params.deployments[deployment];

        match params.start_time {
            Bip9Deployment::ALWAYS_ACTIVE => return ThresholdState::Active,
            Bip9Deployment::NEVER_ACTIVE => return ThresholdState::Failed,
            _ => {}
        }

        let period = self.params.window(params);
        let threshold = self.params.threshold(params);

        // The state is only recomputed at window boundaries.
        let mut prev = prev.and_then(|prev| window_end(prev, period));

        let mut to_compute = Vec::new();
        let mut state = {
            let cache = self.cache.read();
            loop {
                let key = prev.as_ref().map(|header| header.hash());
                if let Some(state) = cache[deployment].get(&key) {
                    break *state;
                }
                match prev {
                    None => break ThresholdState::Defined,
                    Some(ref header) if (header.median_time_past() as i64) < params.start_time => {
                        break ThresholdState::Defined;
                    }
                    Some(header) => {
                        prev = previous_window(&header, period);
                        to_compute.push(header);
                    }
                }
            }
        };

        let mut cache = self.cache.write();
        // The starting point itself is cached as well.
        cache[deployment]
            .entry(prev.as_ref().map(|header| header.hash()))
            .or_insert(state);

        while let Some(window_last) = to_compute.pop() {
            let mtp = window_last.median_time_past() as i64;
            state = match state {
                ThresholdState::Defined if mtp >= params.start_time => ThresholdState::Started,
                ThresholdState::Started => {
                    let signalling = count_signalling(&window_last, period, params);
                    if signalling >= threshold {
                        ThresholdState::LockedIn
                    } else if mtp >= params.timeout {
                        ThresholdState::Failed
                    } else {
                        ThresholdState::Started
                    }
                }
                ThresholdState::LockedIn
                    if window_last.height() + 1 >= params.min_activation_height =>
                {
                    ThresholdState::Active
                }
                state => state,
            };
            cache[deployment].insert(Some(window_last.hash()), state);
        }

        state
    }

    /// Height of the first block whose state for `deployment` equals the state of the block
    /// following `prev`.
    pub fn get_state_since_height(&self, prev: Option<&Arc<ChainedHeader>>, deployment: usize) -> Height {
        let params = &self.params.deployments[deployment];
        if matches!(
            params.start_time,
            Bip9Deployment::ALWAYS_ACTIVE | Bip9Deployment::NEVER_ACTIVE
        ) {
            return 0;
        }

        let initial = self.get_state(prev, deployment);
        if initial == ThresholdState::Defined {
            return 0;
        }

        let period = self.params.window(params);
        let Some(mut prev) = prev.and_then(|prev| window_end(prev, period)) else {
            return 0;
        };

        while let Some(previous) = previous_window(&prev, period) {
            if self.get_state(Some(&previous), deployment) != initial {
                break;
            }
            prev = previous;
        }

        prev.height() + 1
    }

    /// Height of the first block at which `deployment` was active on the chain ending at `tip`,
    /// `None` if it is not active.
    pub fn activation_height(&self, tip: &Arc<ChainedHeader>, deployment: usize) -> Option<Height> {
        if self.get_state(Some(tip), deployment) != ThresholdState::Active {
            return None;
        }
        // Genesis is never validated against deployment rules.
        Some(self.get_state_since_height(Some(tip), deployment).max(1))
    }

    /// Index of the deployment called `name`.
    pub fn deployment_index(&self, name: &str) -> Option<usize> {
        self.params
            .deployments
            .iter()
            .position(|deployment| deployment.name == name)
    }

    /// Rules in force for the block following `prev`.
    pub fn compute_flags(&self, prev: Option<&Arc<ChainedHeader>>) -> DeploymentFlags {
        let mut flags = DeploymentFlags::default();

        for (index, deployment) in self.params.deployments.iter().enumerate() {
            if self.get_state(prev, index) != ThresholdState::Active {
                continue;
            }
            if index < 64 {
                flags.active |= 1 << index;
            }
            match deployment.name {
                CSV_DEPLOYMENT => {
                    flags.script_flags |= ScriptFlags::CHECKSEQUENCEVERIFY;
                    flags.lock_time_flags |=
                        LockTimeFlags::VERIFY_SEQUENCE | LockTimeFlags::MEDIAN_TIME_PAST;
                }
                SEGWIT_DEPLOYMENT => {
                    flags.script_flags |= ScriptFlags::WITNESS | ScriptFlags::NULLDUMMY;
                }
                _ => {}
            }
        }

        flags
    }

    /// Counts, for every deployment, the blocks signalling it in the window containing `tip`
    /// up to and including `tip`.
    pub fn signalling_counts(&self, tip: &Arc<ChainedHeader>) -> Vec<u32> {
        self.params
            .deployments
            .iter()
            .map(|deployment| {
                let period = self.params.window(deployment);
                let in_window = (tip.height() + 1) % period;
                let in_window = if in_window == 0 { period } else { in_window };
                count_signalling(tip, in_window, deployment)
            })
            .collect()
    }
}

/// Last block of the window preceding the block after `prev`.
fn window_end(prev: &Arc<ChainedHeader>, period: u32) -> Option<Arc<ChainedHeader>> {
    let offset = (prev.height() + 1) % period;
    prev.height()
        .checked_sub(offset)
        .and_then(|height| prev.get_ancestor(height))
}

fn previous_window(window_last: &Arc<ChainedHeader>, period: u32) -> Option<Arc<ChainedHeader>> {
    window_last
        .height()
        .checked_sub(period)
        .and_then(|height| window_last.get_ancestor(height))
}

fn count_signalling(last: &Arc<ChainedHeader>, blocks: u32, deployment: &Bip9Deployment) -> u32 {
    let mut count = 0;
    let mut current = Some(last);
    for _ in 0..blocks {
        let Some(header) = current else {
            break;
        };
        if signals(header.header().header.version.to_consensus(), deployment) {
            count += 1;
        }
        current = header.prev();
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::block::{Header, Version};
    use bitcoin::hashes::Hash;
    use bitcoin::{CompactTarget, TxMerkleNode};
    use sidecoin_primitives::{Network, SidechainHeader};

    fn params(window: u32, threshold: u32, deployments: Vec<Bip9Deployment>) -> Arc<ConsensusParams> {
        let mut params = ConsensusParams::new(Network::Regtest);
        params.miner_confirmation_window = window;
        params.rule_change_activation_threshold = threshold;
        params.deployments = deployments;
        Arc::new(params)
    }

    /// Builds `len` blocks on top of genesis, signalling from `signal_from` onward.
    fn chain(len: u32, signal_from: Height, bit: u8) -> Vec<Arc<ChainedHeader>> {
        let header = |prev: BlockHash, height: Height| {
            let version = if height >= signal_from {
                VERSIONBITS_TOP_BITS | (1 << bit)
            } else {
                4
            };
            SidechainHeader::new(Header {
                version: Version::from_consensus(version),
                prev_blockhash: prev,
                merkle_root: TxMerkleNode::all_zeros(),
                time: 1_000_000 + height * 16,
                bits: CompactTarget::from_consensus(0x207fffff),
                nonce: height,
            })
        };

        let mut chain = vec![ChainedHeader::genesis(header(BlockHash::all_zeros(), 0))];
        for height in 1..=len {
            let prev = chain.last().unwrap().clone();
            chain.push(ChainedHeader::new(header(prev.hash(), height), prev));
        }
        chain
    }

    fn first_active_height(cache: &ThresholdConditionCache, chain: &[Arc<ChainedHeader>]) -> Option<Height> {
        (1..chain.len()).find_map(|height| {
            (cache.get_state(Some(&chain[height - 1]), 0) == ThresholdState::Active)
                .then_some(height as Height)
        })
    }

    #[test]
    fn activation_follows_window_arithmetic() {
        for (window, threshold) in [(144, 108), (10, 9), (20, 19)] {
            let start_height = 73;
            let expected = ((start_height / window) + 3) * window;

            let cache = ThresholdConditionCache::new(params(
                window,
                threshold,
                vec![Bip9Deployment::new("test", 1, 0, Bip9Deployment::NO_TIMEOUT)],
            ));
            let chain = chain(expected + window, start_height, 1);

            assert_eq!(first_active_height(&cache, &chain), Some(expected), "window {window}");
            assert_eq!(
                cache.activation_height(chain.last().unwrap(), 0),
                Some(expected),
                "window {window}"
            );
        }
    }

    #[test]
    fn always_active_from_first_block() {
        let cache = ThresholdConditionCache::new(params(
            10,
            9,
            vec![Bip9Deployment::always_active(CSV_DEPLOYMENT, 0)],
        ));
        let chain = chain(3, Height::MAX, 0);

        assert_eq!(first_active_height(&cache, &chain), Some(1));
        assert_eq!(cache.activation_height(&chain[3], 0), Some(1));

        let flags = cache.compute_flags(Some(&chain[3]));
        assert!(flags.is_active(0));
        assert!(flags.lock_time_flags.contains(LockTimeFlags::MEDIAN_TIME_PAST));
        assert!(flags.script_flags.contains(ScriptFlags::CHECKSEQUENCEVERIFY));
    }

    #[test]
    fn never_active_and_timeout() {
        let never = ThresholdConditionCache::new(params(
            10,
            9,
            vec![Bip9Deployment::new("never", 2, Bip9Deployment::NEVER_ACTIVE, 0)],
        ));
        let chain = chain(60, 0, 2);
        assert_eq!(never.get_state(chain.last(), 0), ThresholdState::Failed);
        assert_eq!(never.activation_height(chain.last().unwrap(), 0), None);

        // Times out before the signalling starts.
        let timeout = 1_000_000 + 25 * 16;
        let failing = ThresholdConditionCache::new(params(
            10,
            9,
            vec![Bip9Deployment::new("late", 2, 0, timeout)],
        ));
        let chain = self::chain(60, 40, 2);
        assert_eq!(failing.get_state(chain.last(), 0), ThresholdState::Failed);
        assert!(!failing.compute_flags(chain.last()).is_active(0));
    }

    #[test]
    fn state_is_monotonic_along_the_chain() {
        let cache = ThresholdConditionCache::new(params(
            10,
            9,
            vec![Bip9Deployment::new("test", 1, 0, Bip9Deployment::NO_TIMEOUT)],
        ));
        let chain = chain(80, 15, 1);

        let rank = |state| match state {
            ThresholdState::Defined => 0,
            ThresholdState::Started => 1,
            ThresholdState::LockedIn => 2,
            ThresholdState::Active => 3,
            ThresholdState::Failed => 4,
        };

        let mut last = 0;
        // Query out of order first to exercise the cache.
        cache.get_state(Some(&chain[55]), 0);
        for header in &chain {
            let current = rank(cache.get_state(Some(header), 0));
            assert!(current >= last);
            last = current;
        }
        assert_eq!(last, 3);
    }

    #[test]
    fn min_activation_height_delays_activation() {
        let mut deployment = Bip9Deployment::new("test", 1, 0, Bip9Deployment::NO_TIMEOUT);
        deployment.min_activation_height = 55;
        let cache = ThresholdConditionCache::new(params(10, 9, vec![deployment]));
        let chain = chain(80, 1, 1);

        // Locked in at 20, held until the window starting at or after 55.
        assert_eq!(first_active_height(&cache, &chain), Some(60));
    }

    #[test]
    fn signalling_counts_cover_the_current_window() {
        let cache = ThresholdConditionCache::new(params(
            10,
            9,
            vec![Bip9Deployment::new("test", 1, 0, Bip9Deployment::NO_TIMEOUT)],
        ));
        let chain = chain(24, 23, 1);
        assert_eq!(cache.signalling_counts(&chain[24]), vec![2]);
        assert_eq!(cache.signalling_counts(&chain[19]), vec![0]);
    }
}
