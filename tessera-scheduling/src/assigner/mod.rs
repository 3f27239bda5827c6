//! Band assignment.
//!
//! The assigner answers two questions for the subtask manager:
//!
//! * [`assign_subtasks`] – which band should each subtask run on, given input
//!   locality, device-class constraints and a set of bands to avoid;
//! * [`reassign_subtasks`] – how many queued subtasks each band should shed
//!   or receive after cluster membership changed.
//!
//! It keeps the most recent band list plus two indexes (by worker address and
//! by device class), refreshed from every cluster-view emission.  Snapshots
//! are versioned; a stale refresh never overwrites a newer one.
//!
//! [`assign_subtasks`]: Assigner::assign_subtasks
//! [`reassign_subtasks`]: Assigner::reassign_subtasks

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::band::{Band, DeviceClass};
use crate::error::{SchedulingError, SchedulingResult};
use crate::meta::MetaClient;
use crate::subtask::{ChunkKey, ChunkOp, Subtask};

// ── Band index ────────────────────────────────────────────────────────────────

/// Immutable view of the live bands, indexed two ways.
#[derive(Debug, Default)]
struct BandIndex {
    version: u64,
    /// Sorted; lexicographic band order makes iteration deterministic.
    bands: Vec<Band>,
    address_to_bands: HashMap<String, Vec<Band>>,
    device_to_bands: HashMap<DeviceClass, Vec<Band>>,
}

impl BandIndex {
    fn build(version: u64, mut bands: Vec<Band>) -> Self {
        bands.sort();
        bands.dedup();

        let mut address_to_bands: HashMap<String, Vec<Band>> = HashMap::new();
        let mut device_to_bands: HashMap<DeviceClass, Vec<Band>> = HashMap::new();
        for band in &bands {
            address_to_bands
                .entry(band.address.clone())
                .or_default()
                .push(band.clone());
            device_to_bands
                .entry(band.device_class())
                .or_default()
                .push(band.clone());
        }

        Self {
            version,
            bands,
            address_to_bands,
            device_to_bands,
        }
    }

    fn contains(&self, band: &Band) -> bool {
        self.bands.binary_search(band).is_ok()
    }

    /// All bands of `class`; an empty class is a hard failure because no
    /// amount of waiting on this snapshot will produce a matching slot.
    fn device_bands(&self, class: DeviceClass) -> SchedulingResult<&[Band]> {
        match self.device_to_bands.get(&class) {
            Some(bands) if !bands.is_empty() => Ok(bands),
            _ => Err(SchedulingError::NoMatchingSlots(class)),
        }
    }

    /// Uniform random pick among the class bands that are not excluded.
    ///
    /// When every candidate is excluded: with `random_when_unavailable` the
    /// pick falls back to the full class list (the caller accepts a possibly
    /// excluded band), otherwise the call fails.
    fn random_band(
        &self,
        class: DeviceClass,
        exclude: &HashSet<Band>,
        random_when_unavailable: bool,
    ) -> SchedulingResult<Band> {
        let bands = self.device_bands(class)?;
        if !exclude.is_empty() {
            let avail: Vec<&Band> = bands.iter().filter(|b| !exclude.contains(*b)).collect();
            if let Some(band) = avail.choose(&mut rand::thread_rng()) {
                return Ok((*band).clone());
            }
            if !random_when_unavailable {
                return Err(SchedulingError::NoAvailableBand {
                    detail: format!("all {} {} bands are excluded", bands.len(), class),
                });
            }
        }
        bands
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| SchedulingError::NoMatchingSlots(class))
    }
}

fn choose<'a, T>(items: &'a [T]) -> Option<&'a T> {
    items.choose(&mut rand::thread_rng())
}

// ── Assigner ──────────────────────────────────────────────────────────────────

/// Per-session band assigner.
pub struct Assigner {
    meta: MetaClient,
    index: RwLock<Arc<BandIndex>>,
}

impl Assigner {
    pub fn new(meta: MetaClient) -> Self {
        Self {
            meta,
            index: RwLock::new(Arc::new(BandIndex::default())),
        }
    }

    /// Replace the band list with a newer snapshot.  Returns `false` (and
    /// changes nothing) when `version` is not newer than the current one.
    /// Version 0 marks the startup seed and is always overwritable.
    pub fn update_bands(&self, version: u64, bands: Vec<Band>) -> bool {
        let mut index = self.index.write();
        if version <= index.version && index.version > 0 {
            debug!(
                version,
                current = index.version,
                "ignoring stale band snapshot"
            );
            return false;
        }
        *index = Arc::new(BandIndex::build(version, bands));
        true
    }

    pub fn has_bands(&self) -> bool {
        !self.index.read().bands.is_empty()
    }

    pub fn current_bands(&self) -> Vec<Band> {
        self.index.read().bands.clone()
    }

    /// Pick one target band per subtask.
    ///
    /// Subtasks are processed in input order.  Chunk metadata for every
    /// point-to-point input of the whole batch is fetched in a single
    /// round-trip.
    ///
    /// # Errors
    /// * `NoMatchingSlots` – the required device class has no bands at all.
    /// * `NoAvailableBand` – a hard `expect_bands` constraint cannot be met,
    ///   or every candidate is excluded and `random_when_unavailable` is off.
    /// * `ChunkMetaMissing` – a Fetch input references an unknown chunk.
    pub async fn assign_subtasks(
        &self,
        subtasks: &[Subtask],
        exclude_bands: &HashSet<Band>,
        random_when_unavailable: bool,
    ) -> SchedulingResult<Vec<Band>> {
        let index = self.index.read().clone();

        // Pass 1: settle pre-assigned and shuffle-fed subtasks, collect the
        // Fetch keys everyone else needs metadata for.
        let mut inp_keys: BTreeSet<ChunkKey> = BTreeSet::new();
        let mut broadcaster_keys: HashSet<ChunkKey> = HashSet::new();
        let mut selected: HashMap<&str, Vec<Band>> = HashMap::new();

        for subtask in subtasks {
            let class = subtask_class(subtask);

            if !subtask.expect_bands.is_empty() {
                // expected bands that are live and not excluded
                let mut avail: Vec<Band> = subtask
                    .expect_bands
                    .iter()
                    .filter(|b| index.contains(b) && !exclude_bands.contains(*b))
                    .cloned()
                    .collect();
                if avail.is_empty() {
                    // every expected band is unready; a soft expectation falls
                    // through to a random candidate
                    debug!(
                        subtask_id = %subtask.subtask_id,
                        event = "expect_bands_unavailable",
                        "expected bands unavailable; substituting a random candidate"
                    );
                    avail = vec![index.random_band(class, exclude_bands, random_when_unavailable)?];
                }
                selected.insert(subtask.subtask_id.as_str(), avail);
                continue;
            }

            for node in subtask.chunk_graph.iter_indep() {
                match &node.op {
                    ChunkOp::Fetch { broadcaster } => {
                        if *broadcaster {
                            broadcaster_keys.insert(node.key.clone());
                        }
                        inp_keys.insert(node.key.clone());
                    }
                    ChunkOp::FetchShuffle => {
                        // shuffle inputs are scattered everywhere; locality
                        // carries no signal
                        selected.insert(
                            subtask.subtask_id.as_str(),
                            vec![index.random_band(class, exclude_bands, random_when_unavailable)?],
                        );
                        break;
                    }
                    ChunkOp::Compute => {}
                }
            }
        }

        let keys: Vec<ChunkKey> = inp_keys.into_iter().collect();
        let mut metas = self.meta.chunk_metas(&keys).await?;
        // broadcast chunks count as size zero so successors spread out
        for key in &broadcaster_keys {
            if let Some(meta) = metas.get_mut(key) {
                meta.store_size = 0;
            }
        }

        // Pass 2: locality by accumulated input size.
        let mut assigns = Vec::with_capacity(subtasks.len());
        for subtask in subtasks {
            let class = subtask_class(subtask);
            let class_bands = index.device_bands(class)?;

            let candidates: Vec<Band> = match selected.get(subtask.subtask_id.as_str()) {
                Some(bands) => bands.clone(),
                None => {
                    let mut band_sizes: BTreeMap<Band, u64> = BTreeMap::new();
                    for node in subtask.chunk_graph.iter_indep() {
                        if !matches!(node.op, ChunkOp::Fetch { .. }) {
                            continue;
                        }
                        let meta = metas.get(&node.key).ok_or_else(|| {
                            SchedulingError::ChunkMetaMissing {
                                key: node.key.clone(),
                            }
                        })?;
                        for resident in &meta.bands {
                            let mut band = resident.clone();
                            if band.device_class() != class {
                                // wrong class: prefer a same-address band of
                                // the right class
                                let same_addr: Vec<&Band> = index
                                    .address_to_bands
                                    .get(&band.address)
                                    .map(|bands| {
                                        bands
                                            .iter()
                                            .filter(|b| {
                                                b.device_class() == class
                                                    && !exclude_bands.contains(*b)
                                            })
                                            .collect()
                                    })
                                    .unwrap_or_default();
                                if let Some(projected) = choose(&same_addr) {
                                    band = (*projected).clone();
                                }
                            }
                            if !class_bands.contains(&band) || exclude_bands.contains(&band) {
                                band = index.random_band(
                                    class,
                                    exclude_bands,
                                    random_when_unavailable,
                                )?;
                            }
                            *band_sizes.entry(band).or_insert(0) += meta.store_size;
                        }
                    }

                    let mut best: Vec<Band> = Vec::new();
                    let mut max_size: Option<u64> = None;
                    for (band, size) in band_sizes {
                        match max_size {
                            Some(max) if size < max => {}
                            Some(max) if size == max => best.push(band),
                            _ => {
                                max_size = Some(size);
                                best = vec![band];
                            }
                        }
                    }
                    if best.is_empty() {
                        // no Fetch inputs at all (a source subtask): any
                        // candidate band will do
                        best =
                            vec![index.random_band(class, exclude_bands, random_when_unavailable)?];
                    }
                    best
                }
            };

            let band = choose(&candidates)
                .cloned()
                .ok_or_else(|| SchedulingError::Internal("empty candidate set".into()))?;

            if !random_when_unavailable && exclude_bands.contains(&band) {
                return Err(SchedulingError::NoAvailableBand {
                    detail: format!(
                        "subtask '{}' only matched excluded bands",
                        subtask.subtask_id
                    ),
                });
            }
            if subtask.bands_specified && !subtask.expect_bands.contains(&band) {
                return Err(SchedulingError::NoAvailableBand {
                    detail: format!(
                        "subtask '{}' requires bands {:?} which are unavailable",
                        subtask.subtask_id, subtask.expect_bands
                    ),
                });
            }
            assigns.push(band);
        }
        Ok(assigns)
    }

    /// Compute a rebalance plan after cluster membership changed.
    ///
    /// `band_to_queued` maps every band that currently has a queue to its
    /// queued-subtask count; the returned map says how many entries each band
    /// should shed (negative) or receive (positive).  Values sum to zero.
    /// Device classes balance independently; any flooring residual is
    /// credited to one random CPU band.
    pub fn reassign_subtasks(
        &self,
        band_to_queued: &HashMap<Band, usize>,
    ) -> SchedulingResult<HashMap<Band, i64>> {
        let index = self.index.read().clone();
        let mut moves: HashMap<Band, i64> = HashMap::new();

        for class in [DeviceClass::Numa, DeviceClass::Gpu] {
            let class_bands: Vec<&Band> = index
                .bands
                .iter()
                .filter(|b| b.device_class() == class)
                .collect();
            if class_bands.is_empty() {
                continue;
            }
            let class_counts: BTreeMap<&Band, usize> = band_to_queued
                .iter()
                .filter(|(b, _)| b.device_class() == class)
                .map(|(b, n)| (b, *n))
                .collect();

            if class_counts.len() == 1 {
                let (band, count) = match class_counts.iter().next() {
                    Some((band, count)) => ((*band).clone(), *count),
                    None => continue,
                };
                if count == 0 {
                    moves.insert(band, 0);
                    continue;
                }
                // a single band that is also the only ready band of its class
                // has nowhere to move anything
                if class_bands.len() == 1 && *class_bands[0] == band {
                    moves.insert(band, 0);
                    continue;
                }
            }

            let ready: HashSet<&Band> = class_bands.iter().copied().collect();
            let unready: Vec<&Band> = class_counts
                .keys()
                .filter(|b| !ready.contains(*b))
                .copied()
                .collect();
            let new_ready_exists = class_bands
                .iter()
                .any(|b| !class_counts.contains_key(*b));

            // with no fresh bands to spread onto, only the unready bands
            // drain; their entries find targets through the residual credit
            let working: BTreeMap<&Band, usize> = if !new_ready_exists && !unready.is_empty() {
                class_counts
                    .iter()
                    .filter(|(b, _)| unready.contains(*b))
                    .map(|(b, n)| (*b, *n))
                    .collect()
            } else {
                class_counts
            };

            let total: usize = working.values().sum();
            let mean = (total / class_bands.len()) as i64;

            let mut class_moves: BTreeMap<Band, i64> = BTreeMap::new();
            let all: BTreeSet<&Band> = ready.iter().copied().chain(working.keys().copied()).collect();
            for band in all {
                let count = working.get(band).copied().unwrap_or(0) as i64;
                let delta = if ready.contains(band) {
                    mean - count
                } else {
                    -count
                };
                class_moves.insert(band.clone(), delta);
            }

            // flooring makes the sum non-positive; push the residual onto one
            // CPU band so the plan nets out to zero
            let total_move: i64 = class_moves.values().sum();
            debug_assert!(total_move <= 0);
            if total_move != 0 {
                let credit =
                    index.random_band(DeviceClass::Numa, &HashSet::new(), true)?;
                *class_moves.entry(credit).or_insert(0) -= total_move;
            }
            moves.extend(class_moves);
        }
        Ok(moves)
    }
}

fn subtask_class(subtask: &Subtask) -> DeviceClass {
    if subtask.chunk_graph.uses_gpu() {
        DeviceClass::Gpu
    } else {
        DeviceClass::Numa
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
