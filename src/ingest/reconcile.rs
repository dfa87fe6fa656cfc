//! Reconciliation of parsed variants with pseudodata identities.
//!
//! Both input sides are folded into explicit accumulators which are then
//! joined by [`reconcile`] into one [`Batch`].  No state outlives a run.

use indexmap::{map::Entry, IndexMap};

use crate::{
    conf::{self, ConflictPolicy, LinkStrategy},
    err::LoadError,
    ingest::{
        ds::{
            Batch, Biosample, Call, Conflict, ConflictKind, Genotype, Individual, ProtoBiosample,
            Variant, VariantKey, VariantStats,
        },
        pseudodata::PseudodataRecord,
        vcf::ParsedRecord,
    },
};

/// Tissue recorded for biosamples without declared collection metadata.
pub const DEFAULT_TISSUE: &str = "blood";

/// Options for the reconciler.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub conflict_policy: ConflictPolicy,
    pub link_strategy: LinkStrategy,
    pub carriers_only: bool,
    pub max_var_count: Option<usize>,
}

impl From<&conf::Reconcile> for Options {
    fn from(conf: &conf::Reconcile) -> Self {
        Self {
            conflict_policy: conf.conflict_policy,
            link_strategy: conf.link_strategy,
            carriers_only: conf.carriers_only,
            max_var_count: conf.max_var_count,
        }
    }
}

fn report(conflicts: &mut Vec<Conflict>, conflict: Conflict) {
    tracing::warn!(
        "conflicting {} {:?}: retained {}, discarded {}",
        conflict.kind,
        &conflict.key,
        &conflict.retained,
        &conflict.discarded
    );
    conflicts.push(conflict);
}

fn describe_individual(index: usize, individual: &Individual) -> String {
    format!(
        "entry #{} {}",
        index,
        serde_json::to_string(&individual.attributes).unwrap_or_default()
    )
}

/// Individuals and declared sample linkage from the pseudodata.
#[derive(Debug, Default)]
pub struct IdentityAccumulator {
    policy: ConflictPolicy,
    /// Individuals by stable identifier, with their source index.
    individuals: IndexMap<String, (usize, Individual)>,
    /// Declared samples by sample identifier, with the owning individual.
    declared: IndexMap<String, (String, ProtoBiosample)>,
    conflicts: Vec<Conflict>,
}

impl IdentityAccumulator {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    /// Build an accumulator from all `records`.
    pub fn from_records<I>(policy: ConflictPolicy, records: I) -> Self
    where
        I: IntoIterator<Item = PseudodataRecord>,
    {
        let mut result = Self::new(policy);
        for record in records {
            result.add(record);
        }
        result
    }

    /// Add one pseudodata record.
    ///
    /// Duplicate identifiers are never merged; the policy picks one entry.
    pub fn add(&mut self, record: PseudodataRecord) {
        let PseudodataRecord {
            index,
            individual,
            biosamples,
        } = record;
        let stable_id = individual.stable_id.clone();

        match self.individuals.entry(stable_id.clone()) {
            Entry::Vacant(entry) => {
                entry.insert((index, individual));
            }
            Entry::Occupied(mut entry) => {
                let (prev_index, prev) = entry.get();
                let prev_desc = describe_individual(*prev_index, prev);
                let this_desc = describe_individual(index, &individual);
                match self.policy {
                    ConflictPolicy::FirstSeen => {
                        report(
                            &mut self.conflicts,
                            Conflict {
                                kind: ConflictKind::Individual,
                                key: stable_id,
                                retained: prev_desc,
                                discarded: this_desc,
                            },
                        );
                        return;
                    }
                    ConflictPolicy::LastSeen => {
                        report(
                            &mut self.conflicts,
                            Conflict {
                                kind: ConflictKind::Individual,
                                key: stable_id.clone(),
                                retained: this_desc,
                                discarded: prev_desc,
                            },
                        );
                        entry.insert((index, individual));
                        self.declared.retain(|_, (owner, _)| owner != &stable_id);
                    }
                }
            }
        }

        for proto in biosamples {
            self.declare(&stable_id, proto);
        }
    }

    fn declare(&mut self, owner: &str, proto: ProtoBiosample) {
        match self.declared.entry(proto.stable_id.clone()) {
            Entry::Vacant(entry) => {
                entry.insert((owner.to_string(), proto));
            }
            Entry::Occupied(mut entry) => {
                let prev_owner = entry.get().0.clone();
                if prev_owner == owner {
                    tracing::debug!(
                        "biosample {:?} declared twice by {:?}",
                        &proto.stable_id,
                        owner
                    );
                    return;
                }
                let (retained, discarded) = match self.policy {
                    ConflictPolicy::FirstSeen => (prev_owner, owner.to_string()),
                    ConflictPolicy::LastSeen => {
                        let key = proto.stable_id.clone();
                        entry.insert((owner.to_string(), proto));
                        report(
                            &mut self.conflicts,
                            Conflict {
                                kind: ConflictKind::Biosample,
                                key,
                                retained: format!("owner {}", owner),
                                discarded: format!("owner {}", prev_owner),
                            },
                        );
                        return;
                    }
                };
                report(
                    &mut self.conflicts,
                    Conflict {
                        kind: ConflictKind::Biosample,
                        key: proto.stable_id,
                        retained: format!("owner {}", retained),
                        discarded: format!("owner {}", discarded),
                    },
                );
            }
        }
    }

    /// Number of distinct individuals.
    pub fn len(&self) -> usize {
        self.individuals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.individuals.is_empty()
    }

    /// Find the owner of `sample` and its declared metadata, if any.
    fn owner_of(
        &self,
        sample_index: usize,
        sample: &str,
        strategy: LinkStrategy,
    ) -> Option<(&Individual, Option<&ProtoBiosample>)> {
        let declared = self.declared.get(sample);
        match strategy {
            LinkStrategy::ById => match declared {
                Some((owner, proto)) => self
                    .individuals
                    .get(owner)
                    .map(|(_, individual)| (individual, Some(proto))),
                None => self
                    .individuals
                    .get(sample)
                    .map(|(_, individual)| (individual, None)),
            },
            LinkStrategy::Positional => {
                let (_, (_, individual)) = self.individuals.get_index(sample_index)?;
                let proto = declared
                    .filter(|(owner, _)| owner == &individual.stable_id)
                    .map(|(_, proto)| proto);
                Some((individual, proto))
            }
        }
    }
}

struct VariantEntry {
    line_no: usize,
    variant: Variant,
    genotypes: Vec<Genotype>,
}

/// Deduplicated variants with their per-sample genotypes.
pub struct VariantAccumulator {
    options: Options,
    variants: IndexMap<VariantKey, VariantEntry>,
    conflicts: Vec<Conflict>,
    /// Records dropped because no sample carries an alternate allele.
    pub skipped_non_carrier: usize,
    /// Records coalesced into an earlier record with equal coordinates.
    pub coalesced: usize,
}

impl VariantAccumulator {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            variants: IndexMap::new(),
            conflicts: Vec::new(),
            skipped_non_carrier: 0,
            coalesced: 0,
        }
    }

    /// Whether the configured maximal number of variants was reached.
    pub fn is_full(&self) -> bool {
        matches!(self.options.max_var_count, Some(max) if self.variants.len() >= max)
    }

    /// Number of distinct variants.
    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Consume `records` until exhausted, failing on the first error.
    ///
    /// Once `max_var_count` is reached the remaining records are neither
    /// read nor validated.
    pub fn consume<I>(&mut self, records: I) -> Result<(), LoadError>
    where
        I: IntoIterator<Item = Result<ParsedRecord, LoadError>>,
    {
        for record in records {
            if self.is_full() {
                tracing::warn!(
                    "Stopping after {} variants as requested by max_var_count",
                    self.variants.len()
                );
                break;
            }
            self.add(record?);
        }
        Ok(())
    }

    /// Add one parsed record.
    pub fn add(&mut self, record: ParsedRecord) {
        let ParsedRecord {
            line_no,
            variant,
            genotypes,
        } = record;
        if self.options.carriers_only && !genotypes.iter().any(Genotype::is_variant) {
            self.skipped_non_carrier += 1;
            return;
        }

        match self.variants.entry(variant.key.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(VariantEntry {
                    line_no,
                    variant,
                    genotypes,
                });
            }
            Entry::Occupied(mut entry) => {
                self.coalesced += 1;
                let prev = entry.get();
                let prev_desc = format!("{} (line {})", prev.variant.annotation(), prev.line_no);
                let this_desc = format!("{} (line {})", variant.annotation(), line_no);
                let differs = prev.variant.annotation() != variant.annotation();
                let key = variant.key.to_string();
                let (retained, discarded) = match self.options.conflict_policy {
                    ConflictPolicy::FirstSeen => (prev_desc, this_desc),
                    ConflictPolicy::LastSeen => {
                        entry.insert(VariantEntry {
                            line_no,
                            variant,
                            genotypes,
                        });
                        (this_desc, prev_desc)
                    }
                };
                if differs {
                    report(
                        &mut self.conflicts,
                        Conflict {
                            kind: ConflictKind::Variant,
                            key,
                            retained,
                            discarded,
                        },
                    );
                } else {
                    tracing::debug!("coalescing duplicate variant {}: kept {}", key, retained);
                }
            }
        }
    }
}

/// Link every sample column to an individual.
fn link_biosamples(
    samples: &[String],
    identities: &IdentityAccumulator,
    strategy: LinkStrategy,
) -> Result<Vec<Biosample>, LoadError> {
    for (sample, (owner, _)) in &identities.declared {
        if !samples.contains(sample) {
            tracing::debug!(
                "biosample {:?} of {:?} does not occur in the variant file",
                sample,
                owner
            );
        }
    }

    samples
        .iter()
        .enumerate()
        .map(|(i, sample)| {
            let (individual, proto) =
                identities
                    .owner_of(i, sample, strategy)
                    .ok_or_else(|| LoadError::UnlinkedSample {
                        sample: sample.clone(),
                    })?;
            Ok(Biosample {
                stable_id: sample.clone(),
                individual_id: individual.stable_id.clone(),
                sex: individual.sex.clone(),
                tissue: proto
                    .and_then(|p| p.tissue.clone())
                    .unwrap_or_else(|| DEFAULT_TISSUE.to_string()),
                collection: proto.map(|p| p.collection.clone()).unwrap_or_default(),
            })
        })
        .collect()
}

/// Join both sides into one batch.
///
/// Fails with `UnlinkedSample` before any call is built if a sample column
/// cannot be linked to an individual.
pub fn reconcile(
    samples: &[String],
    identities: IdentityAccumulator,
    variants: VariantAccumulator,
    options: &Options,
) -> Result<Batch, LoadError> {
    let biosamples = link_biosamples(samples, &identities, options.link_strategy)?;

    let n_samples = samples.len();
    let mut out_variants = Vec::with_capacity(variants.variants.len());
    let mut calls = Vec::new();
    for (key, entry) in variants.variants {
        let mut stats = VariantStats {
            sample_count: n_samples,
            ..Default::default()
        };
        for (sample, genotype) in samples.iter().zip(entry.genotypes) {
            let is_carrier = genotype.is_variant();
            if is_carrier {
                stats.matching_sample_count += 1;
            }
            if options.carriers_only && !is_carrier {
                continue;
            }
            stats.call_count += 1;
            calls.push(Call {
                variant: key.clone(),
                biosample_id: sample.clone(),
                genotype,
            });
        }
        if n_samples > 0 {
            stats.frequency = stats.matching_sample_count as f64 / n_samples as f64;
        }
        out_variants.push(Variant {
            stats,
            ..entry.variant
        });
    }

    let mut conflicts = identities.conflicts;
    conflicts.extend(variants.conflicts);

    Ok(Batch {
        individuals: identities
            .individuals
            .into_values()
            .map(|(_, individual)| individual)
            .collect(),
        biosamples,
        variants: out_variants,
        calls,
        conflicts,
    })
}
