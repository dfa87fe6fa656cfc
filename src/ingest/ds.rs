//! Datastructures flowing from the parsers through the reconciler into the writer.

use indexmap::IndexMap;
use itertools::Itertools;
use serde::Serialize;

/// Open attribute mapping, kept in source order.
pub type Attributes = IndexMap<String, serde_json::Value>;

/// Identity record from the pseudodata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Individual {
    /// Stable, globally unique identifier.
    pub stable_id: String,
    /// All other keys of the pseudodata object.
    pub attributes: Attributes,
    /// Derived, lower-cased biological sex.
    pub sex: Option<String>,
    /// Derived age in whole years.
    pub age_of_onset: Option<i32>,
    /// Derived disease category, empty if none applies.
    pub disease: Option<String>,
}

/// Sample linkage as declared in the pseudodata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtoBiosample {
    pub stable_id: String,
    pub tissue: Option<String>,
    pub collection: Attributes,
}

/// A sample belonging to exactly one individual.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Biosample {
    pub stable_id: String,
    /// Stable identifier of the owning individual.
    pub individual_id: String,
    pub sex: Option<String>,
    pub tissue: String,
    pub collection: Attributes,
}

/// Natural key of a variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct VariantKey {
    pub chromosome: String,
    /// 1-based position.
    pub position: u64,
    pub reference: String,
    /// Alternate alleles joined by `,`.
    pub alternate: String,
}

impl std::fmt::Display for VariantKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.chromosome, self.position, self.reference, self.alternate
        )
    }
}

/// Per-variant counts derived during reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VariantStats {
    pub call_count: usize,
    pub sample_count: usize,
    pub matching_sample_count: usize,
    pub frequency: f64,
}

/// One genomic position/allele change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variant {
    pub key: VariantKey,
    /// Value of the VCF `ID` column.
    pub vcf_id: Option<String>,
    pub quality: Option<f64>,
    pub filter: Option<String>,
    pub stats: VariantStats,
}

impl Variant {
    /// 1-based, inclusive end position.
    pub fn end(&self) -> u64 {
        self.key.position + (self.key.reference.len() as u64).saturating_sub(1)
    }

    /// Annotation compared when coalescing duplicate coordinates.
    pub fn annotation(&self) -> String {
        format!(
            "QUAL={} FILTER={}",
            self.quality
                .map(|q| q.to_string())
                .unwrap_or_else(|| ".".into()),
            self.filter.as_deref().unwrap_or(".")
        )
    }
}

/// Genotype of one sample at one variant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Genotype {
    /// Allele indices, `None` for no-call.
    pub alleles: Vec<Option<u32>>,
    pub phased: bool,
}

impl Genotype {
    /// Whether any allele is non-reference.
    pub fn is_variant(&self) -> bool {
        self.alleles.iter().any(|a| matches!(a, Some(a) if *a > 0))
    }
}

impl std::str::FromStr for Genotype {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            anyhow::bail!("empty genotype value");
        }
        let phased = s.contains('|');
        let alleles = s
            .split(|c| c == '/' || c == '|')
            .map(|allele| match allele {
                "." => Ok(None),
                _ => allele
                    .parse::<u32>()
                    .map(Some)
                    .map_err(|e| anyhow::anyhow!("invalid allele {:?} in {:?}: {}", allele, s, e)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            phased: phased && alleles.len() > 1,
            alleles,
        })
    }
}

impl std::fmt::Display for Genotype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.alleles.is_empty() {
            return write!(f, ".");
        }
        let sep = if self.phased { "|" } else { "/" };
        let s = self
            .alleles
            .iter()
            .map(|a| a.map(|a| a.to_string()).unwrap_or_else(|| ".".into()))
            .join(sep);
        write!(f, "{}", s)
    }
}

/// Links a variant to a biosample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Call {
    pub variant: VariantKey,
    pub biosample_id: String,
    pub genotype: Genotype,
}

/// Kind of entity a conflict was reported for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConflictKind {
    Individual,
    Biosample,
    Variant,
}

/// A non-fatal conflict between two entries with the same natural key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub key: String,
    pub retained: String,
    pub discarded: String,
}

/// Entity reference in write order.
#[derive(Debug, Clone, Copy)]
pub enum Entity<'a> {
    Individual(&'a Individual),
    Biosample(&'a Biosample),
    Variant(&'a Variant),
    Call(&'a Call),
}

/// Fully reconciled set of entities for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Batch {
    pub individuals: Vec<Individual>,
    pub biosamples: Vec<Biosample>,
    pub variants: Vec<Variant>,
    pub calls: Vec<Call>,
    pub conflicts: Vec<Conflict>,
}

impl Batch {
    /// Iterate all entities such that every call comes after its parents.
    pub fn iter_entities(&self) -> impl Iterator<Item = Entity<'_>> {
        self.individuals
            .iter()
            .map(Entity::Individual)
            .chain(self.biosamples.iter().map(Entity::Biosample))
            .chain(self.variants.iter().map(Entity::Variant))
            .chain(self.calls.iter().map(Entity::Call))
    }
}
