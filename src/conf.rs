//! Code for supporting the loader configuration file.

use std::path::Path;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use strum::EnumString;

/// Which of two conflicting entries with the same natural key is retained.
#[derive(
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Debug,
    Default,
    EnumString,
    ValueEnum,
    strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Keep the entry seen first.
    #[default]
    FirstSeen,
    /// Keep the entry seen last.
    LastSeen,
}

/// How variant file sample columns are linked to pseudodata individuals.
#[derive(
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Debug,
    Default,
    EnumString,
    ValueEnum,
    strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum LinkStrategy {
    /// Link by declared `biosamples` or by equal identifier.
    #[default]
    ById,
    /// Link the i-th sample column to the i-th individual.
    Positional,
}

/// Description of the Beacon dataset all rows are loaded into.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(default)]
pub struct Dataset {
    /// Stable identifier of the dataset.
    pub stable_id: String,
    /// Human-readable description.
    pub description: String,
    /// Beacon access type.
    pub access_type: String,
    /// Reference genome name.
    pub reference_genome: String,
    /// Value of the `accessLevelSummary` entry.
    pub access_level: String,
    /// Identifier of the dataset's consent code.
    pub consent_code_id: i64,
    /// Version of the consent code.
    pub consent_code_version: String,
}

impl Default for Dataset {
    fn default() -> Self {
        Self {
            stable_id: "childdemo".into(),
            description: "CHILD db demo for AGM".into(),
            access_type: "PUBLIC".into(),
            reference_genome: "GRCh37".into(),
            access_level: "PUBLIC".into(),
            consent_code_id: 1,
            consent_code_version: "v1.0".into(),
        }
    }
}

/// Settings for the identity reconciler.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(default)]
pub struct Reconcile {
    /// Conflict resolution for duplicate individuals and variants.
    pub conflict_policy: ConflictPolicy,
    /// Sample to individual linkage.
    pub link_strategy: LinkStrategy,
    /// Only keep calls carrying a non-reference allele.
    pub carriers_only: bool,
    /// Stop after this many distinct variants.
    pub max_var_count: Option<usize>,
    /// Name of the identifier field in pseudodata objects.
    pub id_key: String,
}

impl Default for Reconcile {
    fn default() -> Self {
        Self {
            conflict_policy: Default::default(),
            link_strategy: Default::default(),
            carriers_only: false,
            max_var_count: None,
            id_key: "id".into(),
        }
    }
}

/// Settings for the target store.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone, Default)]
#[serde(default)]
pub struct Store {
    /// Milliseconds to wait on a locked store before failing.
    pub busy_timeout_ms: Option<u64>,
    /// Replace all existing rows with the loaded batch.
    pub clear: bool,
}

/// Top-level configuration.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone, Default)]
#[serde(default)]
pub struct Top {
    pub dataset: Dataset,
    pub reconcile: Reconcile,
    pub store: Store,
}

impl Top {
    /// Load configuration from the TOML file at `path`.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let toml_str = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::anyhow!(
                "could not read configuration file {}: {}",
                path.as_ref().display(),
                e
            )
        })?;
        toml::from_str(&toml_str)
            .map_err(|e| anyhow::anyhow!("could not parse configuration file: {}", e))
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_from_empty_file() -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();
        let path = tmpdir.join("conf.toml");
        std::fs::write(&path, "")?;

        assert_eq!(Top::from_path(&path)?, Top::default());

        Ok(())
    }

    #[test]
    fn partial_file_keeps_defaults() -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();
        let path = tmpdir.join("conf.toml");
        std::fs::write(
            &path,
            "[dataset]\nstable_id = \"demo2\"\n\n[reconcile]\nconflict_policy = \"last-seen\"\nlink_strategy = \"positional\"\n\n[store]\nbusy_timeout_ms = 500\n",
        )?;

        let top = Top::from_path(&path)?;
        assert_eq!(top.dataset.stable_id, "demo2");
        assert_eq!(top.dataset.reference_genome, "GRCh37");
        assert_eq!(top.dataset.access_level, "PUBLIC");
        assert_eq!(top.dataset.consent_code_id, 1);
        assert_eq!(top.reconcile.conflict_policy, ConflictPolicy::LastSeen);
        assert_eq!(top.reconcile.link_strategy, LinkStrategy::Positional);
        assert_eq!(top.reconcile.id_key, "id");
        assert_eq!(top.store.busy_timeout_ms, Some(500));

        Ok(())
    }

    #[rstest::rstest]
    #[case(ConflictPolicy::FirstSeen, "first-seen")]
    #[case(ConflictPolicy::LastSeen, "last-seen")]
    fn conflict_policy_display(#[case] policy: ConflictPolicy, #[case] expected: &str) {
        assert_eq!(policy.to_string(), expected);
        assert_eq!(expected.parse::<ConflictPolicy>().unwrap(), policy);
    }

    #[test]
    fn missing_file_is_error() {
        assert!(Top::from_path("/nonexistent/conf.toml").is_err());
    }
}
