//! Atomic persistence of a reconciled batch.
//!
//! All rows of a batch are written in one transaction in the order
//! dataset, individuals, biosamples, variants, calls.  Individuals and
//! variants are upserts on their natural keys where existing rows win.
//! Biosamples and calls are only inserted after their parents were found.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::{
    conf,
    db::schema,
    err::LoadError,
    ingest::ds::{Batch, Biosample, Call, Entity, Individual, Variant, VariantKey},
};

/// Counts of rows touched by one write.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WriteSummary {
    pub individuals_inserted: usize,
    pub individuals_existing: usize,
    pub biosamples_inserted: usize,
    pub biosamples_existing: usize,
    pub variants_inserted: usize,
    pub variants_existing: usize,
    pub calls_inserted: usize,
    pub calls_existing: usize,
}

/// Write `batch` into `conn` such that either all or nothing becomes visible.
///
/// With `clear`, all tables are emptied first within the same transaction,
/// so a failed write also keeps the previous rows.
pub fn write_batch(
    conn: &mut Connection,
    batch: &Batch,
    dataset: &conf::Dataset,
    clear: bool,
) -> Result<WriteSummary, LoadError> {
    let tx = conn.transaction()?;
    let cleared = if clear {
        tracing::info!("clearing tables ...");
        schema::clear_in(&tx).map_err(LoadError::from)
    } else {
        Ok(())
    };
    let result = cleared
        .and_then(|()| BatchWriter::new(&tx, dataset))
        .and_then(|mut writer| {
            for entity in batch.iter_entities() {
                writer.write(entity)?;
            }
            writer.finish()
        });
    match result {
        Ok(summary) => {
            tx.commit()?;
            Ok(summary)
        }
        Err(e) => {
            tracing::error!("rolling back transaction: {}", e);
            tx.rollback()?;
            Err(e)
        }
    }
}

/// Writes entities within one transaction, remembering primary keys.
struct BatchWriter<'a> {
    tx: &'a Transaction<'a>,
    dataset_pk: i64,
    individual_pks: HashMap<String, i64>,
    biosample_pks: HashMap<String, i64>,
    variant_pks: HashMap<VariantKey, i64>,
    summary: WriteSummary,
}

impl<'a> BatchWriter<'a> {
    fn new(tx: &'a Transaction<'a>, dataset: &conf::Dataset) -> Result<Self, LoadError> {
        tx.execute(
            "INSERT INTO beacon_dataset_table (stable_id, description, access_type, reference_genome)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (stable_id) DO NOTHING",
            params![
                dataset.stable_id,
                dataset.description,
                dataset.access_type,
                dataset.reference_genome
            ],
        )?;
        let dataset_pk: i64 = tx.query_row(
            "SELECT id FROM beacon_dataset_table WHERE stable_id = ?1",
            params![dataset.stable_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO dataset_access_level_table (dataset_id, parent_field, field, access_level)
             VALUES (?1, 'accessLevelSummary', '-', ?2)
             ON CONFLICT (dataset_id, parent_field, field) DO NOTHING",
            params![dataset_pk, dataset.access_level],
        )?;
        tx.execute(
            "INSERT INTO beacon_dataset_consent_code_table (dataset_id, consent_code_id, additional_constraint, version)
             VALUES (?1, ?2, NULL, ?3)
             ON CONFLICT (dataset_id, consent_code_id) DO NOTHING",
            params![dataset_pk, dataset.consent_code_id, dataset.consent_code_version],
        )?;
        Ok(Self {
            tx,
            dataset_pk,
            individual_pks: HashMap::new(),
            biosample_pks: HashMap::new(),
            variant_pks: HashMap::new(),
            summary: WriteSummary::default(),
        })
    }

    fn write(&mut self, entity: Entity<'_>) -> Result<(), LoadError> {
        match entity {
            Entity::Individual(individual) => self.write_individual(individual),
            Entity::Biosample(biosample) => self.write_biosample(biosample),
            Entity::Variant(variant) => self.write_variant(variant),
            Entity::Call(call) => self.write_call(call),
        }
    }

    fn write_individual(&mut self, individual: &Individual) -> Result<(), LoadError> {
        let inserted = self.tx.execute(
            "INSERT INTO patient_table (stable_id, sex, age_of_onset, disease)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (stable_id) DO NOTHING",
            params![
                individual.stable_id,
                individual.sex,
                individual.age_of_onset,
                individual.disease
            ],
        )? == 1;
        let pk: i64 = self.tx.query_row(
            "SELECT id FROM patient_table WHERE stable_id = ?1",
            params![individual.stable_id],
            |row| row.get(0),
        )?;

        if inserted {
            let mut stmt = self.tx.prepare_cached(
                "INSERT INTO patient_attribute_table (patient_id, key, value) VALUES (?1, ?2, ?3)",
            )?;
            for (key, value) in &individual.attributes {
                stmt.execute(params![pk, key, value.to_string()])?;
            }
            self.summary.individuals_inserted += 1;
        } else {
            tracing::debug!(
                "individual {:?} already present, keeping stored attributes",
                &individual.stable_id
            );
            self.summary.individuals_existing += 1;
        }
        self.individual_pks.insert(individual.stable_id.clone(), pk);
        Ok(())
    }

    fn individual_pk(&self, stable_id: &str) -> Result<Option<i64>, LoadError> {
        if let Some(pk) = self.individual_pks.get(stable_id) {
            return Ok(Some(*pk));
        }
        Ok(self
            .tx
            .query_row(
                "SELECT id FROM patient_table WHERE stable_id = ?1",
                params![stable_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn write_biosample(&mut self, biosample: &Biosample) -> Result<(), LoadError> {
        let patient_pk = self.individual_pk(&biosample.individual_id)?.ok_or_else(|| {
            LoadError::ReferentialViolation {
                entity: "biosample",
                key: biosample.stable_id.clone(),
                parent: "individual",
                parent_key: biosample.individual_id.clone(),
            }
        })?;

        let collection = serde_json::to_string(&biosample.collection)?;
        let inserted = self.tx.execute(
            "INSERT INTO beacon_sample_table (stable_id, sex, tissue, collection, patient_id)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (stable_id) DO NOTHING",
            params![
                biosample.stable_id,
                biosample.sex,
                biosample.tissue,
                collection,
                patient_pk
            ],
        )? == 1;
        if inserted {
            self.summary.biosamples_inserted += 1;
        } else {
            self.summary.biosamples_existing += 1;
        }
        let pk: i64 = self.tx.query_row(
            "SELECT id FROM beacon_sample_table WHERE stable_id = ?1",
            params![biosample.stable_id],
            |row| row.get(0),
        )?;
        self.tx.execute(
            "INSERT INTO beacon_dataset_sample_table (dataset_id, sample_id) VALUES (?1, ?2)
             ON CONFLICT (dataset_id, sample_id) DO NOTHING",
            params![self.dataset_pk, pk],
        )?;
        self.biosample_pks.insert(biosample.stable_id.clone(), pk);
        Ok(())
    }

    fn write_variant(&mut self, variant: &Variant) -> Result<(), LoadError> {
        let key = &variant.key;
        let inserted = self.tx.prepare_cached(
            "INSERT INTO beacon_data_table (dataset_id, variant_id, chromosome, reference, alternate, start, \"end\",
                                            quality, filter, call_cnt, sample_cnt, matching_sample_cnt, frequency)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT (dataset_id, chromosome, start, reference, alternate) DO NOTHING",
        )?
        .execute(params![
            self.dataset_pk,
            variant.vcf_id,
            key.chromosome,
            key.reference,
            key.alternate,
            key.position as i64,
            variant.end() as i64,
            variant.quality,
            variant.filter,
            variant.stats.call_count as i64,
            variant.stats.sample_count as i64,
            variant.stats.matching_sample_count as i64,
            variant.stats.frequency
        ])? == 1;
        if inserted {
            self.summary.variants_inserted += 1;
        } else {
            self.summary.variants_existing += 1;
        }
        let pk = self.lookup_variant_pk(key)?.ok_or_else(|| {
            LoadError::ReferentialViolation {
                entity: "variant",
                key: key.to_string(),
                parent: "dataset",
                parent_key: self.dataset_pk.to_string(),
            }
        })?;
        self.variant_pks.insert(key.clone(), pk);
        Ok(())
    }

    fn lookup_variant_pk(&self, key: &VariantKey) -> Result<Option<i64>, LoadError> {
        Ok(self
            .tx
            .prepare_cached(
                "SELECT id FROM beacon_data_table
                 WHERE dataset_id = ?1 AND chromosome = ?2 AND start = ?3 AND reference = ?4 AND alternate = ?5",
            )?
            .query_row(
                params![
                    self.dataset_pk,
                    key.chromosome,
                    key.position as i64,
                    key.reference,
                    key.alternate
                ],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn lookup_biosample_pk(&self, stable_id: &str) -> Result<Option<i64>, LoadError> {
        if let Some(pk) = self.biosample_pks.get(stable_id) {
            return Ok(Some(*pk));
        }
        Ok(self
            .tx
            .query_row(
                "SELECT id FROM beacon_sample_table WHERE stable_id = ?1",
                params![stable_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn write_call(&mut self, call: &Call) -> Result<(), LoadError> {
        let violation = |parent: &'static str, parent_key: String| LoadError::ReferentialViolation {
            entity: "call",
            key: format!("{}/{}", call.variant, call.biosample_id),
            parent,
            parent_key,
        };
        let variant_pk = match self.variant_pks.get(&call.variant) {
            Some(pk) => *pk,
            None => self
                .lookup_variant_pk(&call.variant)?
                .ok_or_else(|| violation("variant", call.variant.to_string()))?,
        };
        let sample_pk = self
            .lookup_biosample_pk(&call.biosample_id)?
            .ok_or_else(|| violation("biosample", call.biosample_id.clone()))?;

        let inserted = self
            .tx
            .prepare_cached(
                "INSERT INTO beacon_data_sample_table (data_id, sample_id, genotype, phased)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (data_id, sample_id) DO NOTHING",
            )?
            .execute(params![
                variant_pk,
                sample_pk,
                call.genotype.to_string(),
                call.genotype.phased
            ])?
            == 1;
        if inserted {
            self.summary.calls_inserted += 1;
        } else {
            self.summary.calls_existing += 1;
        }
        Ok(())
    }

    /// Refresh the dataset counts and return the summary.
    fn finish(self) -> Result<WriteSummary, LoadError> {
        self.tx.execute(
            "UPDATE beacon_dataset_table SET
                variant_cnt = (SELECT COUNT(*) FROM beacon_data_table WHERE dataset_id = ?1),
                call_cnt = (SELECT COUNT(*) FROM beacon_data_sample_table
                            JOIN beacon_data_table ON beacon_data_table.id = beacon_data_sample_table.data_id
                            WHERE beacon_data_table.dataset_id = ?1),
                sample_cnt = (SELECT COUNT(*) FROM beacon_dataset_sample_table WHERE dataset_id = ?1)
             WHERE id = ?1",
            params![self.dataset_pk],
        )?;
        Ok(self.summary)
    }
}
