//! Implementation of `load` subcommand.

use std::{io::Write, time::Duration};

use chrono::NaiveDate;
use rusqlite::Connection;
use thousands::Separable;

use crate::{
    common::io::open_write_maybe_gz,
    conf::{self, ConflictPolicy, LinkStrategy},
    db,
    err::LoadError,
};

pub mod ds;
pub mod pseudodata;
pub mod reconcile;
pub mod vcf;
pub mod writer;

/// Command line arguments for `load` subcommand.
#[derive(Debug, clap::Parser)]
#[command(author, version, about = "load VCF and pseudodata into Beacon tables", long_about = None)]
pub struct Args {
    /// Path to the input VCF file.
    #[arg(value_name = "PATH_VCF")]
    pub path_vcf: String,
    /// Path to the input pseudodata JSON file.
    #[arg(value_name = "PATH_PSEUDODATA")]
    pub path_pseudodata: String,
    /// Path to the store database file.
    #[arg(long)]
    pub path_db: String,
    /// Path to configuration file in TOML format.
    #[arg(long)]
    pub path_conf: Option<String>,
    /// Create missing tables before loading.
    #[arg(long)]
    pub init_schema: bool,
    /// Replace all rows in the tables by the loaded ones; the removal
    /// happens in the same transaction as the load.
    #[arg(long)]
    pub clear: bool,
    /// Stable identifier of the dataset to load into.
    #[arg(long)]
    pub dataset_id: Option<String>,
    /// Maximal number of distinct variants to load; optional.
    #[arg(long)]
    pub max_var_count: Option<usize>,
    /// Only load calls with a non-reference allele.
    #[arg(long)]
    pub carriers_only: bool,
    /// Which duplicate entry to keep.
    #[arg(long, value_enum)]
    pub conflict_policy: Option<ConflictPolicy>,
    /// How sample columns are linked to individuals.
    #[arg(long, value_enum)]
    pub link_strategy: Option<LinkStrategy>,
    /// Name of the identifier field in pseudodata objects.
    #[arg(long)]
    pub id_key: Option<String>,
    /// Milliseconds to wait on a locked store.
    #[arg(long)]
    pub busy_timeout_ms: Option<u64>,
    /// Date ages are computed against, defaults to today.
    #[arg(long)]
    pub reference_date: Option<NaiveDate>,
    /// Optional path to write the load report to as JSON.
    #[arg(long)]
    pub path_report: Option<String>,
}

/// Build the effective configuration; command line flags override the file.
pub fn build_conf(args: &Args) -> Result<conf::Top, anyhow::Error> {
    let mut result = match &args.path_conf {
        Some(path_conf) => conf::Top::from_path(path_conf)?,
        None => conf::Top::default(),
    };
    if let Some(dataset_id) = &args.dataset_id {
        result.dataset.stable_id = dataset_id.clone();
    }
    if let Some(max_var_count) = args.max_var_count {
        result.reconcile.max_var_count = Some(max_var_count);
    }
    if args.carriers_only {
        result.reconcile.carriers_only = true;
    }
    if let Some(conflict_policy) = args.conflict_policy {
        result.reconcile.conflict_policy = conflict_policy;
    }
    if let Some(link_strategy) = args.link_strategy {
        result.reconcile.link_strategy = link_strategy;
    }
    if let Some(id_key) = &args.id_key {
        result.reconcile.id_key = id_key.clone();
    }
    if let Some(busy_timeout_ms) = args.busy_timeout_ms {
        result.store.busy_timeout_ms = Some(busy_timeout_ms);
    }
    if args.clear {
        result.store.clear = true;
    }
    Ok(result)
}

/// Outcome of a successful load.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Report {
    pub individuals: usize,
    pub biosamples: usize,
    pub variants: usize,
    pub calls: usize,
    pub conflicts: usize,
    pub written: writer::WriteSummary,
}

/// Run the full pipeline from the two input files into `conn`.
///
/// Both inputs are parsed concurrently.  Nothing is written unless parsing
/// and reconciliation succeeded; writing is atomic.
pub fn load(
    conn: &mut Connection,
    path_vcf: &str,
    path_pseudodata: &str,
    conf: &conf::Top,
    reference_date: NaiveDate,
) -> Result<Report, LoadError> {
    let options = reconcile::Options::from(&conf.reconcile);
    let pseudo_options = pseudodata::Options {
        id_key: conf.reconcile.id_key.clone(),
        reference_date,
    };

    tracing::info!("parsing {} and {} ...", path_vcf, path_pseudodata);
    let before_parsing = std::time::Instant::now();
    let (variant_side, identity_side) = rayon::join(
        || -> Result<_, LoadError> {
            let source = vcf::VcfSource::open(path_vcf)?;
            let mut variants = reconcile::VariantAccumulator::new(options.clone());
            variants.consume(source.records()?)?;
            Ok((source, variants))
        },
        || -> Result<_, LoadError> {
            let records = pseudodata::read_path(path_pseudodata, &pseudo_options)?;
            Ok(reconcile::IdentityAccumulator::from_records(
                options.conflict_policy,
                records,
            ))
        },
    );
    let (source, variants) = variant_side?;
    let identities = identity_side?;
    tracing::info!(
        "... parsed {} samples, {} distinct variants ({} coalesced, {} without carriers) and {} individuals in {:?}",
        source.samples().len(),
        variants.len().separate_with_commas(),
        variants.coalesced.separate_with_commas(),
        variants.skipped_non_carrier.separate_with_commas(),
        identities.len().separate_with_commas(),
        before_parsing.elapsed()
    );

    let batch = reconcile::reconcile(source.samples(), identities, variants, &options)?;
    if !batch.conflicts.is_empty() {
        tracing::warn!(
            "{} conflicts were resolved with policy {}",
            batch.conflicts.len(),
            options.conflict_policy
        );
    }

    tracing::info!("writing batch ...");
    let before_writing = std::time::Instant::now();
    let written = writer::write_batch(conn, &batch, &conf.dataset, conf.store.clear)?;
    tracing::info!(
        "... wrote {} calls in {:?}",
        written.calls_inserted.separate_with_commas(),
        before_writing.elapsed()
    );

    Ok(Report {
        individuals: batch.individuals.len(),
        biosamples: batch.biosamples.len(),
        variants: batch.variants.len(),
        calls: batch.calls.len(),
        conflicts: batch.conflicts.len(),
        written,
    })
}

/// Main entry point for `load` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    let before_anything = std::time::Instant::now();
    tracing::info!("beacon-loader {}", crate::common::worker_version());
    tracing::info!("args_common = {:#?}", &args_common);
    tracing::info!("args = {:#?}", &args);

    let conf = build_conf(args)?;
    tracing::debug!("conf = {:#?}", &conf);

    let mut conn = db::open(
        &args.path_db,
        conf.store.busy_timeout_ms.map(Duration::from_millis),
    )?;
    if args.init_schema {
        tracing::info!("creating missing tables ...");
        db::schema::ensure_schema(&conn)
            .map_err(|e| anyhow::anyhow!("problem creating schema: {}", e))?;
    }

    let reference_date = args
        .reference_date
        .unwrap_or_else(|| chrono::Local::now().date_naive());
    let report = load(
        &mut conn,
        &args.path_vcf,
        &args.path_pseudodata,
        &conf,
        reference_date,
    )?;
    tracing::info!("report = {:#?}", &report);
    if let Some(path_report) = &args.path_report {
        let mut writer = open_write_maybe_gz(path_report)?;
        serde_json::to_writer_pretty(&mut writer, &report)?;
        writer.flush()?;
    }

    tracing::info!(
        "All of `load` completed in {:?}",
        before_anything.elapsed()
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::schema::{self, count_rows};

    const VCF: &str = "##fileformat=VCFv4.2\n\
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\tS2\n\
1\t1000\trs1\tA\tG\t30\tPASS\t.\tGT\t0/1\t0/0\n\
1\t1000\trs1\tA\tG\t40\tPASS\t.\tGT\t1/1\t0/0\n\
1\t2000\t.\tC\tT\t.\t.\t.\tGT\t0/0\t1|1\n";

    const PSEUDODATA: &str = r#"[
        {"id": "S1", "sex": "Female", "phenotype": ["HP:0001250"]},
        {"id": "S2", "demographic": {"biologicalSex": "Male", "age": "01-Jan-10"}}
    ]"#;

    fn reference_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 6, 1).unwrap()
    }

    struct Fixture {
        _tmpdir: temp_testdir::TempDir,
        path_vcf: String,
        path_pseudodata: String,
    }

    fn fixture(vcf: &str, pseudodata: &str) -> Fixture {
        let tmpdir = temp_testdir::TempDir::default();
        let path_vcf = tmpdir.join("in.vcf");
        let path_pseudodata = tmpdir.join("pseudo.json");
        std::fs::write(&path_vcf, vcf).unwrap();
        std::fs::write(&path_pseudodata, pseudodata).unwrap();
        Fixture {
            path_vcf: path_vcf.to_str().expect("invalid path").into(),
            path_pseudodata: path_pseudodata.to_str().expect("invalid path").into(),
            _tmpdir: tmpdir,
        }
    }

    fn row_counts(conn: &Connection) -> Vec<usize> {
        schema::TABLES
            .iter()
            .map(|table| count_rows(conn, table).unwrap())
            .collect()
    }

    #[test]
    fn load_once() -> Result<(), anyhow::Error> {
        let fixture = fixture(VCF, PSEUDODATA);
        let mut conn = writer::test::memory_store();

        let report = load(
            &mut conn,
            &fixture.path_vcf,
            &fixture.path_pseudodata,
            &Default::default(),
            reference_date(),
        )?;

        assert_eq!(report.individuals, 2);
        assert_eq!(report.biosamples, 2);
        assert_eq!(report.variants, 2);
        assert_eq!(report.calls, 4);
        assert_eq!(report.conflicts, 1);
        assert_eq!(count_rows(&conn, "beacon_data_table")?, 2);

        let quality: f64 = conn.query_row(
            "SELECT quality FROM beacon_data_table WHERE start = 1000",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(quality, 30.0);

        let (sex, age): (String, i64) = conn.query_row(
            "SELECT sex, age_of_onset FROM patient_table WHERE stable_id = 'S2'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        assert_eq!((sex.as_str(), age), ("male", 10));

        Ok(())
    }

    #[test]
    fn load_twice_is_idempotent() -> Result<(), anyhow::Error> {
        let fixture = fixture(VCF, PSEUDODATA);
        let mut conn = writer::test::memory_store();
        let conf = conf::Top::default();

        load(
            &mut conn,
            &fixture.path_vcf,
            &fixture.path_pseudodata,
            &conf,
            reference_date(),
        )?;
        let after_first = row_counts(&conn);
        let report = load(
            &mut conn,
            &fixture.path_vcf,
            &fixture.path_pseudodata,
            &conf,
            reference_date(),
        )?;

        assert_eq!(row_counts(&conn), after_first);
        assert_eq!(report.written.individuals_inserted, 0);
        assert_eq!(report.written.variants_inserted, 0);
        assert_eq!(report.written.calls_existing, 4);

        Ok(())
    }

    #[test]
    fn unlinked_sample_writes_nothing() -> Result<(), anyhow::Error> {
        let fixture = fixture(VCF, r#"[{"id": "S1"}]"#);
        let mut conn = writer::test::memory_store();

        let result = load(
            &mut conn,
            &fixture.path_vcf,
            &fixture.path_pseudodata,
            &Default::default(),
            reference_date(),
        );

        match result {
            Err(LoadError::UnlinkedSample { sample }) => assert_eq!(sample, "S2"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(row_counts(&conn).iter().all(|n| *n == 0));

        Ok(())
    }

    #[test]
    fn failure_in_call_phase_writes_nothing() -> Result<(), anyhow::Error> {
        let fixture = fixture(VCF, PSEUDODATA);
        let mut conn = writer::test::memory_store();
        conn.execute_batch(
            "CREATE TRIGGER fail_calls BEFORE INSERT ON beacon_data_sample_table
             BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
        )?;

        let result = load(
            &mut conn,
            &fixture.path_vcf,
            &fixture.path_pseudodata,
            &Default::default(),
            reference_date(),
        );

        assert!(matches!(result, Err(LoadError::Store(_))));
        assert_eq!(count_rows(&conn, "patient_table")?, 0);
        assert_eq!(count_rows(&conn, "beacon_sample_table")?, 0);
        assert_eq!(count_rows(&conn, "beacon_data_table")?, 0);

        Ok(())
    }

    #[rstest::rstest]
    #[case(
        "##fileformat=VCFv4.2\n#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\tS2\n1\t1\t.\tA\tG\t.\t.\t.\tGT\t0/1\n",
        PSEUDODATA,
        2
    )]
    #[case(VCF, r#"[{"id": "S1"}, {"sex": "male"}]"#, 3)]
    #[case(VCF, "not json", 7)]
    fn parse_errors_write_nothing(
        #[case] vcf: &str,
        #[case] pseudodata: &str,
        #[case] exit_code: u8,
    ) {
        let fixture = fixture(vcf, pseudodata);
        let mut conn = writer::test::memory_store();

        let err = load(
            &mut conn,
            &fixture.path_vcf,
            &fixture.path_pseudodata,
            &Default::default(),
            reference_date(),
        )
        .unwrap_err();

        assert_eq!(err.exit_code(), exit_code);
        assert!(row_counts(&conn).iter().all(|n| *n == 0));
    }

    #[test]
    fn build_conf_flags_override_file() -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();
        let path_conf = tmpdir.join("conf.toml");
        std::fs::write(
            &path_conf,
            "[dataset]\nstable_id = \"from-file\"\n\n[reconcile]\nmax_var_count = 5\nconflict_policy = \"last-seen\"\n",
        )?;

        let args = Args {
            path_vcf: "in.vcf".into(),
            path_pseudodata: "pseudo.json".into(),
            path_db: "store.db".into(),
            path_conf: Some(path_conf.to_str().expect("invalid path").into()),
            init_schema: false,
            clear: false,
            dataset_id: Some("from-flag".into()),
            max_var_count: None,
            carriers_only: true,
            conflict_policy: None,
            link_strategy: Some(LinkStrategy::Positional),
            id_key: None,
            busy_timeout_ms: Some(250),
            reference_date: None,
            path_report: None,
        };
        let conf = build_conf(&args)?;

        assert_eq!(conf.dataset.stable_id, "from-flag");
        assert_eq!(conf.reconcile.max_var_count, Some(5));
        assert_eq!(conf.reconcile.conflict_policy, ConflictPolicy::LastSeen);
        assert_eq!(conf.reconcile.link_strategy, LinkStrategy::Positional);
        assert!(conf.reconcile.carriers_only);
        assert_eq!(conf.store.busy_timeout_ms, Some(250));
        assert!(!conf.store.clear);

        Ok(())
    }

    #[test]
    fn smoke_test_run() -> Result<(), anyhow::Error> {
        let fixture = fixture(VCF, PSEUDODATA);
        let tmpdir = temp_testdir::TempDir::default();
        let path_db: String = tmpdir.join("store.db").to_str().expect("invalid path").into();

        let args = Args {
            path_vcf: fixture.path_vcf.clone(),
            path_pseudodata: fixture.path_pseudodata.clone(),
            path_db: path_db.clone(),
            path_conf: None,
            init_schema: true,
            clear: true,
            dataset_id: None,
            max_var_count: None,
            carriers_only: true,
            conflict_policy: None,
            link_strategy: None,
            id_key: None,
            busy_timeout_ms: Some(1000),
            reference_date: Some(reference_date()),
            path_report: Some(tmpdir.join("report.json").to_str().expect("invalid path").into()),
        };
        run(&Default::default(), &args)?;

        let conn = db::open(&path_db, None)?;
        assert_eq!(count_rows(&conn, "beacon_data_sample_table")?, 2);

        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(tmpdir.join("report.json"))?)?;
        assert_eq!(report["calls"], 2);
        assert_eq!(report["written"]["calls_inserted"], 2);

        Ok(())
    }

    #[test]
    fn failed_run_with_clear_keeps_store() -> Result<(), anyhow::Error> {
        let good = fixture(VCF, PSEUDODATA);
        let bad = fixture(
            "##fileformat=VCFv4.2\n\
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\tS2\n\
1\t1000\t.\tA\tG\t.\t.\t.\tGT\t0/1\n",
            PSEUDODATA,
        );
        let tmpdir = temp_testdir::TempDir::default();
        let path_db: String = tmpdir.join("store.db").to_str().expect("invalid path").into();
        let args_for = |fixture: &Fixture, clear: bool| Args {
            path_vcf: fixture.path_vcf.clone(),
            path_pseudodata: fixture.path_pseudodata.clone(),
            path_db: path_db.clone(),
            path_conf: None,
            init_schema: true,
            clear,
            dataset_id: None,
            max_var_count: None,
            carriers_only: false,
            conflict_policy: None,
            link_strategy: None,
            id_key: None,
            busy_timeout_ms: None,
            reference_date: Some(reference_date()),
            path_report: None,
        };

        run(&Default::default(), &args_for(&good, false))?;
        let before = row_counts(&db::open(&path_db, None)?);
        assert_eq!(before[schema::TABLES.len() - 1], 4);

        let err = run(&Default::default(), &args_for(&bad, true)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LoadError>(),
            Some(LoadError::MalformedRecord { line: 3, .. })
        ));
        assert_eq!(row_counts(&db::open(&path_db, None)?), before);

        run(&Default::default(), &args_for(&good, true))?;
        assert_eq!(row_counts(&db::open(&path_db, None)?), before);

        Ok(())
    }
}
