//! Integration tests for editloc-rs
//!
//! All tests run on a tiny seeded CPU model with a word-level tokenizer;
//! nothing here needs a GPU or a network connection.

use std::path::{Path, PathBuf};

use editloc_rs::{
    aggregate, run_sweep, run_sweep_point, select_overrides, Alg, EditableModel, ObjectiveMode,
    RunConfig, SweepConfig,
};
use tempfile::TempDir;

const VOCAB: &[&str] = &[
    "The", "Eiffel", "Tower", "Colosseum", "Big", "Ben", "Louvre", "Vatican", "Thames", "is",
    "located", "stands", "in", "Paris", "Rome", "London", "a",
];

const DATASET: &str = r#"[
    {
        "case_id": 0,
        "requested_rewrite": {
            "subject": "Eiffel Tower",
            "prompt": "The {} is located in",
            "target_true": {"str": " Paris", "id": "Q90"},
            "target_new": {"str": " Rome", "id": "Q220"}
        },
        "paraphrase_prompts": ["The Eiffel Tower stands in"],
        "neighborhood_prompts": ["The Louvre is located in"]
    },
    {
        "case_id": 1,
        "requested_rewrite": {
            "subject": "Colosseum",
            "prompt": "The {} is located in",
            "target_true": {"str": " Rome", "id": "Q220"},
            "target_new": {"str": " London", "id": "Q84"}
        },
        "paraphrase_prompts": ["The Colosseum stands in"],
        "neighborhood_prompts": ["The Vatican is located in"]
    },
    {
        "case_id": 2,
        "requested_rewrite": {
            "subject": "Big Ben",
            "prompt": "The {} is located in",
            "target_true": {"str": " London", "id": "Q84"},
            "target_new": {"str": " Paris", "id": "Q90"}
        },
        "paraphrase_prompts": ["The Big Ben stands in"],
        "neighborhood_prompts": ["The Thames is located in"]
    }
]"#;

const FT_HPARAMS: &str = r#"{
    "layers": [0],
    "editing_noise": 0.1,
    "lr": 0.05,
    "num_steps": 5
}"#;

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();

        std::fs::write(root.join("data.json"), DATASET).unwrap();
        let ft_dir = root.join("hparams/FT");
        std::fs::create_dir_all(&ft_dir).unwrap();
        std::fs::write(ft_dir.join("synthetic_constr.json"), FT_HPARAMS).unwrap();
        std::fs::create_dir_all(root.join("results")).unwrap();

        Self { _dir: dir, root }
    }

    fn config(&self) -> RunConfig {
        RunConfig {
            alg: Alg::FineTune,
            model_name: "synthetic".into(),
            ds_name: "cf".into(),
            data_path: self.root.join("data.json"),
            snippet_path: None,
            dataset_size_limit: Some(3),
            do_essence_tests: false,
            skip_generation_tests: true,
            conserve_memory: false,
            verbose: false,
            overwrite: false,
            correctness_check: false,
            target_prob_check: 0.0,
            objective: ObjectiveMode::Default,
            results_dir: self.root.join("results"),
            hparams_dir: self.root.join("hparams"),
        }
    }
}

fn model() -> EditableModel {
    EditableModel::synthetic(VOCAB, 42).unwrap()
}

fn overrides(cfg: &RunConfig) -> editloc_rs::Overrides {
    select_overrides(1, 1, cfg.alg, 2, cfg.objective).unwrap()
}

fn case_files(run_dir: &Path) -> Vec<PathBuf> {
    (0..3)
        .map(|i| run_dir.join(format!("case_{i}.json")))
        .collect()
}

/// End-to-end: a 3-case run produces 3 result files with pre and post
/// bundles, and aggregation yields 3 rows with finite composite scores
#[test]
fn end_to_end_three_cases() {
    let fixture = Fixture::new();
    let cfg = fixture.config();
    let mut model = model();

    let outcome = run_sweep_point(&mut model, &cfg, &overrides(&cfg)).unwrap();
    assert_eq!(outcome.cases_edited, 3);
    assert_eq!(outcome.cases_skipped_existing, 0);

    for path in case_files(&outcome.run_dir) {
        assert!(path.exists(), "missing {}", path.display());
        let record: editloc_rs::MetricsRecord =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(!record.pre.rewrite_prompts_probs.is_empty());
        assert!(!record.post.rewrite_prompts_probs.is_empty());
        assert!(record.time >= 0.0);
    }

    let table = aggregate(&cfg.results_dir, &outcome.experiment_name, 3).unwrap();
    assert_eq!(table.len(), 3);
    for row in &table.rows {
        let score = row.post_score.expect("all sub-scores present");
        assert!(score.is_finite() && (0.0..=1.0).contains(&score));
        assert!(row.pre_score.is_some());
    }
}

/// Idempotence: a second run with overwrite off performs zero edits and
/// leaves every result file byte-identical
#[test]
fn second_run_is_a_no_op() {
    let fixture = Fixture::new();
    let cfg = fixture.config();
    let mut model = model();

    let first = run_sweep_point(&mut model, &cfg, &overrides(&cfg)).unwrap();
    assert_eq!(first.cases_edited, 3);
    let bytes_before: Vec<Vec<u8>> = case_files(&first.run_dir)
        .iter()
        .map(|p| std::fs::read(p).unwrap())
        .collect();

    let second = run_sweep_point(&mut model, &cfg, &overrides(&cfg)).unwrap();
    assert_eq!(second.cases_edited, 0);
    assert_eq!(second.cases_skipped_existing, 3);

    let bytes_after: Vec<Vec<u8>> = case_files(&first.run_dir)
        .iter()
        .map(|p| std::fs::read(p).unwrap())
        .collect();
    assert_eq!(bytes_before, bytes_after);
}

/// Resume after interruption: with cases 0–1 already checkpointed, a rerun
/// processes only case 2 and leaves the earlier files untouched
#[test]
fn resume_processes_only_missing_cases() {
    let fixture = Fixture::new();
    let mut cfg = fixture.config();
    let mut model = model();

    // simulate a crash after case 1: only the first two cases ran
    cfg.dataset_size_limit = Some(2);
    let partial = run_sweep_point(&mut model, &cfg, &overrides(&cfg)).unwrap();
    assert_eq!(partial.cases_edited, 2);
    let early_files: Vec<Vec<u8>> = case_files(&partial.run_dir)[..2]
        .iter()
        .map(|p| std::fs::read(p).unwrap())
        .collect();

    cfg.dataset_size_limit = Some(3);
    let resumed = run_sweep_point(&mut model, &cfg, &overrides(&cfg)).unwrap();
    assert_eq!(resumed.cases_edited, 1);
    assert_eq!(resumed.cases_skipped_existing, 2);
    assert!(case_files(&resumed.run_dir)[2].exists());

    let early_after: Vec<Vec<u8>> = case_files(&partial.run_dir)[..2]
        .iter()
        .map(|p| std::fs::read(p).unwrap())
        .collect();
    assert_eq!(early_files, early_after);
}

/// Weight restoration: after the full edit/evaluate cycle every parameter
/// tensor is bit-identical to its pre-edit value
#[test]
fn weights_are_restored_after_every_case() {
    let fixture = Fixture::new();
    let cfg = fixture.config();
    let mut model = model();

    let before = model.parameter_checksum().unwrap();
    run_sweep_point(&mut model, &cfg, &overrides(&cfg)).unwrap();
    let after = model.parameter_checksum().unwrap();
    assert_eq!(before, after, "model state leaked across the run");
}

/// Pre-filter gates: a case failing every active gate writes no result
/// file and is revisited on the next invocation
#[test]
fn gated_cases_leave_no_trace_and_are_retried() {
    let fixture = Fixture::new();
    let mut cfg = fixture.config();
    // impossible probability floor: every case fails the gate
    cfg.target_prob_check = 1.1;
    let mut model = model();

    let first = run_sweep_point(&mut model, &cfg, &overrides(&cfg)).unwrap();
    assert_eq!(first.cases_edited, 0);
    assert_eq!(first.cases_gated, 3);
    for path in case_files(&first.run_dir) {
        assert!(!path.exists(), "gated case left {}", path.display());
    }

    // rerun: the gated cases are examined again, not remembered as done
    let second = run_sweep_point(&mut model, &cfg, &overrides(&cfg)).unwrap();
    assert_eq!(second.cases_gated, 3);
    assert_eq!(second.cases_skipped_existing, 0);
}

/// The objective changes the run directory, so results never collide
#[test]
fn objectives_get_separate_run_directories() {
    let fixture = Fixture::new();
    let cfg = fixture.config();
    let mut erasure_cfg = fixture.config();
    erasure_cfg.objective = ObjectiveMode::FactErasure;
    let mut model = model();

    let default_run = run_sweep_point(&mut model, &cfg, &overrides(&cfg)).unwrap();
    let erasure_run =
        run_sweep_point(&mut model, &erasure_cfg, &overrides(&erasure_cfg)).unwrap();
    assert_ne!(default_run.run_dir, erasure_run.run_dir);
    assert_eq!(erasure_run.cases_edited, 3);
}

/// Full sweep: one (window, layer) point, summary CSV written and tagged
#[test]
fn sweep_writes_tagged_summary_csv() {
    let fixture = Fixture::new();
    let sweep = SweepConfig {
        run: fixture.config(),
        window_sizes: vec![1],
        edit_layer: 1,
        run_experiments: true,
        upload_endpoint: None,
    };
    let mut model = model();

    let (table, save_path) = run_sweep(&mut model, &sweep).unwrap();
    assert_eq!(table.len(), 3);
    assert!(save_path.exists());

    let csv = std::fs::read_to_string(&save_path).unwrap();
    let mut lines = csv.lines();
    let header = lines.next().unwrap();
    assert!(header.starts_with("case_id,"));
    assert!(header.ends_with("edit_method,edit_central_layer,edit_window_size"));
    let rows: Vec<&str> = lines.collect();
    assert_eq!(rows.len(), 3);
    for line in rows {
        assert!(line.ends_with("FT,1,1"), "untagged row: {line}");
    }
}

/// Aggregate-only mode reuses existing results without touching the model
#[test]
fn aggregate_only_mode_reads_back_results() {
    let fixture = Fixture::new();
    let cfg = fixture.config();
    let mut model = model();
    run_sweep_point(&mut model, &cfg, &overrides(&cfg)).unwrap();

    let checksum = model.parameter_checksum().unwrap();
    let sweep = SweepConfig {
        run: cfg,
        window_sizes: vec![1],
        edit_layer: 1,
        run_experiments: false,
        upload_endpoint: None,
    };
    let (table, _) = run_sweep(&mut model, &sweep).unwrap();
    assert_eq!(table.len(), 3);
    assert_eq!(checksum, model.parameter_checksum().unwrap());
}

/// The fact-forcing objective runs end to end with edit-time noising
#[test]
fn fact_forcing_objective_runs() {
    let fixture = Fixture::new();
    let mut cfg = fixture.config();
    cfg.objective = ObjectiveMode::FactForcing;
    cfg.dataset_size_limit = Some(1);
    let mut model = model();

    let before = model.parameter_checksum().unwrap();
    let outcome = run_sweep_point(&mut model, &cfg, &overrides(&cfg)).unwrap();
    assert_eq!(outcome.cases_edited, 1);
    assert_eq!(before, model.parameter_checksum().unwrap());

    let record: editloc_rs::MetricsRecord = serde_json::from_str(
        &std::fs::read_to_string(&case_files(&outcome.run_dir)[0]).unwrap(),
    )
    .unwrap();
    // forcing points the edit back at the true answer
    assert_eq!(
        record.requested_rewrite.target_new.str,
        record.requested_rewrite.target_true.str
    );
    assert!(record.requested_rewrite.request_baseline.is_some());
}
