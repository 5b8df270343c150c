//! Integration tests for the `dialectic` CLI
//!
//! Each test runs the binary against a fresh database in a temp directory
//! and inspects the JSON it prints.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use tempfile::TempDir;

/// Two single-step stages, so a test can walk a whole session.
const SMALL_PIPELINE: &str = r#"
[[pipeline.stages]]
slug = "draft"

[[pipeline.stages.steps]]
step_key = "draft_write"
job_type = "EXECUTE"

[[pipeline.stages]]
slug = "review"

[[pipeline.stages.steps]]
step_key = "review_write"
job_type = "EXECUTE"
"#;

/// Helper to create a dialectic Command rooted in `dir`
fn dialectic(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("dialectic");
    cmd.current_dir(dir.path())
        .env_remove("DIALECTIC_DB_PATH")
        .env_remove("RUST_LOG")
        .arg("--config")
        .arg(dir.path().join("dialectic.toml"))
        .arg("--db")
        .arg(dir.path().join("dialectic.db"));
    cmd
}

/// Run a command that must succeed and parse its stdout as JSON
fn run_json(dir: &TempDir, args: &[&str]) -> Value {
    let output = dialectic(dir).args(args).assert().success().get_output().clone();
    serde_json::from_slice(&output.stdout).unwrap()
}

fn start_session(dir: &TempDir) -> String {
    let session = run_json(dir, &["start-session", "-m", "model-a", "-m", "model-b"]);
    session["id"].as_str().unwrap().to_string()
}

fn submit(dir: &TempDir, session: &str, stage: &str, step: &str, extra: &[&str]) -> String {
    let mut args = vec![
        "submit-job",
        "--session",
        session,
        "--stage",
        stage,
        "--type",
        "EXECUTE",
        "--step",
        step,
    ];
    args.extend_from_slice(extra);
    let job = run_json(dir, &args);
    job["id"].as_str().unwrap().to_string()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        cargo_bin_cmd!("dialectic").arg("--help").assert().success();
    }

    #[test]
    fn test_version() {
        cargo_bin_cmd!("dialectic")
            .arg("--version")
            .assert()
            .success();
    }

    #[test]
    fn test_init_creates_config_and_database() {
        let dir = TempDir::new().unwrap();

        let out = run_json(&dir, &["init"]);
        assert_eq!(out["config_written"], true);
        assert!(dir.path().join("dialectic.toml").exists());
        assert!(dir.path().join("dialectic.db").exists());

        let again = run_json(&dir, &["init"]);
        assert_eq!(again["config_written"], false);
    }

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        let out = run_json(&dir, &["config", "show"]);
        assert_eq!(out["config_file_exists"], false);
        assert_eq!(out["effective"]["reconciler"]["mode"], "inline");
        assert_eq!(out["pipeline"]["stages"][0]["slug"], "thesis");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("dialectic.toml"), "[reconciler]\nmode = \"sideways\"\n")
            .unwrap();
        dialectic(&dir)
            .arg("drain")
            .assert()
            .failure()
            .stderr(predicate::str::contains("dialectic.toml"));
    }
}

// =============================================================================
// Job Lifecycle Tests
// =============================================================================

mod job_lifecycle {
    use super::*;

    #[test]
    fn test_start_session_on_first_stage() {
        let dir = TempDir::new().unwrap();
        let session = run_json(&dir, &["start-session", "-m", "model-a"]);
        assert_eq!(session["status"], "pending_thesis");
        assert_eq!(session["current_stage_id"], "thesis");
        assert_eq!(session["selected_model_ids"][0], "model-a");
    }

    #[test]
    fn test_submit_claim_complete() {
        let dir = TempDir::new().unwrap();
        let session = start_session(&dir);
        let job = submit(&dir, &session, "thesis", "thesis_generate_business_case", &[
            "--payload",
            r#"{"model_id": "model-a"}"#,
        ]);

        let claimed = run_json(&dir, &["claim", &job]);
        assert_eq!(claimed["claimed"], true);
        assert_eq!(claimed["job"]["status"], "processing");
        assert_eq!(claimed["job"]["attempt_count"], 1);

        let again = run_json(&dir, &["claim", &job]);
        assert_eq!(again["claimed"], false);

        let done = run_json(&dir, &["complete", &job, "--results", r#"{"ok": true}"#]);
        assert_eq!(done["outcome"], "applied");
        assert_eq!(done["job"]["status"], "completed");

        let state = run_json(&dir, &["session", &session]);
        assert_eq!(state["status"], "generating_thesis");
    }

    #[test]
    fn test_failure_cascades_to_dependents() {
        let dir = TempDir::new().unwrap();
        let session = start_session(&dir);
        let first = submit(&dir, &session, "thesis", "thesis_generate_business_case", &[]);
        let second = submit(&dir, &session, "thesis", "thesis_generate_feature_spec", &[
            "--prerequisite",
            &first,
        ]);

        run_json(&dir, &["claim", &first]);
        let failed = run_json(&dir, &["fail", &first, "--message", "model refused"]);
        assert_eq!(failed["job"]["error_details"]["code"], "execution_error");

        let jobs = run_json(&dir, &["jobs", &session, "--stage", "thesis"]);
        let dependent = jobs
            .as_array()
            .unwrap()
            .iter()
            .find(|j| j["id"] == second.as_str())
            .unwrap();
        assert_eq!(dependent["status"], "failed");
        assert_eq!(
            dependent["error_details"]["code"],
            "upstream_prerequisite_failed"
        );
        assert_eq!(dependent["error_details"]["root_job_id"], first.as_str());

        let state = run_json(&dir, &["session", &session, "--history"]);
        assert_eq!(state["session"]["status"], "thesis_failed");
        assert!(!state["history"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_plan_children_from_command_line() {
        let dir = TempDir::new().unwrap();
        let session = start_session(&dir);
        let plan = run_json(&dir, &[
            "submit-job",
            "--session",
            &session,
            "--stage",
            "thesis",
            "--type",
            "PLAN",
            "--step",
            "thesis_build_stage_header",
        ]);
        let plan_id = plan["id"].as_str().unwrap();
        run_json(&dir, &["claim", plan_id]);

        let children = r#"[
            {"job_type": "EXECUTE", "step_key": "thesis_generate_business_case", "payload": {"model_id": "model-a"}},
            {"job_type": "EXECUTE", "step_key": "thesis_generate_business_case", "payload": {"model_id": "model-b"}}
        ]"#;
        let done = run_json(&dir, &["complete", plan_id, "--children", children]);
        assert_eq!(done["outcome"]["outcome"], "applied");
        let kids = done["children"].as_array().unwrap();
        assert_eq!(kids.len(), 2);
        for kid in kids {
            assert_eq!(kid["status"], "waiting_for_prerequisite");
            assert_eq!(kid["parent_job_id"], plan_id);
            assert_eq!(kid["stage_slug"], "thesis");
        }

        let jobs = run_json(&dir, &["jobs", &session]);
        let pending = jobs
            .as_array()
            .unwrap()
            .iter()
            .filter(|j| j["status"] == "pending")
            .count();
        assert_eq!(pending, 2);
    }

    #[test]
    fn test_unknown_job_fails() {
        let dir = TempDir::new().unwrap();
        dialectic(&dir)
            .args(["claim", "no-such-job"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Job no-such-job not found"));
    }

    #[test]
    fn test_unknown_stage_rejected() {
        let dir = TempDir::new().unwrap();
        let session = start_session(&dir);
        dialectic(&dir)
            .args(["submit-job", "--session", &session, "--stage", "epilogue", "--type", "EXECUTE"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("epilogue"));
    }

    #[test]
    fn test_bad_payload_json() {
        let dir = TempDir::new().unwrap();
        let session = start_session(&dir);
        dialectic(&dir)
            .args([
                "submit-job",
                "--session",
                &session,
                "--stage",
                "thesis",
                "--type",
                "EXECUTE",
                "--payload",
                "{not json",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--payload is not valid JSON"));
    }
}

// =============================================================================
// Progress and Advancement Tests
// =============================================================================

mod progress {
    use super::*;

    #[test]
    fn test_progress_reports_steps() {
        let dir = TempDir::new().unwrap();
        let session = start_session(&dir);
        let job = submit(&dir, &session, "thesis", "thesis_generate_business_case", &[
            "--payload",
            r#"{"model_id": "model-a"}"#,
        ]);
        run_json(&dir, &["claim", &job]);

        let stages = run_json(&dir, &["progress", &session]);
        let thesis = &stages[0];
        assert_eq!(thesis["entry"]["stageSlug"], "thesis");
        assert_eq!(thesis["stageStatus"], "in_progress");
        let step = &thesis["entry"]["steps"]["thesis_generate_business_case"];
        assert_eq!(step["inProgressJobs"], 1);
        assert_eq!(step["modelStatuses"]["model-a"], "in_progress");
        assert_eq!(
            thesis["entry"]["steps"]["thesis_generate_feature_spec"]["status"],
            "not_started"
        );
    }

    #[test]
    fn test_session_walks_small_pipeline() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("dialectic.toml"), SMALL_PIPELINE).unwrap();
        let session = start_session(&dir);

        let draft = submit(&dir, &session, "draft", "draft_write", &[]);
        run_json(&dir, &["claim", &draft]);
        run_json(&dir, &["complete", &draft]);
        let state = run_json(&dir, &["session", &session]);
        assert_eq!(state["status"], "pending_review");
        assert_eq!(state["current_stage_id"], "review");

        let review = submit(&dir, &session, "review", "review_write", &[]);
        run_json(&dir, &["claim", &review]);
        run_json(&dir, &["complete", &review]);
        let state = run_json(&dir, &["session", &session]);
        assert_eq!(state["status"], "iteration_complete_pending_review");
    }

    #[test]
    fn test_await_submission_then_submit_stage() {
        let dir = TempDir::new().unwrap();
        let config = format!("[session]\nadvance_policy = \"await_submission\"\n{}", SMALL_PIPELINE);
        fs::write(dir.path().join("dialectic.toml"), config).unwrap();
        let session = start_session(&dir);

        let draft = submit(&dir, &session, "draft", "draft_write", &[]);
        run_json(&dir, &["claim", &draft]);
        run_json(&dir, &["complete", &draft]);
        let state = run_json(&dir, &["session", &session]);
        assert_eq!(state["status"], "draft_generation_complete");

        let submitted = run_json(&dir, &["submit-stage", &session, "draft"]);
        assert_eq!(submitted["outcome"], "submitted");
        assert_eq!(submitted["next"], "pending_review");
    }

    #[test]
    fn test_clone_recipe_for_session() {
        let dir = TempDir::new().unwrap();
        let session = start_session(&dir);
        let out = run_json(&dir, &["clone-recipe", &session, "antithesis"]);
        assert_eq!(out["steps"][0]["step_key"], "antithesis_plan");

        let job = submit(&dir, &session, "antithesis", "antithesis_generate_critique", &[]);
        assert!(!job.is_empty());
        let stages = run_json(&dir, &["progress", &session]);
        assert_eq!(stages[0]["entry"]["recipeSource"], "cloned");
    }

    #[test]
    fn test_drain_with_nothing_pending() {
        let dir = TempDir::new().unwrap();
        let out = run_json(&dir, &["drain"]);
        assert_eq!(out["processed"], 0);
    }
}
