//! End-to-end runs of the demo binary: real worker processes, exit codes
//! and machine-readable output.

use std::process::{Command, Output};

fn forkbench(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_forkbench-demos"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to start demo binary")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_list_prints_sorted_ids() {
    let output = forkbench(&["--list"]);
    assert!(output.status.success(), "{}", stderr(&output));

    let text = stdout(&output);
    let ids: Vec<&str> = text.lines().skip(1).collect();
    assert_eq!(text.lines().next(), Some("Benchmarks:"));
    assert!(ids.contains(&"codec::encode_stream"));
    assert!(ids.contains(&"executor::fixed_pool"));
    assert!(ids.contains(&"pass_params::six"));

    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
}

#[test]
fn test_list_with_params_shows_axes() {
    let output = forkbench(&["^codec::encode_stream$", "--list-with-params"]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("param \"byte.size\" = {1048576, 4194304}"), "{text}");
    assert!(text.contains("param \"block.size\" = {65536, 262144}"), "{text}");
    assert!(text.contains("fixture BlockSize (benchmark)"), "{text}");
}

#[test]
fn test_json_run_in_worker_process() {
    let output = forkbench(&[
        "^pass_params::base$", "-w", "0", "-i", "2", "-f", "1", "-b", "1000", "--format", "json",
    ]);
    assert!(output.status.success(), "{}", stderr(&output));

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["meta"]["schema_version"], 1);
    let results = report["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["benchmark"], "pass_params::base");
    assert_eq!(results[0]["status"], "success");
    assert_eq!(results[0]["fork"], 1);
    assert_eq!(results[0]["cnt"], 2);
    assert_eq!(results[0]["operations"], 2000);
    assert_eq!(results[0]["score_unit"], "ops/s");
    assert!(results[0]["score"].as_f64().unwrap() > 0.0);
    assert_eq!(report["summary"]["succeeded"], 1);
}

#[test]
fn test_each_fork_gets_its_own_worker() {
    for jobs in ["1", "2"] {
        let output = forkbench(&[
            "^pass_params::base$", "-w", "0", "-i", "1", "-f", "2", "-b", "100", "--blackhole-tokens",
            "16", "--jobs", jobs, "--format", "json",
        ]);
        assert!(output.status.success(), "{}", stderr(&output));

        let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        let results = report["results"].as_array().unwrap();
        assert_eq!(results.len(), 2, "{report}");
        let mut forks: Vec<u64> = results.iter().map(|r| r["fork"].as_u64().unwrap()).collect();
        forks.sort();
        assert_eq!(forks, vec![1, 2]);
        for result in results {
            assert_eq!(result["status"], "success", "{result}");
            assert_eq!(result["operations"], 100);
        }
        assert_eq!(report["summary"]["succeeded"], 2);
    }
}

#[test]
fn test_forks_zero_runs_in_process() {
    let output = forkbench(&[
        "^pass_params::one$", "-w", "0", "-i", "1", "-f", "0", "-b", "10", "--format", "csv",
    ]);
    assert!(output.status.success(), "{}", stderr(&output));
    let text = stdout(&output);
    let rows: Vec<&str> = text.lines().skip(1).collect();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].starts_with("pass_params::one,thrpt,1,,0,success,1,"), "{}", rows[0]);
}

#[test]
fn test_setup_failure_is_contained_to_its_fork() {
    let args = [
        "^codec::encode_stream$", "-p", "byte.size=64", "-p", "block.size=0,16", "-w", "0", "-i",
        "1", "-b", "1", "--format", "csv",
    ];

    let output = forkbench(&args);
    assert!(output.status.success(), "{}", stderr(&output));
    let text = stdout(&output);
    let rows: Vec<&str> = text.lines().skip(1).collect();
    assert_eq!(rows.len(), 2, "{text}");
    assert!(rows[0].contains("block.size=0"));
    assert!(rows[0].contains(",failed,"));
    assert!(rows[0].contains("block.size must be between 1 and"));
    assert!(rows[1].contains("block.size=16"));
    assert!(rows[1].contains(",success,"));

    let mut strict = args.to_vec();
    strict.push("--fail-on-error");
    let output = forkbench(&strict);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("1 of 2 forks failed"));
}

#[test]
fn test_alloc_profiler_reports_per_op_allocations() {
    let output = forkbench(&[
        "^codec::encode_bytes$", "-p", "byte.size=1024", "-w", "0", "-i", "1", "-b", "4",
        "--prof", "alloc", "--format", "json",
    ]);
    assert!(output.status.success(), "{}", stderr(&output));

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let alloc = &report["results"][0]["alloc"];
    assert!(alloc["bytes_per_op"].as_f64().unwrap() >= 1024.0, "{alloc}");
    assert!(alloc["allocs_per_op"].as_f64().unwrap() >= 1.0, "{alloc}");
    assert_eq!(report["meta"]["config"]["profilers"][0], "alloc");
}

#[test]
fn test_run_errors_exit_with_one() {
    let no_match = forkbench(&["^no_such_benchmark$"]);
    assert_eq!(no_match.status.code(), Some(1));
    assert!(stderr(&no_match).contains("no benchmark matches pattern '^no_such_benchmark$'"));

    let undeclared = forkbench(&["^pass_params::", "-p", "nope=1"]);
    assert_eq!(undeclared.status.code(), Some(1));

    let bad_flag = forkbench(&["-i", "many"]);
    assert_eq!(bad_flag.status.code(), Some(1));
    assert!(stderr(&bad_flag).contains("Error parsing command line"));

    let bad_profiler = forkbench(&["--prof", "perfasm"]);
    assert_eq!(bad_profiler.status.code(), Some(1));
}

#[test]
fn test_help_exits_zero() {
    let output = forkbench(&["--help"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("--warmup-iterations"));
}
