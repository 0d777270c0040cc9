use assert_cmd::Command;
use predicates::prelude::*;
use serial_test::serial;

macro_rules! create_test {
    ( $num_pes:expr, $port:expr ) => {
        paste::paste! {
            #[test]
            #[serial]
            fn [<sweep_on_ $num_pes _pes>]() {
                let result = Command::cargo_bin("distmm_run")
                    .unwrap()
                    .env_remove("RUST_LOG")
                    .arg("-N")
                    .arg(stringify!($num_pes))
                    .arg("--port")
                    .arg(stringify!($port))
                    .arg("--timeout")
                    .arg("120")
                    .arg("--")
                    .args(["--dim", "48", "--chunk-sizes", "8,16,32", "--seed", "7", "--verify"])
                    .assert();
                println!("{:?}", result);
                result
                    .stderr("")
                    .success()
                    .stdout(predicate::str::contains(format!("Number of processes: {}", $num_pes)))
                    .stdout(predicate::str::contains(">>> Testing chunk size: 8 rows per process"))
                    .stdout(predicate::str::contains("Scatter Latency   : "))
                    .stdout(predicate::str::contains("Compute Time      : "))
                    .stdout(predicate::str::contains("Gather Latency    : "))
                    .stdout(predicate::str::is_match(r"Gather Latency\s*: \d+\.\d{6} seconds").unwrap())
                    .stdout(predicate::str::contains("Sweep complete"));
            }
        }
    };
}

create_test!(1, 24100);
create_test!(2, 24200);
create_test!(3, 24300);
create_test!(4, 24400);

#[test]
#[serial]
fn oversized_chunks_are_reported_and_skipped() {
    // 32 rows per pe on 2 pes needs 64 rows of a 48 row operand
    Command::cargo_bin("distmm_run")
        .unwrap()
        .args(["-N", "2", "--port", "24500", "--timeout", "120", "--"])
        .args(["--dim", "48", "--chunk-sizes", "32,8"])
        .assert()
        .success()
        .stdout(predicate::str::contains(">>> Testing chunk size: 32 rows per process"))
        .stdout(predicate::str::contains("Chunk too large for the number of processes"))
        .stdout(predicate::str::contains("Chunk 32 done.").not())
        .stdout(predicate::str::contains("Chunk 8 done."))
        .stdout(predicate::str::contains("Sweep complete: 1 of 2 chunk sizes run"));
}

#[test]
#[serial]
fn single_process_without_launcher() {
    Command::cargo_bin("distmm")
        .unwrap()
        .env_remove("DISTMM_NUM_PES")
        .env_remove("DISTMM_BACKEND")
        .args(["--dim", "16", "--chunk-sizes", "4,16,17"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Number of processes: 1"))
        .stdout(predicate::str::contains("Broadcast Latency (B): "))
        .stdout(predicate::str::contains("Chunk 16 done."))
        .stdout(predicate::str::contains("Chunk 17 done.").not());
}

#[test]
#[serial]
fn local_backend_refuses_a_group() {
    Command::cargo_bin("distmm")
        .unwrap()
        .env("DISTMM_BACKEND", "local")
        .env("DISTMM_NUM_PES", "2")
        .args(["--dim", "16"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("Scatter Latency").not())
        .stderr(predicate::str::contains("unable to join the process group"));
}

#[test]
#[serial]
fn failing_pe_fails_the_run() {
    Command::cargo_bin("distmm_run")
        .unwrap()
        .args(["-N", "2", "--port", "24600", "--timeout", "120", "--"])
        .args(["--dim", "not-a-number"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("Scatter Latency").not());
}

#[cfg(unix)]
#[test]
#[serial]
fn pe_killed_mid_sweep_fails_the_run() {
    // pe 1 is killed two seconds in, long before a sweep of 200 verified chunks can finish
    let script = r#"if [ "$DISTMM_PE_ID" = 1 ]; then
  "$0" "$@" & pid=$!
  sleep 2
  kill -9 $pid
  exit 9
fi
exec "$0" "$@""#;
    let chunks = vec!["128"; 200].join(",");
    Command::cargo_bin("distmm_run")
        .unwrap()
        .env_remove("RUST_LOG")
        .args(["-N", "2", "--port", "24700", "--timeout", "120", "--program", "sh", "--"])
        .arg("-c")
        .arg(script)
        .arg(assert_cmd::cargo::cargo_bin("distmm"))
        .args(["--dim", "512", "--seed", "3", "--verify", "--chunk-sizes"])
        .arg(chunks)
        .assert()
        .failure()
        .stdout(predicate::str::contains("Broadcast Latency (B): "))
        .stdout(predicate::str::contains(">>> Testing chunk size: 128 rows per process"))
        .stdout(predicate::str::contains("Sweep complete").not());
}

#[cfg(unix)]
#[test]
#[serial]
fn timeout_kills_the_group() {
    Command::cargo_bin("distmm_run")
        .unwrap()
        .args(["-N", "2", "--timeout", "0.3", "--program", "sleep", "--", "30"])
        .assert()
        .code(124);
}
