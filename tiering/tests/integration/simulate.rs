// vim: tw=80
use assert_cmd::prelude::*;
use predicates::prelude::*;

use super::tiering;

#[test]
fn help() {
    tiering()
        .args(["simulate", "-h"])
        .assert()
        .success();
}

/// Every window closes, every object reads back, and nothing is left on the
/// fast class.
#[test]
fn basic() {
    tiering()
        .args(["simulate", "-p", "-w", "3", "--objects", "4", "--blocks", "2"])
        .assert()
        .success()
        .stdout(predicate::str::is_match("(?m)^window\t").unwrap())
        .stdout(predicate::str::contains("state\tclosed\n"))
        .stdout(predicate::str::contains("special_blocks\t0\n"))
        .stdout(predicate::str::contains("bad_frees\t0\n"))
        .stdout(predicate::str::contains("objects_verified\t8\n"));
}

#[test]
fn crash() {
    tiering()
        .args(["simulate", "-p", "--crash", "-w", "2", "--objects", "4"])
        .assert()
        .success()
        .stdout(predicate::str::contains("special_blocks\t0\n"))
        .stdout(predicate::str::contains("bad_frees\t0\n"))
        .stdout(predicate::str::contains("objects_verified\t6\n"));
}

/// With tiering disabled, nothing is written to the fast class at all.
#[test]
fn disabled() {
    tiering()
        .args(["simulate", "-p", "-w", "2", "--objects", "2", "-o",
               "enabled=false"])
        .assert()
        .success()
        .stdout(predicate::str::contains("special_bytes\t0\n"))
        .stdout(predicate::str::contains("objects_verified\t3\n"));
}

#[test]
fn human() {
    tiering()
        .args(["simulate", "-w", "1", "--objects", "2"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("START"))
        .stdout(predicate::str::contains("objects_verified"));
}

#[test]
fn bad_property() {
    tiering()
        .args(["simulate", "-o", "low_watermark=500"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("Invalid property specification"));
}
