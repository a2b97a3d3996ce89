// vim: tw=80
use std::io::Write;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use rstest::rstest;
use tempfile::NamedTempFile;

use super::tiering;

fn config_file(contents: &str) -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    f
}

#[test]
fn help() {
    tiering()
        .args(["props", "-h"])
        .assert()
        .success();
}

#[test]
fn all() {
    tiering()
        .arg("props")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("PROPERTY"))
        .stdout(predicate::str::contains("meta_placement.dnode"))
        .stdout(predicate::str::contains("move_workers"));
}

#[test]
fn parseable() {
    tiering()
        .args(["props", "-p", "low_watermark,high_watermark,routing_override"])
        .assert()
        .success()
        .stdout("low_watermark\t60\n\
                 high_watermark\t80\n\
                 routing_override\tnone\n");
}

/// Each property is listed once, in the order first requested
#[test]
fn duplicates() {
    tiering()
        .args(["props", "-p", "fault_limit,low_watermark,fault_limit"])
        .assert()
        .success()
        .stdout("fault_limit\t10\nlow_watermark\t60\n");
}

#[test]
fn from_config() {
    let f = config_file("tiering:\n  low_watermark: 30\n  \
                         meta_placement:\n    ddt: off\n");
    tiering()
        .args(["props", "-p", "-c"])
        .arg(f.path())
        .args(["low_watermark,meta_placement.ddt"])
        .assert()
        .success()
        .stdout("low_watermark\t30\nmeta_placement.ddt\toff\n");
}

#[rstest]
#[case::out_of_range("tiering:\n  high_watermark: 101\n")]
#[case::unknown_section("bogus:\n  x: 1\n")]
#[case::unknown_field("layout:\n  disks: 4\n")]
fn bad_config(#[case] contents: &str) {
    let f = config_file(contents);
    tiering()
        .args(["props", "-c"])
        .arg(f.path())
        .assert()
        .failure();
}

#[test]
fn unknown_property() {
    tiering()
        .args(["props", "bogus"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unknown property bogus"));
}
