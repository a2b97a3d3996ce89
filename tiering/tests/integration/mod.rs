// vim: tw=80
//! Integration tests for the tiering command
use std::process::Command;

use assert_cmd::prelude::*;

fn tiering() -> Command {
    Command::cargo_bin("tiering").unwrap()
}

mod props;
mod simulate;
