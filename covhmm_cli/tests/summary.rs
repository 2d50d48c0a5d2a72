#![allow(missing_docs)]

use assert_cmd::Command;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;

fn write_labeled_track(dir: &TempDir) -> assert_fs::fixture::ChildPath {
    let mut lines = vec![
        "#annotation:len:2".to_string(),
        "#annotation:0:whole_genome".to_string(),
        "#annotation:1:satellite".to_string(),
        "#region:len:1".to_string(),
        "#region:coverage:0:30".to_string(),
        "#label:len:4".to_string(),
        "#truth:true".to_string(),
        "#prediction:true".to_string(),
        "#zero_based:false".to_string(),
    ];
    // truth 1 over 100 bases; the prediction agrees on 60 of them
    lines.push("ctg1\t1\t60\t30\t30\t0\t3\t0\t1\t1".to_string());
    lines.push("ctg1\t61\t100\t30\t30\t0\t3\t0\t1\t2".to_string());
    // an unannotated stretch outside the satellite
    lines.push("ctg1\t101\t200\t30\t30\t0\t1\t0\t2\t2".to_string());
    let track = dir.child("labeled.cov");
    track.write_str(&(lines.join("\n") + "\n")).unwrap();
    track
}

#[test]
fn summary_writes_stratified_tables() {
    let dir = TempDir::new().unwrap();
    let track = write_labeled_track(&dir);
    let output = dir.child("summary.tsv");

    Command::cargo_bin("covhmm")
        .unwrap()
        .args([
            "summary",
            "--input",
            track.path().to_str().unwrap(),
            "--output",
            output.path().to_str().unwrap(),
        ])
        .assert()
        .success();

    // recall rows are truth labels: the satellite run splits 60/40
    output.assert(predicate::str::contains(
        "recall\tbase-level\tannotation\tsatellite\tALL\t1\t0.00\t60.00\t40.00\t0.00",
    ));
    // overlap-based: both query labels reach the 0.4 threshold
    output.assert(predicate::str::contains(
        "recall\toverlap-based\tannotation\tsatellite\tALL\t1\t0.00\t1.00\t1.00\t0.00",
    ));
    // region tables are emitted as well
    output.assert(predicate::str::contains("recall\tbase-level\tregion\tregion_0"));
}

#[test]
fn summary_needs_labels() {
    let dir = TempDir::new().unwrap();
    let mut lines = vec![
        "#annotation:len:1".to_string(),
        "#annotation:0:whole_genome".to_string(),
        "#region:len:1".to_string(),
        "#region:coverage:0:30".to_string(),
        "#label:len:0".to_string(),
        "#truth:false".to_string(),
        "#prediction:false".to_string(),
        "#zero_based:false".to_string(),
    ];
    lines.push("ctg1\t1\t100\t30\t30\t0\t1\t0".to_string());
    let track = dir.child("unlabeled.cov");
    track.write_str(&(lines.join("\n") + "\n")).unwrap();

    Command::cargo_bin("covhmm")
        .unwrap()
        .args([
            "summary",
            "--input",
            track.path().to_str().unwrap(),
            "--output",
            dir.child("summary.tsv").path().to_str().unwrap(),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("truth and prediction"));
}

#[test]
fn summary_rejects_non_tsv_output() {
    let dir = TempDir::new().unwrap();
    let track = write_labeled_track(&dir);

    Command::cargo_bin("covhmm")
        .unwrap()
        .args([
            "summary",
            "--input",
            track.path().to_str().unwrap(),
            "--output",
            dir.child("summary.txt").path().to_str().unwrap(),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("tsv extension"));
}
