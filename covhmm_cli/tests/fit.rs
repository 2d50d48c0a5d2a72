#![allow(missing_docs)]

use assert_cmd::Command;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;

fn write_test_track(dir: &TempDir) -> assert_fs::fixture::ChildPath {
    let mut lines = vec![
        "#annotation:len:1".to_string(),
        "#annotation:0:whole_genome".to_string(),
        "#region:len:1".to_string(),
        "#region:coverage:0:30".to_string(),
        "#label:len:5".to_string(),
        "#truth:false".to_string(),
        "#prediction:false".to_string(),
        "#zero_based:false".to_string(),
    ];
    // 300 windows of haploid-like coverage, then 100 collapsed-like
    for i in 0..300_u64 {
        let coverage = if i % 2 == 0 { 29 } else { 31 };
        lines.push(format!(
            "ctg1\t{}\t{}\t{coverage}\t{coverage}\t0\t1\t0",
            i * 100 + 1,
            (i + 1) * 100
        ));
    }
    for i in 300..400_u64 {
        lines.push(format!(
            "ctg1\t{}\t{}\t60\t60\t0\t1\t0",
            i * 100 + 1,
            (i + 1) * 100
        ));
    }
    let track = dir.child("test.cov");
    track.write_str(&(lines.join("\n") + "\n")).unwrap();
    track
}

#[test]
fn fit_writes_parameters_and_posteriors() {
    let dir = TempDir::new().unwrap();
    let track = write_test_track(&dir);
    let output_dir = dir.child("out");

    Command::cargo_bin("covhmm")
        .unwrap()
        .args([
            "fit",
            "--input",
            track.path().to_str().unwrap(),
            "--output-dir",
            output_dir.path().to_str().unwrap(),
            "--window-len",
            "100",
            "--max-iterations",
            "20",
        ])
        .assert()
        .success();

    output_dir
        .child("emission_parameters.tsv")
        .assert(predicate::str::contains("Hap\tgaussian\tmean"));
    output_dir
        .child("transition_matrices.tsv")
        .assert(predicate::str::contains("#region:0"));
    output_dir
        .child("posteriors.tsv")
        .assert(predicate::str::contains("ctg1\t1\t100\t"));
    // the collapsed tail must be labeled differently from the haploid body
    let predictions =
        std::fs::read_to_string(output_dir.child("predictions.cov").path()).unwrap();
    let labels: Vec<&str> = predictions
        .lines()
        .filter(|line| !line.starts_with('#'))
        .map(|line| line.rsplit('\t').next().unwrap())
        .collect();
    assert_eq!(labels.len(), 400);
    assert_eq!(labels[10], "2");
    assert_eq!(labels[390], "3");
}

#[test]
fn fit_rejects_unknown_model_type() {
    let dir = TempDir::new().unwrap();
    let track = write_test_track(&dir);

    Command::cargo_bin("covhmm")
        .unwrap()
        .args([
            "fit",
            "--input",
            track.path().to_str().unwrap(),
            "--output-dir",
            dir.child("out").path().to_str().unwrap(),
            "--model-type",
            "poisson",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown model type"));
}

#[test]
fn fit_rejects_wrong_extension() {
    let dir = TempDir::new().unwrap();
    let track = dir.child("test.bed");
    track.write_str("ctg1\t1\t10\n").unwrap();

    Command::cargo_bin("covhmm")
        .unwrap()
        .args([
            "fit",
            "--input",
            track.path().to_str().unwrap(),
            "--output-dir",
            dir.child("out").path().to_str().unwrap(),
        ])
        .assert()
        .failure();
}
