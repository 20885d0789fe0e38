//! End-to-end tests for the `cnpj` binary
//!
//! Each test serves a small release from a wiremock server and drives the
//! compiled binary against temp directories, asserting on exit codes and
//! the published artifacts.

use std::io::Write;
use std::process::Output;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::write::SimpleFileOptions;

fn build_zip(name: &str, content: &[u8]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    writer
        .start_file(name, SimpleFileOptions::default())
        .unwrap();
    writer.write_all(content).unwrap();
    writer.finish().unwrap().into_inner()
}

async fn mount_catalog(server: &MockServer, names: &[&str]) {
    let links: String = names
        .iter()
        .map(|n| format!("<a href=\"{n}\">{n}</a>\n"))
        .collect();
    let page = format!("<html><body><pre>{links}</pre></body></html>");
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(page))
        .mount(server)
        .await;
}

async fn run_cnpj(data_dir: &std::path::Path, catalog_url: &str) -> Output {
    let data_dir = data_dir.to_path_buf();
    let catalog_url = catalog_url.to_string();
    tokio::task::spawn_blocking(move || {
        Command::cargo_bin("cnpj")
            .unwrap()
            .args([
                "--data-dir",
                data_dir.to_str().unwrap(),
                "run",
                "--catalog-url",
                &catalog_url,
            ])
            .output()
            .unwrap()
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn run_publishes_tables_and_exits_zero() {
    let server = MockServer::start().await;
    mount_catalog(&server, &["Cnaes.zip", "Municipios.zip"]).await;
    Mock::given(method("GET"))
        .and(path("/Cnaes.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(build_zip(
            "CNAECSV",
            b"6201501;Desenvolvimento de software\n",
        )))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Municipios.zip"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(build_zip("MUNICCSV", b"7107;CAMPINAS\n")),
        )
        .mount(&server)
        .await;

    let data = TempDir::new().unwrap();
    let output = run_cnpj(data.path(), &format!("{}/", server.uri())).await;

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(data.path().join("tables/cnaes.parquet").exists());
    assert!(data.path().join("tables/municipios.parquet").exists());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Run Summary"));
    assert!(stdout.contains("cnaes"));
}

#[tokio::test(flavor = "multi_thread")]
async fn run_exits_nonzero_when_a_table_has_no_usable_shards() {
    let server = MockServer::start().await;
    // Paises.zip is listed but never mounted; every fetch 404s
    mount_catalog(&server, &["Paises.zip", "Cnaes.zip"]).await;
    Mock::given(method("GET"))
        .and(path("/Cnaes.zip"))
        .respond_with(
            ResponseTemplate::new(200).set_body_bytes(build_zip("CNAECSV", b"01;A\n")),
        )
        .mount(&server)
        .await;

    let data = TempDir::new().unwrap();
    let output = run_cnpj(data.path(), &format!("{}/", server.uri())).await;

    assert_eq!(output.status.code(), Some(1));
    // The healthy table still published
    assert!(data.path().join("tables/cnaes.parquet").exists());
    assert!(!data.path().join("tables/paises.parquet").exists());
}

#[test]
fn status_without_state_reports_fresh() {
    let data = TempDir::new().unwrap();
    Command::cargo_bin("cnpj")
        .unwrap()
        .args(["--data-dir", data.path().to_str().unwrap(), "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No run state found"));
}

#[test]
fn clean_removes_scratch_directory() {
    let data = TempDir::new().unwrap();
    std::fs::create_dir_all(data.path().join("scratch/parts")).unwrap();

    Command::cargo_bin("cnpj")
        .unwrap()
        .args(["--data-dir", data.path().to_str().unwrap(), "clean"])
        .assert()
        .success();

    assert!(!data.path().join("scratch").exists());
}

#[test]
fn no_subcommand_prints_help() {
    Command::cargo_bin("cnpj").unwrap().assert().failure();
}
