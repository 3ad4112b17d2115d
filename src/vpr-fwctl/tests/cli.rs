use assert_cmd::Command;
use predicates::prelude::*;

fn fwctl() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("vpr-fwctl"))
}

#[test]
fn test_render_blocked_table() {
    fwctl()
        .args(["render", "blocked", "--permit-lan"])
        .assert()
        .success()
        .stdout(predicate::str::contains("blocked policy"))
        .stdout(predicate::str::contains("Permit LAN 192.168.0.0/16"))
        .stdout(predicate::str::contains("Block all (ConnectV4)"));
}

#[test]
fn test_render_connected_json() {
    let output = fwctl()
        .args([
            "render",
            "connected",
            "--format",
            "json",
            "--relay",
            "1.2.3.4",
            "--relay-port",
            "443",
            "--relay-protocol",
            "tcp",
            "--tunnel-alias",
            "wg0",
            "--dns-v4",
            "10.0.0.1",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());

    let filters: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let names: Vec<&str> = filters
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"Permit outbound relay traffic"));
    assert!(names.iter().any(|n| n.starts_with("Permit DNS to 10.0.0.1")));
}

#[test]
fn test_render_connecting_nft_uses_table_flag() {
    fwctl()
        .args([
            "render",
            "connecting",
            "--format",
            "nft",
            "--table",
            "vpr_test",
            "--relay",
            "1.2.3.4",
            "--relay-port",
            "51820",
            "--ping-host",
            "10.64.0.1",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("table inet vpr_test {"))
        .stdout(predicate::str::contains("ip daddr 1.2.3.4"))
        .stdout(predicate::str::contains("th dport 51820"));
}

#[test]
fn test_invalid_relay_fails() {
    fwctl()
        .args(["render", "connecting", "--relay", "relay.example.com", "--relay-port", "443"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("relay address"));
}

#[test]
fn test_missing_relay_fails() {
    fwctl()
        .args(["render", "connected", "--tunnel-alias", "wg0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--relay is required"));
}

#[test]
fn test_config_file_sets_table_and_flags_win() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(tmp.path(), r#"{"nft": {"table": "from_config"}}"#).unwrap();

    fwctl()
        .arg("--config")
        .arg(tmp.path())
        .args(["render", "blocked", "--format", "nft"])
        .assert()
        .success()
        .stdout(predicate::str::contains("table inet from_config {"));

    fwctl()
        .arg("--config")
        .arg(tmp.path())
        .args(["--table", "from_flag", "render", "blocked", "--format", "nft"])
        .assert()
        .success()
        .stdout(predicate::str::contains("table inet from_flag {"));
}

#[test]
fn test_bad_config_fails() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(tmp.path(), r#"{"nft": {"table": "bad table"}}"#).unwrap();

    fwctl()
        .arg("--config")
        .arg(tmp.path())
        .args(["render", "blocked"])
        .assert()
        .failure();
}

#[test]
fn test_dry_run_block_prints_script() {
    fwctl()
        .args(["--dry-run", "block", "--permit-dhcp"])
        .assert()
        .success()
        .stdout(predicate::str::contains("$ nft list tables"))
        .stdout(predicate::str::contains("$ nft -f -"))
        .stdout(predicate::str::contains("table inet vpr_firewall {"))
        .stdout(predicate::str::contains("Permit DHCP request"));
}

#[test]
fn test_dry_run_reset_removes_table() {
    let output = fwctl().args(["--dry-run", "reset"]).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.trim_end().ends_with("delete table inet vpr_firewall"));
}
