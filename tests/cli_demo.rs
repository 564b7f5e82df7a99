//! CLI integration tests for the demo and map modes.

use std::process::Command;

#[test]
fn demo_cli_completes_without_lock_violation() {
    let bin = env!("CARGO_BIN_EXE_warehouse_fleet");
    // Run the demo binary with default settings.
    let output = Command::new(bin)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run demo binary");

    assert!(
        output.status.success(),
        "demo exited with non-zero status: {:?}\n{}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("DEMO SUMMARY"),
        "demo summary missing from output"
    );

    let lock_line = stdout
        .lines()
        .find(|line| line.starts_with("lock_violation="))
        .expect("lock_violation line missing");
    assert_eq!(lock_line.trim(), "lock_violation=false");

    let duplicate_line = stdout
        .lines()
        .find(|line| line.starts_with("duplicate_tasks="))
        .expect("duplicate_tasks line missing");
    assert_eq!(duplicate_line.trim(), "duplicate_tasks=false");

    // Every task is either completed or explicitly abandoned.
    let done: usize = stdout
        .lines()
        .find_map(|line| line.strip_prefix("tasks_per_agent_done="))
        .expect("tasks_per_agent_done line missing")
        .trim_matches(|c| c == '[' || c == ']')
        .split(',')
        .map(|n| n.trim().parse::<usize>().expect("numeric count"))
        .sum();
    let abandoned: usize = stdout
        .lines()
        .find_map(|line| line.strip_prefix("tasks_abandoned="))
        .expect("tasks_abandoned line missing")
        .trim()
        .parse()
        .expect("numeric count");
    assert_eq!(done + abandoned, 9);
}

#[test]
fn map_cli_prints_grid_snapshot() {
    let bin = env!("CARGO_BIN_EXE_warehouse_fleet");
    let output = Command::new(bin)
        .arg("map")
        .output()
        .expect("failed to run map command");
    assert!(output.status.success());

    let snapshot: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("map output is JSON");
    let nodes = snapshot["nodes"].as_array().expect("nodes array");
    assert_eq!(nodes.len(), 25);
    assert!(nodes.iter().all(|node| node["locked_by"].is_null()));
}

#[test]
fn missing_map_file_fails_startup() {
    let bin = env!("CARGO_BIN_EXE_warehouse_fleet");
    let output = Command::new(bin)
        .args(["--map", "/nonexistent/warehouse.json", "map"])
        .output()
        .expect("failed to run map command");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("loading warehouse map"));
}
