#![cfg(feature = "storage-rocksdb")]

use assert_cmd::cargo_bin;
use std::io::Write;
use std::process::Command;
use tempfile::tempdir;

#[test]
fn test_rocksdb_persistence_recovery() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_db");

    // 1. First run: credit and start a withdrawal
    let mut csv1 = tempfile::NamedTempFile::new().unwrap();
    writeln!(csv1, "type, user, amount, currency, reference").unwrap();
    writeln!(csv1, "credit, alice, 100.0, USD, adj-1").unwrap();
    writeln!(csv1, "withdraw, alice, 40.0, USD, po_1").unwrap();

    let mut cmd1 = Command::new(cargo_bin!("marketplace-escrow"));
    cmd1.arg("replay").arg(csv1.path()).arg("--db-path").arg(&db_path);

    let output1 = cmd1.output().expect("Failed to execute command");
    assert!(output1.status.success());
    let stdout1 = String::from_utf8_lossy(&output1.stdout);
    assert!(stdout1.contains("alice,USD,60,1,true"));

    // 2. Second run: the payout fails and the same credit is replayed
    let mut csv2 = tempfile::NamedTempFile::new().unwrap();
    writeln!(csv2, "type, user, amount, currency, reference").unwrap();
    writeln!(csv2, "credit, alice, 100.0, USD, adj-1").unwrap();
    writeln!(csv2, "payout_failed, , , , po_1").unwrap();
    writeln!(csv2, "credit, alice, 50.0, USD, adj-2").unwrap();

    let mut cmd2 = Command::new(cargo_bin!("marketplace-escrow"));
    cmd2.arg("replay").arg(csv2.path()).arg("--db-path").arg(&db_path);

    let output2 = cmd2.output().expect("Failed to execute command");
    assert!(output2.status.success());
    let stdout2 = String::from_utf8_lossy(&output2.stdout);

    // 100 recovered, 40 returned by the failed payout, 50 added
    assert!(stdout2.contains("alice,USD,150,0,true"));
}
