//! Integration tests for the shadowbox CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Helper to create a shadowbox Command
fn shadowbox() -> Command {
    cargo_bin_cmd!("shadowbox")
}

/// Repository with a tracked file that its own .gitignore would drop.
fn create_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    let repo = git2::Repository::init(dir.path()).unwrap();
    fs::write(dir.path().join(".gitignore"), "*.tar.gz\nbuild/\n").unwrap();
    fs::create_dir_all(dir.path().join("src")).unwrap();
    fs::write(dir.path().join("src/main.rs"), "fn main() {}\n").unwrap();
    fs::write(dir.path().join("corpus.tar.gz"), "data").unwrap();

    let mut index = repo.index().unwrap();
    for path in [".gitignore", "src/main.rs", "corpus.tar.gz"] {
        index.add_path(Path::new(path)).unwrap();
    }
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = git2::Signature::now("Test", "test@example.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
        .unwrap();
    dir
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        shadowbox()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("rules"));
    }

    #[test]
    fn test_version() {
        shadowbox()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("shadowbox"));
    }

    #[test]
    fn test_unknown_command_fails() {
        shadowbox().arg("frobnicate").assert().failure();
    }
}

mod rules_command {
    use super::*;

    #[test]
    fn test_rules_include_tracked_before_excludes() {
        let dir = create_repo();
        let output = shadowbox()
            .args(["rules", "--repo"])
            .arg(dir.path())
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let text = String::from_utf8(output).unwrap();

        let include = text.find("+ /corpus.tar.gz").expect("tracked include");
        let exclude = text.find("- *.tar.gz").expect("gitignore exclude");
        assert!(include < exclude);
        assert!(text.contains("+ /src/\n"));
        assert!(text.contains("+ /src/main.rs\n"));
        assert!(text.contains("- .git/\n"));
    }

    #[test]
    fn test_rules_check_paths() {
        let dir = create_repo();
        shadowbox()
            .args(["rules", "--repo"])
            .arg(dir.path())
            .args(["--check", "corpus.tar.gz", "--check", "other.tar.gz"])
            .assert()
            .success()
            .stdout(predicate::str::contains("include\tcorpus.tar.gz"))
            .stdout(predicate::str::contains("exclude\tother.tar.gz"));
    }

    #[test]
    fn test_rules_outside_repository_uses_fallback() {
        let dir = TempDir::new().unwrap();
        shadowbox()
            .args(["rules", "--repo"])
            .arg(dir.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("- .git/"))
            .stdout(predicate::str::contains("+ ").not());
    }

    #[test]
    fn test_rules_missing_repo_fails() {
        shadowbox()
            .args(["rules", "--repo", "/definitely/not/here"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("does not exist"));
    }
}
