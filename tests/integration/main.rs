//! Integration tests for multipackager

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    /// Binary pointed at a config file that does not exist, so defaults apply
    fn multipackager(temp: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("multipackager");
        cmd.env("MULTIPACKAGER_CONFIG", temp.path().join("config.toml"))
            .env_remove("RUST_LOG");
        cmd
    }

    #[test]
    fn help_displays() {
        let temp = TempDir::new().unwrap();
        multipackager(&temp)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("clear-cache"))
            .stdout(predicate::str::contains("shell"));
    }

    #[test]
    fn version_displays() {
        let temp = TempDir::new().unwrap();
        multipackager(&temp)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("multipackager"));
    }

    #[test]
    fn config_path_follows_env() {
        let temp = TempDir::new().unwrap();
        multipackager(&temp)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"))
            .stdout(predicate::str::contains(temp.path().to_string_lossy().as_ref()));
    }

    #[test]
    fn config_show_prints_defaults() {
        let temp = TempDir::new().unwrap();
        multipackager(&temp)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]"))
            .stdout(predicate::str::contains("systemd-nspawn"));
    }

    #[test]
    fn config_init_writes_file() {
        let temp = TempDir::new().unwrap();
        multipackager(&temp)
            .args(["config", "init"])
            .assert()
            .success();
        let written = std::fs::read_to_string(temp.path().join("config.toml")).unwrap();
        assert!(written.contains("[sandbox]"));
    }

    #[test]
    fn invalid_config_is_reported() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("config.toml"), "[general\n").unwrap();
        multipackager(&temp)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn completions_generate() {
        let temp = TempDir::new().unwrap();
        multipackager(&temp)
            .args(["completions", "bash"])
            .assert()
            .success()
            .stdout(predicate::str::contains("multipackager"));
    }

    #[test]
    fn build_of_missing_project_fails() {
        // Without root the root check fires first
        let temp = TempDir::new().unwrap();
        multipackager(&temp)
            .args(["build"])
            .arg(temp.path().join("missing"))
            .assert()
            .failure()
            .stderr(
                predicate::str::contains("must be run as root")
                    .or(predicate::str::contains("Path not found")),
            );
    }

    #[test]
    fn update_without_targets_fails() {
        let temp = TempDir::new().unwrap();
        multipackager(&temp)
            .arg("update")
            .assert()
            .failure()
            .stderr(
                predicate::str::contains("must be run as root")
                    .or(predicate::str::contains("No build targets configured")),
            );
    }

    #[test]
    fn readme_documents_the_commands() {
        let readme = include_str!("../../README.md");
        for command in ["build", "update", "clear-cache", "shell", "completions"] {
            assert!(readme.contains(&format!("multipackager {}", command)));
        }
    }

    #[test]
    fn shell_needs_a_target() {
        let temp = TempDir::new().unwrap();
        multipackager(&temp)
            .args(["shell", "/tmp/vm"])
            .assert()
            .failure();
    }
}
