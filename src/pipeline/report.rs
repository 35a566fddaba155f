//! Built / skipped / failed summary printed at the end of a run

use super::TargetOutcome;
use crate::ui::{self, UiContext};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub built: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

impl BuildReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, outcome: &TargetOutcome) {
        match outcome {
            TargetOutcome::Built { package, .. } => self.built.push(package.clone()),
            TargetOutcome::Skipped { package, .. } => self.skipped.push(package.clone()),
            TargetOutcome::Failed {
                target,
                stage,
                reason,
            } => self
                .failed
                .push(format!("{} (after {}): {}", target, stage, reason)),
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn print(&self, ctx: &UiContext) {
        for (title, items) in self.sections() {
            ui::section(ctx, title);
            if items.is_empty() {
                ui::remark(ctx, "none");
            }
            for item in items {
                match title {
                    "Built packages" => ui::step_ok(ctx, item),
                    "Skipped packages" => ui::step_info(ctx, item),
                    _ => ui::step_error(ctx, item),
                }
            }
        }

        if self.has_failures() {
            ui::outro_error(
                ctx,
                &format!("{} of {} targets failed", self.failed.len(), self.total()),
            );
        } else {
            ui::outro_success(ctx, &format!("{} targets done", self.total()));
        }
    }

    fn total(&self) -> usize {
        self.built.len() + self.skipped.len() + self.failed.len()
    }

    fn sections(&self) -> [(&'static str, &[String]); 3] {
        [
            ("Built packages", self.built.as_slice()),
            ("Skipped packages", self.skipped.as_slice()),
            ("Failed packages", self.failed.as_slice()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Stage;

    fn report() -> BuildReport {
        let mut report = BuildReport::new();
        report.record(&TargetOutcome::Built {
            target: "debian sid amd64".into(),
            package: "hello.sid_1.0~debian0_amd64.deb".into(),
        });
        report.record(&TargetOutcome::Failed {
            target: "fedora 40 amd64".into(),
            stage: Stage::SourceInjected,
            reason: "Dependency installation failed".into(),
        });
        report
    }

    #[test]
    fn sections_list_each_outcome() {
        let report = report();
        let sections = report.sections();
        assert_eq!(sections[0].0, "Built packages");
        assert_eq!(sections[0].1, ["hello.sid_1.0~debian0_amd64.deb"]);
        assert!(sections[1].1.is_empty());
        assert_eq!(
            sections[2].1,
            ["fedora 40 amd64 (after source_injected): Dependency installation failed"]
        );
        assert_eq!(report.total(), 2);
    }

    #[test]
    fn failures_are_detected() {
        assert!(report().has_failures());
        assert!(!BuildReport::new().has_failures());
    }

    #[test]
    fn print_non_interactive() {
        report().print(&UiContext::non_interactive());
        BuildReport::new().print(&UiContext::non_interactive());
    }
}
