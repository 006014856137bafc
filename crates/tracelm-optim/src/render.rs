//! Plain-text rendering of optimizer steps for logs and the CLI.

use std::fmt;

use crate::optimizer::StepRecord;

/// Renders one step as an indented report.
pub fn render_step(record: &StepRecord) -> String {
    record.to_string()
}

impl fmt::Display for StepRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Step {}", self.step)?;

        if self.feedback.is_empty() {
            writeln!(f, "Feedback: (none)")?;
        } else {
            writeln!(f, "Feedback:")?;
            for line in self.feedback.lines() {
                writeln!(f, "  {}", line)?;
            }
        }

        if self.changes.is_empty() {
            writeln!(f, "No changes.")?;
        } else {
            writeln!(f, "Changes:")?;
            for change in &self.changes {
                writeln!(f, "  {}: {} -> {}", change.identifier, change.before, change.after)?;
            }
        }

        if !self.ignored.is_empty() {
            writeln!(f, "Ignored: {}", self.ignored.join(", "))?;
        }
        Ok(())
    }
}
