//! System-wide consistency check over the plugin catalog.

use serde::Serialize;

use super::record::PluginState;
use super::registry::Registry;

/// A single finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub code: &'static str,
    pub plugin: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationSummary {
    pub total: usize,
    pub enabled: usize,
    pub issues: usize,
    pub warnings: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub summary: ValidationSummary,
}

/// Check that every Active plugin's dependencies are Active too.
///
/// Only broken dependencies of Active plugins make the system invalid.
/// Failed, Missing and duplicate plugins are reported as warnings.
pub fn validate_system(registry: &Registry) -> ValidationReport {
    let records = registry.list();
    let mut issues = Vec::new();
    let mut warnings = Vec::new();

    for record in &records {
        match record.state {
            PluginState::Active => {
                for dep in record.dependencies() {
                    match registry.state(dep) {
                        Some(PluginState::Active) => {}
                        None | Some(PluginState::Missing | PluginState::Suppressed) => {
                            issues.push(ValidationIssue {
                                code: "missing_dependency",
                                plugin: record.id.clone(),
                                message: format!("depends on '{dep}', which is not installed"),
                            });
                        }
                        Some(state) => issues.push(ValidationIssue {
                            code: "disabled_dependency",
                            plugin: record.id.clone(),
                            message: format!("depends on '{dep}', which is {state}"),
                        }),
                    }
                }
            }
            PluginState::Failed => warnings.push(ValidationIssue {
                code: "plugin_load_error",
                plugin: record.id.clone(),
                message: record
                    .error_message()
                    .unwrap_or("plugin failed")
                    .to_string(),
            }),
            PluginState::Missing => warnings.push(ValidationIssue {
                code: "missing_plugin",
                plugin: record.id.clone(),
                message: format!(
                    "configured but not found at {}",
                    record.directory_path.display()
                ),
            }),
            _ => {}
        }
    }

    warnings.extend(registry.warnings().into_iter().map(|w| ValidationIssue {
        code: w.code,
        plugin: w.plugin,
        message: w.message,
    }));

    let summary = ValidationSummary {
        total: records.len(),
        enabled: records
            .iter()
            .filter(|r| r.state == PluginState::Active)
            .count(),
        issues: issues.len(),
        warnings: warnings.len(),
    };

    ValidationReport {
        valid: issues.is_empty(),
        issues,
        warnings,
        summary,
    }
}
