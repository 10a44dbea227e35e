//! Campaign and step descriptor files edited by operators.

use std::collections::BTreeMap;
use std::path::Path;

use prodstat_types::{CampaignIssue, ProdstatError, ProdstatResult, WorkflowLink};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

/// Steps listed by a fresh campaign template.
pub const DEFAULT_STEPS: [&str; 7] = [
    "step1", "step2", "step3", "step4", "step5", "step6", "step7",
];
pub const DEFAULT_CAMPAIGN_YAML: &str = "campaign.yaml";

/// Blank strings in templates mean "not set yet".
fn blank_as_none<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    let text = match value {
        Some(serde_yaml::Value::String(text)) => text,
        Some(serde_yaml::Value::Number(number)) => number.to_string(),
        _ => return Ok(None),
    };
    let trimmed = text.trim();
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepDescriptor {
    pub name: String,
    #[serde(alias = "issue", deserialize_with = "blank_as_none")]
    pub issue_name: Option<String>,
    #[serde(deserialize_with = "blank_as_none")]
    pub campaign_issue: Option<String>,
    #[serde(deserialize_with = "blank_as_none")]
    pub workflow_base: Option<String>,
    #[serde(deserialize_with = "blank_as_none")]
    pub production_issue: Option<String>,
    pub split_bands: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub workflows: BTreeMap<String, WorkflowLink>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignDescriptor {
    pub name: String,
    #[serde(deserialize_with = "blank_as_none")]
    pub issue: Option<String>,
    #[serde(deserialize_with = "blank_as_none")]
    pub production_issue: Option<String>,
    pub steps: Vec<StepDescriptor>,
}

impl CampaignDescriptor {
    /// Template with the default steps and nothing filled in.
    pub fn template(name: &str, issue: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            issue: issue.map(str::to_string),
            production_issue: None,
            steps: DEFAULT_STEPS
                .iter()
                .map(|step| StepDescriptor {
                    name: step.to_string(),
                    campaign_issue: issue.map(str::to_string),
                    ..StepDescriptor::default()
                })
                .collect(),
        }
    }

    /// Descriptor that reproduces a stored campaign.
    pub fn from_record(record: &CampaignIssue) -> Self {
        Self {
            name: record.name.clone(),
            issue: record.issue.clone(),
            production_issue: record.production_issue.clone(),
            steps: record
                .steps
                .iter()
                .map(|step| StepDescriptor {
                    name: step.name.clone(),
                    issue_name: step.issue.clone(),
                    campaign_issue: record.issue.clone(),
                    workflow_base: step.workflow_base.clone(),
                    split_bands: step.split_bands,
                    ..StepDescriptor::default()
                })
                .collect(),
        }
    }

    pub fn to_yaml(&self) -> ProdstatResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

pub fn load_descriptor<T: DeserializeOwned>(path: &Path) -> ProdstatResult<T> {
    let raw =
        std::fs::read_to_string(path).map_err(|error| ProdstatError::file(path.display(), error))?;
    serde_yaml::from_str(&raw).map_err(|error| ProdstatError::InvalidRecord {
        kind: "descriptor".to_string(),
        location: path.display().to_string(),
        reason: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_template_lists_default_steps() {
        let template = CampaignDescriptor::template("w_2022_04", Some("DRP-185"));
        assert_eq!(template.steps.len(), 7);
        assert_eq!(template.steps[0].name, "step1");
        assert_eq!(template.steps[6].campaign_issue.as_deref(), Some("DRP-185"));
        assert!(template.steps.iter().all(|step| !step.split_bands));
    }

    #[test]
    fn unit_blank_template_fields_load_as_unset() {
        let raw = "name: c1\nissue: null\nsteps:\n- name: step1\n  issue_name: ''\n  split_bands: false\n  workflow_base: ''\n  campaign_issue: null\n";
        let descriptor: CampaignDescriptor = serde_yaml::from_str(raw).expect("parse");
        let step = &descriptor.steps[0];
        assert_eq!(step.issue_name, None);
        assert_eq!(step.workflow_base, None);
        assert_eq!(descriptor.issue, None);
    }

    #[test]
    fn functional_template_yaml_loads_back() {
        let template = CampaignDescriptor::template("c1", None);
        let yaml = template.to_yaml().expect("yaml");
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join(DEFAULT_CAMPAIGN_YAML);
        std::fs::write(&path, yaml).expect("write");
        let loaded: CampaignDescriptor = load_descriptor(&path).expect("load");
        assert_eq!(loaded, template);
    }

    #[test]
    fn unit_step_descriptor_reads_legacy_workflows() {
        let raw = "name: step2\nissue_name: DRP-12\nworkflow_base: /bps\nworkflows:\n  step2_g:\n    name: step2_g\n    issue_name: DRP-40\n    band: g\n";
        let descriptor: StepDescriptor = serde_yaml::from_str(raw).expect("parse");
        assert_eq!(descriptor.issue_name.as_deref(), Some("DRP-12"));
        let link = &descriptor.workflows["step2_g"];
        assert_eq!(link.issue.as_deref(), Some("DRP-40"));
        assert_eq!(link.band, "g");
    }
}
