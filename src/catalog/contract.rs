//! Step contract types

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::capability::Capability;

/// How a service response is mapped onto declared output names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseMapping {
    /// Fallback response fields, tried in order when the output name itself is absent
    pub aliases: HashMap<String, Vec<String>>,
    /// Extract `<tag>...</tag>` content from the primary output when present
    pub extract_tag: Option<String>,
}

/// Static rule describing how one output is produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepContract {
    /// Primary output name
    pub output: String,
    pub capability: Capability,
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Outputs yielded as a side effect of producing `output`
    #[serde(default)]
    pub additional_outputs: Vec<String>,
    #[serde(default)]
    pub response: ResponseMapping,
}

impl StepContract {
    pub fn new(output: impl Into<String>, capability: impl Into<String>, inputs: &[&str]) -> Self {
        Self {
            output: output.into(),
            capability: Capability::new(capability),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            additional_outputs: Vec::new(),
            response: ResponseMapping::default(),
        }
    }

    pub fn with_additional_outputs(mut self, outputs: &[&str]) -> Self {
        self.additional_outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_alias(mut self, output: &str, fields: &[&str]) -> Self {
        self.response.aliases.insert(
            output.to_string(),
            fields.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    pub fn with_extract_tag(mut self, tag: impl Into<String>) -> Self {
        self.response.extract_tag = Some(tag.into());
        self
    }

    /// Primary output followed by additional outputs
    pub fn produced_outputs(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.output.as_str()).chain(self.additional_outputs.iter().map(String::as_str))
    }

    pub fn produces(&self, name: &str) -> bool {
        self.produced_outputs().any(|o| o == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_produced_outputs() {
        let contract = StepContract::new("transcription", "speech-to-text", &["audio_url"])
            .with_additional_outputs(&["language"]);
        let produced: Vec<&str> = contract.produced_outputs().collect();
        assert_eq!(produced, vec!["transcription", "language"]);
        assert!(contract.produces("language"));
        assert!(!contract.produces("audio_url"));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let yaml = r#"
output: summary
capability: summarize
inputs: [transcription]
response:
  aliases:
    summary: [insights, text]
  extract_tag: solution
"#;
        let contract: StepContract = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(contract.capability, Capability::new("summarize"));
        assert!(contract.additional_outputs.is_empty());
        assert_eq!(
            contract.response.aliases["summary"],
            vec!["insights".to_string(), "text".to_string()]
        );
        assert_eq!(contract.response.extract_tag.as_deref(), Some("solution"));
    }
}
