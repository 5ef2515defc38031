// ${KEY} placeholder resolution

use crate::errors::SubstitutionError;
use regex::{Captures, Regex};
use tracing::instrument;

/// Replaces `${NAME}` placeholders through a caller-supplied lookup
#[derive(Debug, Clone)]
pub struct VariableSubstitutor {
    placeholder_regex: Regex,
}

impl VariableSubstitutor {
    pub fn new() -> Result<Self, SubstitutionError> {
        let placeholder_regex = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
            .map_err(|e| SubstitutionError::RegexError(e.to_string()))?;
        Ok(Self { placeholder_regex })
    }

    /// Resolve every placeholder, failing with the full list of unknown names
    #[instrument(skip(self, lookup), fields(template_len = template.len()))]
    pub fn substitute<F>(&self, template: &str, lookup: F) -> Result<String, SubstitutionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut undefined: Vec<String> = Vec::new();
        let result = self
            .placeholder_regex
            .replace_all(template, |caps: &Captures<'_>| {
                let name = &caps[1];
                match lookup(name) {
                    Some(value) => value,
                    None => {
                        if !undefined.iter().any(|u| u == name) {
                            undefined.push(name.to_string());
                        }
                        caps[0].to_string()
                    }
                }
            })
            .into_owned();

        if !undefined.is_empty() {
            tracing::warn!(undefined_variables = ?undefined, "Undefined variables in template");
            return Err(SubstitutionError::UndefinedVariable {
                variables: undefined,
                template: template.to_string(),
            });
        }
        Ok(result)
    }

    pub fn has_variables(&self, template: &str) -> bool {
        self.placeholder_regex.is_match(template)
    }
}
