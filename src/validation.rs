//! 用户输入校验与清洗
//!
//! 空输入、超长输入直接拒绝；script 标签被去除；特殊字符占比过高只给出警告。

use std::sync::OnceLock;

use regex::Regex;

use crate::config::ValidationSection;
use crate::core::{CoreError, Result};

/// 校验通过后的输入
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedInput {
    pub text: String,
    pub warnings: Vec<String>,
}

static SCRIPT_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn script_re() -> Option<&'static Regex> {
    SCRIPT_RE
        .get_or_init(|| Regex::new(r"(?is)<script.*?</script>").ok())
        .as_ref()
}

#[derive(Debug, Clone)]
pub struct InputValidator {
    max_length: usize,
}

impl Default for InputValidator {
    fn default() -> Self {
        Self::from_config(&ValidationSection::default())
    }
}

impl InputValidator {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    pub fn from_config(cfg: &ValidationSection) -> Self {
        Self::new(cfg.max_input_length)
    }

    pub fn validate(&self, text: &str) -> Result<ValidatedInput> {
        validate_input(text, self.max_length)
    }
}

/// 校验一条用户输入
pub fn validate_input(text: &str, max_length: usize) -> Result<ValidatedInput> {
    if text.trim().is_empty() {
        return Err(CoreError::InvalidInput("Input cannot be empty".into()));
    }
    let len = text.chars().count();
    if len > max_length {
        return Err(CoreError::InvalidInput(format!(
            "Input too long ({} characters). Maximum {} characters allowed.",
            len, max_length
        )));
    }

    let mut warnings = Vec::new();
    let mut sanitized = text.to_string();
    if let Some(re) = script_re() {
        if re.is_match(&sanitized) {
            sanitized = re.replace_all(&sanitized, "").into_owned();
            warnings.push("Removed potential script tags".to_string());
        }
    }

    let special = text
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace() && *c != '_')
        .count();
    if special as f64 / len as f64 > 0.3 {
        warnings.push("High ratio of special characters".to_string());
    }

    let sanitized = sanitized.trim().to_string();
    if sanitized.is_empty() {
        return Err(CoreError::InvalidInput(
            "Input is empty after sanitization".into(),
        ));
    }
    if !warnings.is_empty() {
        tracing::warn!(warnings = %warnings.join(", "), "input validated with warnings");
    }
    Ok(ValidatedInput {
        text: sanitized,
        warnings,
    })
}
