//! Pure field rules that turn raw form input into typed call arguments.
//!
//! Invalid input is always returned as data (a [`ValidationResult`]); nothing here fails
//! through control flow.

use std::collections::BTreeMap;

use serde_json::Value;
use shared::domain::{ActionId, Address};

use crate::types::OperationRequest;

/// Raw form input, keyed by field name.
pub type FormFields = BTreeMap<String, String>;

/// Field name used for errors that are not tied to a single input.
pub const SIGNER_FIELD: &str = "signer";

/// Basis points that make up 100%.
pub const MAX_BASIS_POINTS: u32 = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    errors: BTreeMap<String, String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &BTreeMap<String, String> {
        &self.errors
    }

    pub fn error_for(&self, field: &str) -> Option<&str> {
        self.errors.get(field).map(String::as_str)
    }

    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|(field, message)| format!("{field}: {message}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Keeps the first message reported for a field.
    fn reject(&mut self, field: &str, message: String) {
        self.errors.entry(field.to_string()).or_insert(message);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Address,
    /// Non-negative whole number.
    Integer,
    /// Non-negative decimal amount, submitted in base units.
    Amount { decimals: u8 },
    BasisPoints { max: u32 },
    Choice(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldUsage {
    /// Passed positionally to the action, in declaration order.
    Argument,
    /// Sent as the value to transfer.
    Value,
    /// Read-state used only by cross-field rules, never submitted.
    Context,
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub label: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub usage: FieldUsage,
}

impl FieldSpec {
    pub const fn argument(name: &'static str, label: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            label,
            kind,
            required: true,
            usage: FieldUsage::Argument,
        }
    }

    pub const fn value(name: &'static str, label: &'static str, decimals: u8) -> Self {
        Self {
            name,
            label,
            kind: FieldKind::Amount { decimals },
            required: true,
            usage: FieldUsage::Value,
        }
    }

    pub const fn context(name: &'static str, label: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            label,
            kind,
            required: false,
            usage: FieldUsage::Context,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CrossFieldRule {
    /// `field` must not equal the current value held in `current`.
    DiffersFrom {
        field: &'static str,
        current: &'static str,
    },
    /// `field` must be the connected signer's own address.
    EqualsSigner { field: &'static str },
}

#[derive(Debug, Clone, Default)]
pub struct InputValidator {
    fields: Vec<FieldSpec>,
    rules: Vec<CrossFieldRule>,
    requires_signer: bool,
}

impl InputValidator {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self {
            fields,
            rules: Vec::new(),
            requires_signer: false,
        }
    }

    pub fn with_rule(mut self, rule: CrossFieldRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn requiring_signer(mut self) -> Self {
        self.requires_signer = true;
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn validate(&self, input: &FormFields, signer: Option<&Address>) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.requires_signer && signer.is_none() {
            result.reject(SIGNER_FIELD, "Connect a wallet to continue".to_string());
        }

        for spec in &self.fields {
            let raw = input.get(spec.name).map(|v| v.trim()).unwrap_or_default();
            if raw.is_empty() {
                if spec.required {
                    result.reject(spec.name, format!("{} is required", spec.label));
                }
                continue;
            }
            if let Err(message) = coerce(spec, raw) {
                result.reject(spec.name, message);
            }
        }

        for rule in &self.rules {
            self.apply_rule(rule, input, signer, &mut result);
        }

        result
    }

    /// Validates and converts `input` into a fresh request for `action`.
    pub fn build_request(
        &self,
        action: &ActionId,
        input: &FormFields,
        signer: Option<&Address>,
    ) -> Result<OperationRequest, ValidationResult> {
        let result = self.validate(input, signer);
        if !result.is_valid() {
            return Err(result);
        }

        let mut args = Vec::new();
        let mut value = None;
        let mut result = ValidationResult::default();
        for spec in &self.fields {
            let raw = input.get(spec.name).map(|v| v.trim()).unwrap_or_default();
            if raw.is_empty() || spec.usage == FieldUsage::Context {
                continue;
            }
            match (coerce(spec, raw), spec.usage) {
                (Ok(coerced), FieldUsage::Argument) => args.push(coerced),
                (Ok(Value::String(units)), FieldUsage::Value) => value = Some(units),
                (Ok(other), FieldUsage::Value) => value = Some(other.to_string()),
                (Ok(_), FieldUsage::Context) => {}
                (Err(message), _) => result.reject(spec.name, message),
            }
        }
        if !result.is_valid() {
            return Err(result);
        }

        Ok(OperationRequest::new(action.clone(), args, value))
    }

    fn apply_rule(
        &self,
        rule: &CrossFieldRule,
        input: &FormFields,
        signer: Option<&Address>,
        result: &mut ValidationResult,
    ) {
        match rule {
            CrossFieldRule::DiffersFrom { field, current } => {
                let (Some(new_raw), Some(current_raw)) =
                    (non_empty(input, field), non_empty(input, current))
                else {
                    return;
                };
                let Some(spec) = self.spec(field) else {
                    return;
                };
                let same = match (coerce(spec, new_raw), coerce(spec, current_raw)) {
                    (Ok(new_value), Ok(current_value)) => new_value == current_value,
                    _ => new_raw == current_raw,
                };
                if same {
                    result.reject(
                        field,
                        format!("{} must differ from the current value", spec.label),
                    );
                }
            }
            CrossFieldRule::EqualsSigner { field } => {
                let Some(raw) = non_empty(input, field) else {
                    return;
                };
                let label = self.spec(field).map(|spec| spec.label).unwrap_or(*field);
                match (Address::parse(raw), signer) {
                    (Ok(target), Some(signer)) if &target == signer => {}
                    (Ok(_), _) => result.reject(
                        field,
                        format!("{label} must be your own connected address"),
                    ),
                    (Err(_), _) => {}
                }
            }
        }
    }

    fn spec(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|spec| spec.name == name)
    }
}

fn non_empty<'a>(input: &'a FormFields, field: &str) -> Option<&'a str> {
    input
        .get(field)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn coerce(spec: &FieldSpec, raw: &str) -> Result<Value, String> {
    let label = spec.label;
    match spec.kind {
        FieldKind::Text => Ok(Value::String(raw.to_string())),
        FieldKind::Address => Address::parse(raw)
            .map(|address| Value::String(address.to_string()))
            .map_err(|_| format!("{label} must be a 0x-prefixed 40-digit hex address")),
        FieldKind::Integer => parse_whole(raw, label).map(|n| Value::String(n.to_string())),
        FieldKind::Amount { decimals } => {
            parse_units(raw, decimals, label).map(|units| Value::String(units.to_string()))
        }
        FieldKind::BasisPoints { max } => {
            let bps = parse_whole(raw, label)?;
            if bps > u128::from(max) {
                return Err(format!("{label} must be at most {max} basis points"));
            }
            Ok(Value::from(bps as u64))
        }
        FieldKind::Choice(options) => options
            .iter()
            .find(|option| option.eq_ignore_ascii_case(raw))
            .map(|option| Value::String((*option).to_string()))
            .ok_or_else(|| format!("{label} must be one of {}", options.join(", "))),
    }
}

fn parse_whole(raw: &str, label: &str) -> Result<u128, String> {
    if raw.starts_with('-') {
        return Err(format!("{label} must be non-negative"));
    }
    if raw.contains('.') {
        return Err(format!("{label} must be a whole number"));
    }
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("{label} must be a number"));
    }
    raw.parse::<u128>()
        .map_err(|_| format!("{label} is too large"))
}

/// Converts a decimal amount such as `1.25` into integer base units.
fn parse_units(raw: &str, decimals: u8, label: &str) -> Result<u128, String> {
    if raw.starts_with('-') {
        return Err(format!("{label} must be non-negative"));
    }
    let (whole, fraction) = raw.split_once('.').unwrap_or((raw, ""));
    let digits_only = |part: &str| part.chars().all(|c| c.is_ascii_digit());
    if (whole.is_empty() && fraction.is_empty()) || !digits_only(whole) || !digits_only(fraction)
    {
        return Err(format!("{label} must be a number"));
    }
    if fraction.len() > usize::from(decimals) {
        return Err(format!("{label} supports at most {decimals} decimal places"));
    }

    let padded = format!(
        "{whole}{fraction}{}",
        "0".repeat(usize::from(decimals) - fraction.len())
    );
    let trimmed = padded.trim_start_matches('0');
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed
        .parse::<u128>()
        .map_err(|_| format!("{label} is too large"))
}

#[cfg(test)]
#[path = "tests/validation_tests.rs"]
mod tests;
