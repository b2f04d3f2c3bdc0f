//! The dashboard's write flows, each declared once as data.

use shared::domain::{ActionId, Address, QueryKey};

use crate::{
    confirmation::Impact,
    types::OperationRequest,
    validation::{
        CrossFieldRule, FieldKind, FieldSpec, FormFields, InputValidator, ValidationResult,
        MAX_BASIS_POINTS,
    },
};

/// Decimals of the ledger's native currency.
pub const NATIVE_DECIMALS: u8 = 18;

const ROLE_NAMES: &[&str] = &["ADMIN", "TEACHER", "STUDENT", "TREASURER"];

/// Everything one write flow needs: what it calls, how its input is checked, how hard it is to
/// confirm and which reads it makes stale.
#[derive(Debug, Clone)]
pub struct FlowSpec {
    pub name: &'static str,
    pub title: &'static str,
    pub action: ActionId,
    pub validator: InputValidator,
    pub impact: Impact,
    pub affected_queries: Vec<QueryKey>,
    /// Field filled with the connected signer's address when left blank.
    pub signer_field: Option<&'static str>,
}

impl FlowSpec {
    fn new(name: &'static str, title: &'static str, validator: InputValidator) -> Self {
        Self {
            name,
            title,
            action: ActionId::new(name),
            validator: validator.requiring_signer(),
            impact: Impact::Routine,
            affected_queries: Vec::new(),
            signer_field: None,
        }
    }

    fn impact(mut self, impact: Impact) -> Self {
        self.impact = impact;
        self
    }

    fn invalidates(mut self, keys: &[&str]) -> Self {
        self.affected_queries = keys.iter().map(|key| QueryKey::new(*key)).collect();
        self
    }

    fn signer_field(mut self, field: &'static str) -> Self {
        self.signer_field = Some(field);
        self
    }

    pub fn validate(&self, fields: &FormFields, signer: Option<&Address>) -> ValidationResult {
        self.validator.validate(fields, signer)
    }

    pub fn build_request(
        &self,
        fields: &FormFields,
        signer: Option<&Address>,
    ) -> Result<OperationRequest, ValidationResult> {
        self.validator.build_request(&self.action, fields, signer)
    }

    /// Fills self-referential fields from the connected identity without overwriting input.
    pub fn prefill(&self, fields: &mut FormFields, signer: Option<&Address>) {
        if let (Some(field), Some(signer)) = (self.signer_field, signer) {
            let entry = fields.entry(field.to_string()).or_default();
            if entry.trim().is_empty() {
                *entry = signer.to_string();
            }
        }
    }
}

pub fn catalog() -> Vec<FlowSpec> {
    vec![
        FlowSpec::new(
            "set_platform_fee",
            "Update platform fee",
            InputValidator::new(vec![
                FieldSpec::argument(
                    "fee_bps",
                    "Fee",
                    FieldKind::BasisPoints {
                        max: MAX_BASIS_POINTS,
                    },
                ),
                FieldSpec::context(
                    "current_fee_bps",
                    "Current fee",
                    FieldKind::BasisPoints {
                        max: MAX_BASIS_POINTS,
                    },
                ),
            ])
            .with_rule(CrossFieldRule::DiffersFrom {
                field: "fee_bps",
                current: "current_fee_bps",
            }),
        )
        .invalidates(&["platform_fee"]),
        FlowSpec::new(
            "grant_role",
            "Grant role",
            InputValidator::new(vec![
                FieldSpec::argument("role", "Role", FieldKind::Choice(ROLE_NAMES)),
                FieldSpec::argument("account", "Account", FieldKind::Address),
            ]),
        )
        .invalidates(&["role_holders"]),
        FlowSpec::new(
            "revoke_role",
            "Revoke role",
            InputValidator::new(vec![
                FieldSpec::argument("role", "Role", FieldKind::Choice(ROLE_NAMES)),
                FieldSpec::argument("account", "Account", FieldKind::Address),
            ]),
        )
        .invalidates(&["role_holders"]),
        FlowSpec::new(
            "renounce_role",
            "Renounce role",
            InputValidator::new(vec![
                FieldSpec::argument("role", "Role", FieldKind::Choice(ROLE_NAMES)),
                FieldSpec::argument("account", "Account", FieldKind::Address),
            ])
            .with_rule(CrossFieldRule::EqualsSigner { field: "account" }),
        )
        .impact(Impact::Destructive {
            keyword: "RENOUNCE",
        })
        .signer_field("account")
        .invalidates(&["role_holders"]),
        FlowSpec::new(
            "enroll_student",
            "Enroll student",
            InputValidator::new(vec![
                FieldSpec::argument("program_id", "Program", FieldKind::Integer),
                FieldSpec::argument("student", "Student", FieldKind::Address),
            ]),
        )
        .invalidates(&["students", "enrollments"]),
        FlowSpec::new(
            "deposit_funds",
            "Deposit funds",
            InputValidator::new(vec![FieldSpec::value(
                "amount",
                "Amount",
                NATIVE_DECIMALS,
            )]),
        )
        .invalidates(&["treasury_balance"]),
        FlowSpec::new(
            "withdraw_funds",
            "Withdraw funds",
            InputValidator::new(vec![
                FieldSpec::argument("recipient", "Recipient", FieldKind::Address),
                FieldSpec::argument(
                    "amount",
                    "Amount",
                    FieldKind::Amount {
                        decimals: NATIVE_DECIMALS,
                    },
                ),
            ]),
        )
        .impact(Impact::Critical)
        .invalidates(&["treasury_balance"]),
        FlowSpec::new(
            "upgrade_implementation",
            "Upgrade implementation",
            InputValidator::new(vec![
                FieldSpec::argument("implementation", "Implementation", FieldKind::Address),
                FieldSpec::context(
                    "current_implementation",
                    "Current implementation",
                    FieldKind::Address,
                ),
            ])
            .with_rule(CrossFieldRule::DiffersFrom {
                field: "implementation",
                current: "current_implementation",
            }),
        )
        .impact(Impact::Critical)
        .invalidates(&["implementation"]),
        FlowSpec::new(
            "deactivate_organization",
            "Deactivate organization",
            InputValidator::new(vec![FieldSpec::argument(
                "organization_id",
                "Organization",
                FieldKind::Integer,
            )]),
        )
        .impact(Impact::Destructive {
            keyword: "DEACTIVATE",
        })
        .invalidates(&["organizations"]),
        FlowSpec::new(
            "deactivate_program",
            "Deactivate program",
            InputValidator::new(vec![FieldSpec::argument(
                "program_id",
                "Program",
                FieldKind::Integer,
            )]),
        )
        .impact(Impact::Destructive {
            keyword: "DEACTIVATE",
        })
        .invalidates(&["programs"]),
    ]
}

pub fn find(name: &str) -> Option<FlowSpec> {
    catalog().into_iter().find(|flow| flow.name == name)
}

#[cfg(test)]
#[path = "tests/flows_tests.rs"]
mod tests;
