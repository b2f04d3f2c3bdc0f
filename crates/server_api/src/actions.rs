//! Decodes wire requests into typed ledger actions.

use serde_json::Value;
use shared::{
    domain::{Address, Role},
    error::{ApiError, ErrorCode},
    protocol::SubmitOperationRequest,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SetPlatformFee { fee_bps: u32 },
    GrantRole { role: Role, account: Address },
    RevokeRole { role: Role, account: Address },
    RenounceRole { role: Role, account: Address },
    EnrollStudent { program_id: u64, student: Address },
    DepositFunds { amount: u128 },
    WithdrawFunds { recipient: Address, amount: u128 },
    UpgradeImplementation { implementation: Address },
    DeactivateOrganization { organization_id: u64 },
    DeactivateProgram { program_id: u64 },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::SetPlatformFee { .. } => "set_platform_fee",
            Action::GrantRole { .. } => "grant_role",
            Action::RevokeRole { .. } => "revoke_role",
            Action::RenounceRole { .. } => "renounce_role",
            Action::EnrollStudent { .. } => "enroll_student",
            Action::DepositFunds { .. } => "deposit_funds",
            Action::WithdrawFunds { .. } => "withdraw_funds",
            Action::UpgradeImplementation { .. } => "upgrade_implementation",
            Action::DeactivateOrganization { .. } => "deactivate_organization",
            Action::DeactivateProgram { .. } => "deactivate_program",
        }
    }
}

pub fn decode(req: &SubmitOperationRequest) -> Result<Action, ApiError> {
    let args = Args(&req.args);
    let action = match req.action.as_str() {
        "set_platform_fee" => {
            args.expect_len(1)?;
            let fee_bps = u32::try_from(args.integer(0, "fee_bps")?)
                .map_err(|_| ApiError::validation("fee_bps is out of range"))?;
            Action::SetPlatformFee { fee_bps }
        }
        "grant_role" | "revoke_role" | "renounce_role" => {
            args.expect_len(2)?;
            let role = args.role(0)?;
            let account = args.address(1, "account")?;
            match req.action.as_str() {
                "grant_role" => Action::GrantRole { role, account },
                "revoke_role" => Action::RevokeRole { role, account },
                _ => Action::RenounceRole { role, account },
            }
        }
        "enroll_student" => {
            args.expect_len(2)?;
            Action::EnrollStudent {
                program_id: args.id(0, "program_id")?,
                student: args.address(1, "student")?,
            }
        }
        "deposit_funds" => {
            args.expect_len(0)?;
            let raw = req
                .value
                .as_deref()
                .ok_or_else(|| ApiError::validation("deposit_funds requires a value"))?;
            Action::DepositFunds {
                amount: parse_amount(raw, "value")?,
            }
        }
        "withdraw_funds" => {
            args.expect_len(2)?;
            Action::WithdrawFunds {
                recipient: args.address(0, "recipient")?,
                amount: args.integer(1, "amount")?,
            }
        }
        "upgrade_implementation" => {
            args.expect_len(1)?;
            Action::UpgradeImplementation {
                implementation: args.address(0, "implementation")?,
            }
        }
        "deactivate_organization" => {
            args.expect_len(1)?;
            Action::DeactivateOrganization {
                organization_id: args.id(0, "organization_id")?,
            }
        }
        "deactivate_program" => {
            args.expect_len(1)?;
            Action::DeactivateProgram {
                program_id: args.id(0, "program_id")?,
            }
        }
        other => {
            return Err(ApiError::new(
                ErrorCode::UnknownAction,
                format!("unknown action {other}"),
            ))
        }
    };
    if req.value.is_some() && !matches!(action, Action::DepositFunds { .. }) {
        return Err(ApiError::validation(format!(
            "{} does not accept a value",
            action.name()
        )));
    }
    Ok(action)
}

struct Args<'a>(&'a [Value]);

impl Args<'_> {
    fn expect_len(&self, expected: usize) -> Result<(), ApiError> {
        if self.0.len() == expected {
            Ok(())
        } else {
            Err(ApiError::validation(format!(
                "expected {expected} arguments, got {}",
                self.0.len()
            )))
        }
    }

    fn text(&self, index: usize, name: &str) -> Result<String, ApiError> {
        match self.0.get(index) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(ApiError::validation(format!("{name} is missing or malformed"))),
        }
    }

    fn integer(&self, index: usize, name: &str) -> Result<u128, ApiError> {
        parse_amount(&self.text(index, name)?, name)
    }

    fn id(&self, index: usize, name: &str) -> Result<u64, ApiError> {
        u64::try_from(self.integer(index, name)?)
            .map_err(|_| ApiError::validation(format!("{name} is out of range")))
    }

    fn address(&self, index: usize, name: &str) -> Result<Address, ApiError> {
        Address::parse(&self.text(index, name)?)
            .map_err(|err| ApiError::validation(format!("{name}: {err}")))
    }

    fn role(&self, index: usize) -> Result<Role, ApiError> {
        let raw = self.text(index, "role")?;
        Role::parse(&raw).ok_or_else(|| ApiError::validation(format!("unknown role {raw}")))
    }
}

fn parse_amount(raw: &str, name: &str) -> Result<u128, ApiError> {
    raw.trim()
        .parse::<u128>()
        .map_err(|_| ApiError::validation(format!("{name} must be a non-negative integer")))
}
