//! In-memory ledger behind the development server. Accepted operations are applied here once
//! their inclusion delay passes; rule violations revert with a reason.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Value};
use shared::{
    domain::{Address, QueryKey, Role},
    error::{ApiError, Revert},
};
use tracing::{debug, info};

pub mod actions;

pub use actions::{decode, Action};

pub const DEFAULT_PLATFORM_FEE_BPS: u32 = 250;
pub const MAX_PLATFORM_FEE_BPS: u32 = 10_000;

#[derive(Debug, Clone)]
struct Organization {
    name: String,
    active: bool,
}

#[derive(Debug, Clone)]
struct Program {
    organization_id: u64,
    name: String,
    active: bool,
    students: BTreeSet<Address>,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    platform_fee_bps: u32,
    roles: BTreeMap<Role, BTreeSet<Address>>,
    treasury_balance: u128,
    implementation: Address,
    organizations: BTreeMap<u64, Organization>,
    programs: BTreeMap<u64, Program>,
}

impl Ledger {
    /// A ledger where `admin` holds every role except `STUDENT`, with one organization running
    /// two programs.
    pub fn seeded(admin: Address) -> Self {
        let mut roles: BTreeMap<Role, BTreeSet<Address>> = BTreeMap::new();
        for role in [Role::Admin, Role::Teacher, Role::Treasurer] {
            roles.entry(role).or_default().insert(admin.clone());
        }
        let organizations = BTreeMap::from([(
            1,
            Organization {
                name: "Northwind Academy".into(),
                active: true,
            },
        )]);
        let programs = BTreeMap::from([
            (1, program(1, "Foundations")),
            (2, program(1, "Advanced Studies")),
        ]);
        Self {
            platform_fee_bps: DEFAULT_PLATFORM_FEE_BPS,
            roles,
            treasury_balance: 0,
            implementation: Address::zero(),
            organizations,
            programs,
        }
    }

    pub fn has_role(&self, role: Role, account: &Address) -> bool {
        self.roles
            .get(&role)
            .is_some_and(|holders| holders.contains(account))
    }

    /// Applies `action` on behalf of `caller`. Nothing changes when it reverts. The returned
    /// string describes what happened.
    pub fn apply(&mut self, caller: Option<&Address>, action: &Action) -> Result<String, Revert> {
        let caller = caller.ok_or_else(|| Revert::new("operation has no sender"))?;
        let detail = match action {
            Action::SetPlatformFee { fee_bps } => {
                self.require_role(Role::Admin, caller)?;
                if *fee_bps > MAX_PLATFORM_FEE_BPS {
                    return Err(Revert::new("fee exceeds 10000 basis points"));
                }
                if *fee_bps == self.platform_fee_bps {
                    return Err(Revert::new("fee unchanged"));
                }
                self.platform_fee_bps = *fee_bps;
                format!("platform fee set to {fee_bps} bps")
            }
            Action::GrantRole { role, account } => {
                self.require_role(Role::Admin, caller)?;
                if !self.roles.entry(*role).or_default().insert(account.clone()) {
                    return Err(Revert::new(format!("{account} already holds {role}")));
                }
                format!("granted {role} to {account}")
            }
            Action::RevokeRole { role, account } => {
                self.require_role(Role::Admin, caller)?;
                self.remove_role(*role, account)?;
                format!("revoked {role} from {account}")
            }
            Action::RenounceRole { role, account } => {
                if account != caller {
                    return Err(Revert::new("can only renounce roles for self"));
                }
                self.remove_role(*role, account)?;
                format!("{account} renounced {role}")
            }
            Action::EnrollStudent {
                program_id,
                student,
            } => {
                if !self.has_role(Role::Teacher, caller) {
                    self.require_role(Role::Admin, caller)?;
                }
                let program = self.active_program(*program_id)?;
                if !program.students.insert(student.clone()) {
                    return Err(Revert::new(format!(
                        "{student} is already enrolled in program {program_id}"
                    )));
                }
                self.roles
                    .entry(Role::Student)
                    .or_default()
                    .insert(student.clone());
                format!("enrolled {student} in program {program_id}")
            }
            Action::DepositFunds { amount } => {
                if *amount == 0 {
                    return Err(Revert::new("deposit must be positive"));
                }
                self.treasury_balance = self
                    .treasury_balance
                    .checked_add(*amount)
                    .ok_or_else(|| Revert::new("treasury balance overflow"))?;
                format!("deposited {amount}")
            }
            Action::WithdrawFunds { recipient, amount } => {
                self.require_role(Role::Treasurer, caller)?;
                if *amount == 0 {
                    return Err(Revert::new("withdrawal must be positive"));
                }
                if *amount > self.treasury_balance {
                    return Err(Revert::new("insufficient balance"));
                }
                self.treasury_balance -= amount;
                format!("withdrew {amount} to {recipient}")
            }
            Action::UpgradeImplementation { implementation } => {
                self.require_role(Role::Admin, caller)?;
                if *implementation == self.implementation {
                    return Err(Revert::new("implementation unchanged"));
                }
                self.implementation = implementation.clone();
                format!("implementation upgraded to {implementation}")
            }
            Action::DeactivateOrganization { organization_id } => {
                self.require_role(Role::Admin, caller)?;
                let organization = self
                    .organizations
                    .get_mut(organization_id)
                    .ok_or_else(|| Revert::new(format!("unknown organization {organization_id}")))?;
                if !organization.active {
                    return Err(Revert::new(format!(
                        "organization {organization_id} is already deactivated"
                    )));
                }
                organization.active = false;
                for program in self
                    .programs
                    .values_mut()
                    .filter(|program| program.organization_id == *organization_id)
                {
                    program.active = false;
                }
                format!("organization {organization_id} deactivated")
            }
            Action::DeactivateProgram { program_id } => {
                self.require_role(Role::Admin, caller)?;
                self.active_program(*program_id)?.active = false;
                format!("program {program_id} deactivated")
            }
        };
        info!(action = action.name(), %caller, %detail, "operation applied");
        Ok(detail)
    }

    pub fn query(&self, key: &QueryKey) -> Result<Value, ApiError> {
        debug!(query = %key, "ledger query");
        let value = match key.as_str() {
            "platform_fee" => json!(self.platform_fee_bps),
            "treasury_balance" => json!(self.treasury_balance.to_string()),
            "implementation" => json!(self.implementation),
            "role_holders" => {
                let holders: BTreeMap<&str, Vec<&Address>> = Role::ALL
                    .iter()
                    .map(|role| {
                        let accounts = self
                            .roles
                            .get(role)
                            .map(|set| set.iter().collect())
                            .unwrap_or_default();
                        (role.as_str(), accounts)
                    })
                    .collect();
                json!(holders)
            }
            "organizations" => Value::Array(
                self.organizations
                    .iter()
                    .map(|(id, org)| json!({ "id": id, "name": org.name, "active": org.active }))
                    .collect(),
            ),
            "programs" => Value::Array(
                self.programs
                    .iter()
                    .map(|(id, program)| {
                        json!({
                            "id": id,
                            "organization_id": program.organization_id,
                            "name": program.name,
                            "active": program.active,
                        })
                    })
                    .collect(),
            ),
            "students" => {
                let students: BTreeSet<&Address> = self
                    .programs
                    .values()
                    .flat_map(|program| program.students.iter())
                    .collect();
                json!(students)
            }
            "enrollments" => Value::Array(
                self.programs
                    .iter()
                    .flat_map(|(id, program)| {
                        program
                            .students
                            .iter()
                            .map(move |student| json!({ "program_id": id, "student": student }))
                    })
                    .collect(),
            ),
            other => return Err(ApiError::not_found(format!("unknown query {other}"))),
        };
        Ok(value)
    }

    fn require_role(&self, role: Role, caller: &Address) -> Result<(), Revert> {
        if self.has_role(role, caller) {
            Ok(())
        } else {
            Err(Revert::new(format!(
                "AccessControl: account {caller} is missing role {role}"
            )))
        }
    }

    fn remove_role(&mut self, role: Role, account: &Address) -> Result<(), Revert> {
        let removed = self
            .roles
            .get_mut(&role)
            .is_some_and(|holders| holders.remove(account));
        if removed {
            Ok(())
        } else {
            Err(Revert::new(format!("{account} does not hold {role}")))
        }
    }

    fn active_program(&mut self, program_id: u64) -> Result<&mut Program, Revert> {
        let program = self
            .programs
            .get_mut(&program_id)
            .ok_or_else(|| Revert::new(format!("unknown program {program_id}")))?;
        if !program.active {
            return Err(Revert::new(format!(
                "program {program_id} is already deactivated"
            )));
        }
        Ok(program)
    }
}

fn program(organization_id: u64, name: &str) -> Program {
    Program {
        organization_id,
        name: name.to_string(),
        active: true,
        students: BTreeSet::new(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use shared::{
        domain::{ActionId, CorrelationId},
        error::ErrorCode,
        protocol::SubmitOperationRequest,
    };

    use super::*;

    fn addr(last: u8) -> Address {
        Address::parse(&format!("0x{:040x}", last)).expect("address")
    }

    fn request(action: &str, args: Vec<Value>, value: Option<&str>) -> SubmitOperationRequest {
        SubmitOperationRequest {
            correlation_id: CorrelationId::new(),
            action: ActionId::new(action),
            args,
            value: value.map(str::to_string),
            from: Some(addr(0xaa)),
        }
    }

    #[test]
    fn decodes_flow_arguments() {
        let action = decode(&request(
            "grant_role",
            vec![json!("TEACHER"), json!(addr(0xbb).as_str())],
            None,
        ))
        .expect("decode");
        assert_eq!(
            action,
            Action::GrantRole {
                role: Role::Teacher,
                account: addr(0xbb)
            }
        );

        let fee = decode(&request("set_platform_fee", vec![json!(300)], None)).expect("decode");
        assert_eq!(fee, Action::SetPlatformFee { fee_bps: 300 });
    }

    #[test]
    fn unknown_and_malformed_actions_are_rejected() {
        let err = decode(&request("mint", Vec::new(), None)).expect_err("unknown");
        assert_eq!(err.code, ErrorCode::UnknownAction);

        let err = decode(&request("withdraw_funds", vec![json!("0x12")], None))
            .expect_err("malformed");
        assert_eq!(err.code, ErrorCode::Validation);

        let err = decode(&request("deactivate_program", vec![json!("1")], Some("5")))
            .expect_err("value on a non-payable action");
        assert_eq!(err.code, ErrorCode::Validation);
    }

    #[test]
    fn withdrawing_more_than_the_balance_reverts() {
        let admin = addr(0xaa);
        let mut ledger = Ledger::seeded(admin.clone());
        ledger
            .apply(Some(&admin), &Action::DepositFunds { amount: 100 })
            .expect("deposit");

        let err = ledger
            .apply(
                Some(&admin),
                &Action::WithdrawFunds {
                    recipient: addr(0xbb),
                    amount: 101,
                },
            )
            .expect_err("overdraw");
        assert_eq!(err.reason, "insufficient balance");
        assert_eq!(
            ledger.query(&QueryKey::new("treasury_balance")).expect("query"),
            json!("100")
        );
    }

    #[test]
    fn callers_without_the_role_are_refused() {
        let mut ledger = Ledger::seeded(addr(0xaa));
        let stranger = addr(0xcc);
        let err = ledger
            .apply(Some(&stranger), &Action::SetPlatformFee { fee_bps: 10 })
            .expect_err("unauthorized");
        assert!(err.reason.contains("missing role ADMIN"), "{}", err.reason);
        assert_eq!(
            ledger.query(&QueryKey::new("platform_fee")).expect("query"),
            json!(DEFAULT_PLATFORM_FEE_BPS)
        );
    }

    #[test]
    fn renounce_only_for_self_and_only_held_roles() {
        let admin = addr(0xaa);
        let mut ledger = Ledger::seeded(admin.clone());
        let err = ledger
            .apply(
                Some(&admin),
                &Action::RenounceRole {
                    role: Role::Teacher,
                    account: addr(0xbb),
                },
            )
            .expect_err("not self");
        assert_eq!(err.reason, "can only renounce roles for self");

        ledger
            .apply(
                Some(&admin),
                &Action::RenounceRole {
                    role: Role::Teacher,
                    account: admin.clone(),
                },
            )
            .expect("renounce");
        assert!(!ledger.has_role(Role::Teacher, &admin));
        assert!(ledger
            .apply(
                Some(&admin),
                &Action::RenounceRole {
                    role: Role::Teacher,
                    account: admin.clone(),
                },
            )
            .is_err());
    }

    #[test]
    fn deactivating_an_organization_closes_its_programs() {
        let admin = addr(0xaa);
        let mut ledger = Ledger::seeded(admin.clone());
        ledger
            .apply(
                Some(&admin),
                &Action::DeactivateOrganization { organization_id: 1 },
            )
            .expect("deactivate");

        let err = ledger
            .apply(
                Some(&admin),
                &Action::DeactivateOrganization { organization_id: 1 },
            )
            .expect_err("twice");
        assert_eq!(err.reason, "organization 1 is already deactivated");

        let err = ledger
            .apply(
                Some(&admin),
                &Action::EnrollStudent {
                    program_id: 2,
                    student: addr(0xbb),
                },
            )
            .expect_err("closed program");
        assert_eq!(err.reason, "program 2 is already deactivated");
    }

    #[test]
    fn enrollment_shows_up_in_reads() {
        let admin = addr(0xaa);
        let mut ledger = Ledger::seeded(admin.clone());
        ledger
            .apply(
                Some(&admin),
                &Action::EnrollStudent {
                    program_id: 1,
                    student: addr(0xbb),
                },
            )
            .expect("enroll");

        assert_eq!(
            ledger.query(&QueryKey::new("students")).expect("students"),
            json!([addr(0xbb).as_str()])
        );
        assert_eq!(
            ledger.query(&QueryKey::new("enrollments")).expect("enrollments"),
            json!([{ "program_id": 1, "student": addr(0xbb).as_str() }])
        );
        assert!(ledger.has_role(Role::Student, &addr(0xbb)));
        assert_eq!(
            ledger
                .query(&QueryKey::new("nonsense"))
                .expect_err("unknown")
                .code,
            ErrorCode::NotFound
        );
    }

    #[test]
    fn operations_without_a_sender_revert() {
        let mut ledger = Ledger::seeded(addr(0xaa));
        let err = ledger
            .apply(None, &Action::DepositFunds { amount: 1 })
            .expect_err("no sender");
        assert_eq!(err.reason, "operation has no sender");
    }
}
