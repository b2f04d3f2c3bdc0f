//! Explicit re-affirmation step for high-impact operations.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::debug;

use crate::{error::ConfirmationMismatchError, types::OperationRequest};

/// Confirmation code alphabet without look-alike characters (0/O, 1/I/L).
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// How disruptive an action is; decides which confirmation it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Impact {
    Routine,
    /// Irreversible state change confirmed by typing `keyword`.
    Destructive { keyword: &'static str },
    /// Moves funds or code pointers; confirmed with a generated code.
    Critical,
}

/// What the user is asked to type back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationChallenge {
    TypePhrase { keyword: String },
    Code { code: String },
}

impl ConfirmationChallenge {
    pub fn prompt(&self) -> String {
        match self {
            ConfirmationChallenge::TypePhrase { keyword } => {
                format!("Type {keyword} to confirm")
            }
            ConfirmationChallenge::Code { code } => format!("Enter code {code} to confirm"),
        }
    }

    fn expected(&self) -> &str {
        match self {
            ConfirmationChallenge::TypePhrase { keyword } => keyword,
            ConfirmationChallenge::Code { code } => code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Approved,
    Challenge(ConfirmationChallenge),
}

/// Short-lived value the user must echo back before submission is allowed.
#[derive(Debug, Clone)]
pub struct ConfirmationToken {
    challenge: ConfirmationChallenge,
    expires_at: Instant,
}

impl ConfirmationToken {
    pub fn challenge(&self) -> &ConfirmationChallenge {
        &self.challenge
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Debug)]
pub struct ConfirmationGate {
    impact: Impact,
    code_length: usize,
    token_ttl: Duration,
    token: Option<ConfirmationToken>,
    last_code: Option<String>,
}

impl ConfirmationGate {
    pub fn new(impact: Impact, code_length: usize, token_ttl: Duration) -> Self {
        Self {
            impact,
            code_length: code_length.max(1),
            token_ttl,
            token: None,
            last_code: None,
        }
    }

    pub fn impact(&self) -> Impact {
        self.impact
    }

    /// Arms the gate for `request`. Every call issues a fresh token; a code is never reused.
    pub fn require_confirmation(&mut self, request: &OperationRequest) -> GateDecision {
        let challenge = match self.impact {
            Impact::Routine => {
                self.token = None;
                return GateDecision::Approved;
            }
            Impact::Destructive { keyword } => ConfirmationChallenge::TypePhrase {
                keyword: keyword.to_string(),
            },
            Impact::Critical => {
                let mut rng = rand::thread_rng();
                let mut code = generate_code(&mut rng, self.code_length);
                while self.last_code.as_deref() == Some(code.as_str()) {
                    code = generate_code(&mut rng, self.code_length);
                }
                self.last_code = Some(code.clone());
                ConfirmationChallenge::Code { code }
            }
        };

        debug!(
            correlation_id = %request.correlation_id(),
            action = %request.action(),
            "confirmation step armed"
        );
        self.token = Some(ConfirmationToken {
            challenge: challenge.clone(),
            expires_at: Instant::now() + self.token_ttl,
        });
        GateDecision::Challenge(challenge)
    }

    /// Checks `input` against the armed token. A match consumes the token; a mismatch keeps it.
    pub fn verify(&mut self, input: &str) -> Result<(), ConfirmationMismatchError> {
        let token = self
            .token
            .as_ref()
            .ok_or(ConfirmationMismatchError::NotAwaiting)?;
        if token.is_expired() {
            return Err(ConfirmationMismatchError::Expired);
        }
        if input.trim() != token.challenge.expected() {
            return Err(ConfirmationMismatchError::Mismatch);
        }
        self.token = None;
        Ok(())
    }

    pub fn current(&self) -> Option<&ConfirmationToken> {
        self.token.as_ref()
    }

    pub fn discard(&mut self) {
        self.token = None;
    }
}

pub fn generate_code<R: Rng + ?Sized>(rng: &mut R, length: usize) -> String {
    (0..length)
        .map(|_| char::from(CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())]))
        .collect()
}

#[cfg(test)]
#[path = "tests/confirmation_tests.rs"]
mod tests;
