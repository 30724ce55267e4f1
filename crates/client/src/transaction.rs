//! Retry/abort bookkeeping for one logical operation.
//!
//! A [`Transaction`] carries two tokens. Hooks request a retry or an abort by
//! placing the matching token in the payload's error list; the executor
//! recognises them by value, so no hook needs to know about any other.

use uuid::Uuid;

use crate::error::Error;
use crate::hooks::HookError;

/// Control-flow sentinel. Only a [`Transaction`] can mint one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(Uuid);

impl Token {
    fn mint() -> Self {
        Token(Uuid::new_v4())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Transaction {
    retry_token: Token,
    abort_token: Token,
    retries: i64,
}

/// What to do after a hook phase.
#[derive(Debug)]
pub(crate) enum Outcome {
    Proceed,
    Retry,
    Fail(Error),
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            retry_token: Token::mint(),
            abort_token: Token::mint(),
            retries: -1,
        }
    }

    pub fn retry_token(&self) -> Token {
        self.retry_token
    }

    pub fn abort_token(&self) -> Token {
        self.abort_token
    }

    /// Attempts made so far minus one; `-1` before the first attempt.
    pub fn retries(&self) -> i64 {
        self.retries
    }

    pub fn is_retry(&self, err: &HookError) -> bool {
        matches!(err, HookError::Control(token) if *token == self.retry_token)
    }

    pub fn is_abort(&self, err: &HookError) -> bool {
        matches!(err, HookError::Control(token) if *token == self.abort_token)
    }

    /// Count a new attempt, failing once the budget is spent.
    pub(crate) fn begin_attempt(&mut self, max_retries: u32) -> Result<u32, Error> {
        self.retries += 1;
        let attempt = u32::try_from(self.retries).unwrap_or(u32::MAX);
        if attempt > max_retries {
            return Err(Error::TooManyRetries {
                attempt,
                max_retries,
            });
        }
        Ok(attempt)
    }

    /// Decide the fate of an attempt from the errors a phase accumulated.
    /// Abort wins over retry; otherwise the most recent error is raised.
    pub(crate) fn resolve(&self, errors: Vec<HookError>) -> Outcome {
        if errors.is_empty() {
            return Outcome::Proceed;
        }
        if errors.iter().any(|err| self.is_abort(err)) {
            return Outcome::Fail(Error::ExecutionAborted);
        }
        if errors.iter().any(|err| self.is_retry(err)) {
            return Outcome::Retry;
        }

        match errors.into_iter().last() {
            Some(HookError::Failure(err)) => Outcome::Fail(err),
            Some(HookError::Control(_)) => {
                Outcome::Fail(Error::hook("control token from another transaction"))
            }
            None => Outcome::Proceed,
        }
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}
