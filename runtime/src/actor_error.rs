// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt::Display;

use fvm_shared::error::ExitCode;
use thiserror::Error;

/// Why an actor method aborted: an exit code and a message for whoever reads the trace.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{msg} (exit code {exit_code:?})")]
pub struct ActorError {
    exit_code: ExitCode,
    msg: String,
}

macro_rules! exit_code_constructors {
    ($($name:ident => $code:ident,)*) => {
        $(
            pub fn $name(msg: String) -> Self {
                Self { exit_code: ExitCode::$code, msg }
            }
        )*
    };
}

impl ActorError {
    /// An error with any exit code, including ones reserved for the system.
    pub fn unchecked(exit_code: ExitCode, msg: String) -> Self {
        Self { exit_code, msg }
    }

    exit_code_constructors! {
        illegal_argument => USR_ILLEGAL_ARGUMENT,
        not_found => USR_NOT_FOUND,
        forbidden => USR_FORBIDDEN,
        insufficient_funds => USR_INSUFFICIENT_FUNDS,
        illegal_state => USR_ILLEGAL_STATE,
        serialization => USR_SERIALIZATION,
        unhandled_message => USR_UNHANDLED_MESSAGE,
        assertion_failed => USR_ASSERTION_FAILED,
    }

    pub fn is(&self, code: ExitCode) -> bool {
        self.exit_code == code
    }

    pub fn exit_code(&self) -> ExitCode {
        self.exit_code
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }

    /// Prepends `context` to the message, keeping the exit code.
    pub fn wrap(mut self, context: impl AsRef<str>) -> Self {
        self.msg = format!("{}: {}", context.as_ref(), self.msg);
        self
    }
}

impl From<fvm_ipld_encoding::Error> for ActorError {
    fn from(e: fvm_ipld_encoding::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

/// Builds an [`ActorError`] from a constructor name and a message or format string.
///
/// ```ignore
/// actor_error!(illegal_argument, "invalid deadline {}", idx);
/// actor_error!(not_found; "no such partition");
/// ```
#[macro_export]
macro_rules! actor_error {
    ( $code:ident; $msg:expr ) => { $crate::ActorError::$code($msg.to_string()) };
    ( $code:ident; $msg:literal $(, $ex:expr)+ ) => {
        $crate::ActorError::$code(format!($msg, $($ex,)*))
    };
    ( $code:ident, $msg:expr ) => { $crate::actor_error!($code; $msg) };
    ( $code:ident, $msg:literal $(, $ex:expr)+ ) => {
        $crate::actor_error!($code; $msg $(, $ex)*)
    };
}

/// Adds context to the message of an error that is already an [`ActorError`].
pub trait ActorContext<T> {
    fn context<C>(self, context: C) -> Result<T, ActorError>
    where
        C: Display + 'static;

    fn with_context<C, F>(self, f: F) -> Result<T, ActorError>
    where
        C: Display + 'static,
        F: FnOnce() -> C;
}

impl<T> ActorContext<T> for Result<T, ActorError> {
    fn context<C>(self, context: C) -> Result<T, ActorError>
    where
        C: Display + 'static,
    {
        self.map_err(|e| e.wrap(context.to_string()))
    }

    fn with_context<C, F>(self, f: F) -> Result<T, ActorError>
    where
        C: Display + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.wrap(f().to_string()))
    }
}

/// Turns a foreign error or a missing value into an [`ActorError`] with the given exit code.
pub trait AsActorError<T>: Sized {
    fn exit_code(self, code: ExitCode) -> Result<T, ActorError>;

    fn context_code<C>(self, code: ExitCode, context: C) -> Result<T, ActorError>
    where
        C: Display + 'static;

    fn with_context_code<C, F>(self, code: ExitCode, f: F) -> Result<T, ActorError>
    where
        C: Display + 'static,
        F: FnOnce() -> C;
}

// Display rather than std::error::Error, so anyhow errors from the verifier qualify.
impl<T, E: Display> AsActorError<T> for Result<T, E> {
    fn exit_code(self, code: ExitCode) -> Result<T, ActorError> {
        self.map_err(|e| ActorError::unchecked(code, e.to_string()))
    }

    fn context_code<C>(self, code: ExitCode, context: C) -> Result<T, ActorError>
    where
        C: Display + 'static,
    {
        self.map_err(|e| ActorError::unchecked(code, format!("{}: {}", context, e)))
    }

    fn with_context_code<C, F>(self, code: ExitCode, f: F) -> Result<T, ActorError>
    where
        C: Display + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|e| ActorError::unchecked(code, format!("{}: {}", f(), e)))
    }
}

impl<T> AsActorError<T> for Option<T> {
    fn exit_code(self, code: ExitCode) -> Result<T, ActorError> {
        self.ok_or_else(|| ActorError::unchecked(code, "value missing".to_string()))
    }

    fn context_code<C>(self, code: ExitCode, context: C) -> Result<T, ActorError>
    where
        C: Display + 'static,
    {
        self.ok_or_else(|| ActorError::unchecked(code, context.to_string()))
    }

    fn with_context_code<C, F>(self, code: ExitCode, f: F) -> Result<T, ActorError>
    where
        C: Display + 'static,
        F: FnOnce() -> C,
    {
        self.ok_or_else(|| ActorError::unchecked(code, f().to_string()))
    }
}
