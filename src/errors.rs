// Copyright 2024, The Tremor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::record::TableId;
use std::fmt;

/// Errors resolving or scoping credentials, these are fatal at startup
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialsError {
    /// The credential payload is not valid json or misses required fields
    #[error("Malformed credential payload: {0}")]
    MalformedPayload(String),
    /// The credential file could not be read
    #[error("Credential file '{path}' is unreadable: {reason}")]
    FileUnreadable {
        /// path of the credential file
        path: String,
        /// underlying cause
        reason: String,
    },
    /// No ambient credentials are available in this environment
    #[error("No ambient credentials available")]
    NoAmbientCredentials,
    /// Unknown key source
    #[error("Unknown key source '{0}'")]
    UnknownSource(String),
    /// The credential could not be narrowed to the requested scopes
    #[error("Failed to scope credentials: {0}")]
    ScopingFailed(String),
}

/// Errors constructing or closing write sessions
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The warehouse rejected the credential
    #[error("Authentication rejected: {0}")]
    AuthenticationRejected(String),
    /// No channel to the warehouse could be established
    #[error("Failed to establish a channel: {0}")]
    Channel(String),
    /// A session for the given table could not be established
    #[error("Failed to connect write session for {table}: {reason}")]
    Connect {
        /// destination table
        table: TableId,
        /// underlying cause
        reason: String,
    },
    /// The warehouse did not provide a schema for the table
    #[error("Schema for table {0} was not provided")]
    SchemaNotProvided(TableId),
    /// A session did not close cleanly
    #[error("Failed to close write session for {table}: {reason}")]
    Close {
        /// destination table
        table: TableId,
        /// underlying cause
        reason: String,
    },
    /// The pool has been shut down
    #[error("Write client pool is closed")]
    PoolClosed,
    /// Shutting down the pool left some sessions in a failed state
    #[error("Shutdown of the write client pool failed for {} session(s): {}", .0.len(), join(.0))]
    Shutdown(Vec<ClientError>),
}

fn join(errors: &[ClientError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Classification of a failed write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// transport level error (connection loss, timeout, unavailable)
    Transport,
    /// the warehouse is throttling us or a quota was exceeded
    Throttled,
    /// rows don't match the table schema
    SchemaMismatch,
    /// missing permissions for the table
    PermissionDenied,
    /// the payload could not be encoded or was rejected as malformed
    MalformedPayload,
    /// any other non-retryable rejection
    Rejected,
}

impl ClientError {
    /// whether acquiring a session may succeed when tried again later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Channel(_) | Self::Connect { .. })
    }
}

impl FailureKind {
    /// whether a write failing with this kind is worth retrying
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transport | Self::Throttled)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transport => "transport error",
            Self::Throttled => "throttled",
            Self::SchemaMismatch => "schema mismatch",
            Self::PermissionDenied => "permission denied",
            Self::MalformedPayload => "malformed payload",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// A failed write to the warehouse
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct WriteError {
    kind: FailureKind,
    message: String,
}

impl WriteError {
    /// creates a new write error
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// transport level failure
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transport, message)
    }

    /// throttling or quota response
    pub fn throttled(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Throttled, message)
    }

    /// payload could not be encoded
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(FailureKind::MalformedPayload, message)
    }

    /// classification
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    /// the cause as reported by the warehouse or transport
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// whether this failure is worth retrying
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<tonic::Status> for WriteError {
    fn from(status: tonic::Status) -> Self {
        classify_grpc(status.code(), status.message())
    }
}

/// Classifies a gRPC status code, as reported either by the transport or in an append response
pub(crate) fn classify_grpc(code: tonic::Code, message: &str) -> WriteError {
    use tonic::Code;
    let kind = match code {
        Code::Unavailable
        | Code::DeadlineExceeded
        | Code::Aborted
        | Code::Internal
        | Code::Cancelled => FailureKind::Transport,
        Code::ResourceExhausted => FailureKind::Throttled,
        Code::InvalidArgument | Code::OutOfRange | Code::FailedPrecondition
            if message.to_lowercase().contains("schema") =>
        {
            FailureKind::SchemaMismatch
        }
        Code::InvalidArgument | Code::OutOfRange => FailureKind::MalformedPayload,
        Code::PermissionDenied | Code::Unauthenticated => FailureKind::PermissionDenied,
        // NotFound, AlreadyExists, FailedPrecondition, Unimplemented, DataLoss, Unknown
        _ => FailureKind::Rejected,
    };
    WriteError::new(kind, format!("{code:?}: {message}"))
}

/// A batch that could not be delivered
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Batch {batch} for table {table} is undeliverable after {attempts} attempt(s): {cause}")]
pub struct Undeliverable {
    /// id of the batch
    pub batch: u64,
    /// destination table
    pub table: TableId,
    /// number of submissions performed
    pub attempts: u32,
    /// underlying cause
    pub cause: String,
}

/// The error type for the sink
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Credentials error
    #[error(transparent)]
    Credentials(#[from] CredentialsError),
    /// Client error
    #[error(transparent)]
    Client(#[from] ClientError),
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// The task is not in the state required for the operation
    #[error("Invalid state for {operation}: task is {state}")]
    InvalidState {
        /// the operation that was attempted
        operation: &'static str,
        /// the state the task is in
        state: crate::task::State,
    },
    /// A record could not be converted into a row
    #[error("Invalid record at {0}: {1}")]
    InvalidRecord(crate::record::SourceOffset, String),
    /// A batch could not be delivered and the error policy halts the task
    #[error(transparent)]
    Undeliverable(#[from] Undeliverable),
    /// Routing a batch to the dead-letter sink failed
    #[error("Dead-letter routing failed for table {0}: {1}")]
    DeadLetter(TableId, String),
    /// A submission worker could not accept batches anymore
    #[error("Submission worker for table {0} is gone")]
    WorkerGone(TableId),
}

/// Result for the sink
pub type Result<T> = std::result::Result<T, Error>;
