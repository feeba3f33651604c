// Copyright 2023 Greptime Team
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

use std::any::Any;

use snafu::{Location, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Not enough space, requested {} bytes for part {}", requested, part))]
    NotEnoughSpace {
        requested: u64,
        part: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("No such data part {}", name))]
    NoSuchDataPart {
        name: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Bad arguments: {}", reason))]
    BadArguments {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    /// A broken invariant. Non-recoverable within the operation.
    #[snafu(display("Logical error: {}. This is a bug", reason))]
    LogicalError {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Timeout ({:?}) while {}", timeout, operation))]
    TimeoutExceeded {
        operation: String,
        timeout: std::time::Duration,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Aborted: {}", reason))]
    Aborted {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("{} is disabled", feature))]
    SupportIsDisabled {
        feature: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Table is in readonly mode"))]
    TableIsReadOnly {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Cannot process {} parts at once, the limit is {}", count, limit))]
    TooManyParts {
        count: usize,
        limit: usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Part {} is locked by transaction {}", name, tid))]
    PartIsLocked {
        name: String,
        tid: u64,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Cannot assign optimize: {}", reason))]
    CannotAssignOptimize {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Mutation {} failed on part {}: {}", version, part, reason))]
    MutationFailed {
        version: i64,
        part: String,
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Failed to access {}", path))]
    Io {
        path: String,
        source: std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Failed to ser/de json object"))]
    SerdeJson {
        source: serde_json::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Invalid part name {}", name))]
    InvalidPartName {
        name: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Invalid mutation file {}: {}", path, reason))]
    InvalidMutationFile {
        path: String,
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Failed to join background task"))]
    Join {
        source: tokio::task::JoinError,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Failed to recv job result"))]
    Recv {
        source: tokio::sync::oneshot::error::RecvError,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Background scheduler is stopped"))]
    SchedulerStopped {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Background job queue is full"))]
    JobQueueFull {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display(
        "Checksum mismatch in part {}: expected {}, got {}",
        part,
        expected,
        actual
    ))]
    ChecksumMismatch {
        part: String,
        expected: u32,
        actual: u32,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification of [Error] variants, surfaced to callers that need
/// to branch on the failure kind without matching the whole enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    NotEnoughSpace,
    NoSuchDataPart,
    BadArguments,
    LogicalError,
    TimeoutExceeded,
    Aborted,
    SupportIsDisabled,
    TableIsReadOnly,
    TooManyParts,
    PartIsLocked,
    CannotAssignOptimize,
    MutationFailed,
    Internal,
}

impl StatusCode {
    /// Whether a background job failing with this code should be retried on
    /// a later tick instead of being treated as a permanent failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StatusCode::NotEnoughSpace | StatusCode::TooManyParts | StatusCode::TimeoutExceeded
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            StatusCode::NotEnoughSpace => "NOT_ENOUGH_SPACE",
            StatusCode::NoSuchDataPart => "NO_SUCH_DATA_PART",
            StatusCode::BadArguments => "BAD_ARGUMENTS",
            StatusCode::LogicalError => "LOGICAL_ERROR",
            StatusCode::TimeoutExceeded => "TIMEOUT_EXCEEDED",
            StatusCode::Aborted => "ABORTED",
            StatusCode::SupportIsDisabled => "SUPPORT_IS_DISABLED",
            StatusCode::TableIsReadOnly => "TABLE_IS_READ_ONLY",
            StatusCode::TooManyParts => "TOO_MANY_PARTS",
            StatusCode::PartIsLocked => "PART_IS_LOCKED",
            StatusCode::CannotAssignOptimize => "CANNOT_ASSIGN_OPTIMIZE",
            StatusCode::MutationFailed => "MUTATION_FAILED",
            StatusCode::Internal => "INTERNAL",
        }
    }
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotEnoughSpace { .. } => StatusCode::NotEnoughSpace,
            Error::NoSuchDataPart { .. } => StatusCode::NoSuchDataPart,
            Error::BadArguments { .. } | Error::InvalidPartName { .. } => StatusCode::BadArguments,
            Error::LogicalError { .. } => StatusCode::LogicalError,
            Error::TimeoutExceeded { .. } => StatusCode::TimeoutExceeded,
            Error::Aborted { .. } => StatusCode::Aborted,
            Error::SupportIsDisabled { .. } => StatusCode::SupportIsDisabled,
            Error::TableIsReadOnly { .. } => StatusCode::TableIsReadOnly,
            Error::TooManyParts { .. } => StatusCode::TooManyParts,
            Error::PartIsLocked { .. } => StatusCode::PartIsLocked,
            Error::CannotAssignOptimize { .. } => StatusCode::CannotAssignOptimize,
            Error::MutationFailed { .. } => StatusCode::MutationFailed,
            _ => StatusCode::Internal,
        }
    }

    pub fn as_any(&self) -> &dyn Any {
        self
    }
}
