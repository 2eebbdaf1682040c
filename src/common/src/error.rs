// Copyright 2024 Yuanrong Scheduler Authors
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

//! Crate-wide error taxonomy.
//!
//! Each subsystem keeps its own error enum and converts into [`YrError`] at
//! the boundary, the way a larger system splits subsystem-local error types
//! out of one top-level error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type YrResult<T> = std::result::Result<T, YrError>;

/// Stable error codes surfaced to callers in `ScheduleResponse` and other
/// user-visible failure paths.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[error("ok")]
    Ok = 0,
    #[error("parameter error")]
    ParameterError,
    #[error("resource conflict")]
    ResourceConflict,
    #[error("scheduling conflicted")]
    ScheduleConflict,
    #[error("selected unit disappeared")]
    UnitNotFound,
    #[error("request canceled")]
    ScheduleCanceled,
    #[error("request timed out")]
    RequestTimeOut,
    #[error("internal system error")]
    InnerSystemError,
    #[error("transport error")]
    TransportError,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// The top-level error type every `YrResult` resolves to.
///
/// Parameter errors and resource conflicts carry a stable [`ErrorCode`] and
/// propagate to the caller; transport and consistency errors are recovered
/// locally and rarely surface this far in practice.
#[derive(Error, Debug)]
pub enum YrError {
    #[error("{code}: {message}")]
    Coded { code: ErrorCode, message: String },

    #[error("meta store error: {0}")]
    MetaStore(#[from] anyhow::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl YrError {
    pub fn parameter(message: impl Into<String>) -> Self {
        Self::Coded {
            code: ErrorCode::ParameterError,
            message: message.into(),
        }
    }

    pub fn resource_conflict(message: impl Into<String>) -> Self {
        Self::Coded {
            code: ErrorCode::ResourceConflict,
            message: message.into(),
        }
    }

    pub fn unit_not_found(id: impl std::fmt::Display) -> Self {
        Self::Coded {
            code: ErrorCode::UnitNotFound,
            message: format!("resource unit {id} not found"),
        }
    }

    pub fn canceled() -> Self {
        Self::Coded {
            code: ErrorCode::ScheduleCanceled,
            message: "schedule canceled".to_string(),
        }
    }

    pub fn timeout() -> Self {
        Self::Coded {
            code: ErrorCode::RequestTimeOut,
            message: "request timed out".to_string(),
        }
    }

    pub fn inner_system_error(message: impl Into<String>) -> Self {
        Self::Coded {
            code: ErrorCode::InnerSystemError,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            YrError::Coded { code, .. } => *code,
            YrError::MetaStore(_) => ErrorCode::TransportError,
            YrError::Internal(_) => ErrorCode::InnerSystemError,
        }
    }
}
