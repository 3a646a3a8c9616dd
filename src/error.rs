// Copyright 2020 Google LLC
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

//! Top-level error type and the exit-code mapping of the error-handling
//! table.

use thiserror::Error;

use crate::config::ConfigError;
use crate::targets::TargetError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid command line: {0}")]
    InvalidArgs(String),

    #[error("could not read target file: {0}")]
    TargetFile(#[source] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error("socket setup failed: {0}")]
    SocketSetup(#[source] std::io::Error),

    #[error("interface bind failed: {0}")]
    InterfaceBind(#[source] std::io::Error),

    #[error("privilege drop failed: {0}")]
    PrivilegeDrop(String),
}

impl AppError {
    /// Process exit code per the error-disposition table: 2 is reserved
    /// for resolution failures, which are tracked separately by `main`
    /// since they are non-fatal warnings rather than this error type.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::InvalidArgs(_) => 3,
            AppError::TargetFile(_) => 3,
            AppError::Config(_) => 3,
            AppError::Target(TargetError::AddressFamilyUnsupported(_)) => 3,
            AppError::Target(_) => 2,
            AppError::SocketSetup(_) => 4,
            AppError::InterfaceBind(_) => 1,
            AppError::PrivilegeDrop(_) => 4,
        }
    }
}
