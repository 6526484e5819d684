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

//! Write sessions against the warehouse.
//!
//! A [`SessionFactory`] opens one [`WriteSession`] per destination table, the
//! [`pool::WriteClientPool`] owns the sessions and leases them out to the submission workers.
//!
//! Two adapters exist:
//!
//! * [`storage::StorageWriteFactory`] for the storage write API (protobuf rows over gRPC)
//! * [`legacy::InsertAllFactory`] for the legacy `tabledata.insertAll` REST API (json rows)

use crate::errors::{ClientError, WriteError};
use crate::record::{Record, TableId};

/// Legacy `tabledata.insertAll` adapter
pub mod legacy;
/// Per-table session pool
pub mod pool;
/// Storage write API adapter
pub mod storage;

/// Acknowledgement for a successful append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckToken {
    /// the write stream (or table) the rows were appended to
    pub stream: String,
    /// offset of the first row in the stream, if reported
    pub offset: Option<i64>,
    /// number of rows acknowledged
    pub rows: usize,
}

/// An open session for writing rows to a single table
#[async_trait::async_trait]
pub trait WriteSession: Send {
    /// Serializes a record into a row in the session's wire format
    ///
    /// # Errors
    /// if the record does not fit the table
    fn encode(&self, record: &Record) -> Result<Vec<u8>, WriteError>;

    /// Appends previously encoded rows in one request
    ///
    /// # Errors
    /// the classified failure
    async fn append(&mut self, rows: &[Vec<u8>]) -> Result<AckToken, WriteError>;

    /// Closes the session
    ///
    /// # Errors
    /// if the session could not be closed cleanly
    async fn close(&mut self) -> Result<(), ClientError>;
}

/// Opens write sessions
#[async_trait::async_trait]
pub trait SessionFactory: Send + Sync {
    /// Verifies the warehouse can be reached and accepts our credentials
    ///
    /// # Errors
    /// `ClientError::AuthenticationRejected` if the credential is rejected
    async fn handshake(&self) -> Result<(), ClientError>;

    /// Opens a new session for `table`
    ///
    /// # Errors
    /// if no session could be established
    async fn open(&self, table: &TableId) -> Result<Box<dyn WriteSession>, ClientError>;
}
