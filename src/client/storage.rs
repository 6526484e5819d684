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

use super::{AckToken, SessionFactory, WriteSession};
use crate::credentials::{AuthInterceptor, TokenProvider};
use crate::errors::{classify_grpc, ClientError, WriteError};
use crate::record::{Field, FieldValue, Record, TableId};
use futures::{stream, StreamExt};
use googapis::google::cloud::bigquery::storage::v1::{
    append_rows_request::{self, ProtoData},
    append_rows_response::{AppendResult, Response},
    big_query_write_client::BigQueryWriteClient,
    table_field_schema::{self, Mode, Type as TableType},
    write_stream, AppendRowsRequest, CreateWriteStreamRequest, FinalizeWriteStreamRequest,
    ProtoRows, ProtoSchema, TableFieldSchema, WriteStream,
};
use prost::encoding::WireType;
use prost_types::{field_descriptor_proto, DescriptorProto, FieldDescriptorProto};
use simd_json::prelude::*;
use std::{collections::HashMap, marker::PhantomData, time::Duration};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tonic::{
    codegen::InterceptedService,
    transport::{Certificate, Channel, ClientTlsConfig},
    Code,
};

/// Creates channels to the storage write API
#[async_trait::async_trait]
pub trait ChannelFactory<
    TChannel: tonic::codegen::Service<
            http::Request<tonic::body::BoxBody>,
            Response = http::Response<tonic::transport::Body>,
        > + Clone,
>
{
    /// connects a new channel
    async fn make_channel(&self, connect_timeout: Duration) -> anyhow::Result<TChannel>;
}

/// TLS channels to `bigquerystorage.googleapis.com`
pub struct TonicChannelFactory;

#[async_trait::async_trait]
impl ChannelFactory<Channel> for TonicChannelFactory {
    async fn make_channel(&self, connect_timeout: Duration) -> anyhow::Result<Channel> {
        let tls_config = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(googapis::CERTIFICATES))
            .domain_name("bigquerystorage.googleapis.com");

        Ok(
            Channel::from_static("https://bigquerystorage.googleapis.com")
                .connect_timeout(connect_timeout)
                .tls_config(tls_config)?
                .connect()
                .await?,
        )
    }
}

/// A gRPC channel usable by the write client
pub trait GbqChannel<TChannelError>:
    tonic::codegen::Service<
        http::Request<tonic::body::BoxBody>,
        Response = http::Response<tonic::transport::Body>,
        Error = TChannelError,
    > + Send
    + Clone
where
    TChannelError: GbqChannelError,
{
}

/// Errors of a [`GbqChannel`]
pub trait GbqChannelError:
    Into<Box<dyn std::error::Error + Send + Sync + 'static>> + Send + Sync
{
}

impl<T> GbqChannelError for T where
    T: Into<Box<dyn std::error::Error + Send + Sync + 'static>> + Send + Sync
{
}
impl<T, TChannelError> GbqChannel<TChannelError> for T
where
    T: tonic::codegen::Service<
            http::Request<tonic::body::BoxBody>,
            Response = http::Response<tonic::transport::Body>,
            Error = TChannelError,
        > + Send
        + Clone,
    TChannelError: GbqChannelError,
{
}

struct Column {
    table_type: TableType,
    tag: u32,
    repeated: bool,

    // ignored if the table_type is not struct
    subfields: HashMap<String, Column>,
}

fn map_field(
    schema_name: &str,
    raw_fields: &[TableFieldSchema],
    table: &TableId,
) -> (DescriptorProto, HashMap<String, Column>) {
    // The capacity for nested_types isn't known here, as it depends on the number of fields that have the struct type
    let mut nested_types = vec![];
    let mut proto_fields = Vec::with_capacity(raw_fields.len());
    let mut fields = HashMap::with_capacity(raw_fields.len());
    let mut tag: u16 = 1;

    for raw_field in raw_fields {
        let mut type_name = None;
        let mut subfields = HashMap::with_capacity(raw_field.fields.len());

        let Some(table_type) = TableType::from_i32(raw_field.r#type) else {
            warn!("[{table}] Found a field of unknown type: {}", raw_field.name);
            continue;
        };
        let repeated = Mode::from_i32(raw_field.mode) == Some(Mode::Repeated);

        let grpc_type = match table_type {
            TableType::Int64 => field_descriptor_proto::Type::Int64,
            TableType::Double => field_descriptor_proto::Type::Double,
            TableType::Bool => field_descriptor_proto::Type::Bool,
            TableType::Bytes => field_descriptor_proto::Type::Bytes,

            TableType::String
            // YYYY-[M]M-[D]D
            | TableType::Date
            // [H]H:[M]M:[S]S[.DDDDDD|.F]
            | TableType::Time
            // YYYY-[M]M-[D]D[( |T)[H]H:[M]M:[S]S[.F]]
            | TableType::Datetime
            // The GEOGRAPHY type is based on the OGC Simple Features specification (SFS)
            | TableType::Geography
            // String, because it has decimal precision, f32/f64 would lose precision
            | TableType::Numeric
            | TableType::Bignumeric
            // [sign]Y-M [sign]D [sign]H:M:S[.F]
            | TableType::Interval
            | TableType::Json
            // YYYY-[M]M-[D]D[( |T)[H]H:[M]M:[S]S[.F]][time zone]
            | TableType::Timestamp => field_descriptor_proto::Type::String,
            TableType::Struct => {
                let type_name_for_field = format!("struct_{}", raw_field.name);
                let mapped = map_field(&type_name_for_field, &raw_field.fields, table);
                nested_types.push(mapped.0);
                subfields = mapped.1;

                type_name = Some(type_name_for_field);
                field_descriptor_proto::Type::Message
            }

            TableType::Unspecified => {
                warn!("[{table}] Found a field of unspecified type: {}", raw_field.name);
                continue;
            }
        };

        let label = if repeated {
            field_descriptor_proto::Label::Repeated
        } else {
            field_descriptor_proto::Label::Optional
        };

        proto_fields.push(FieldDescriptorProto {
            name: Some(raw_field.name.to_string()),
            number: Some(i32::from(tag)),
            label: Some(i32::from(label)),
            r#type: Some(i32::from(grpc_type)),
            type_name,
            extendee: None,
            default_value: None,
            oneof_index: None,
            json_name: None,
            options: None,
            proto3_optional: None,
        });

        fields.insert(
            raw_field.name.to_string(),
            Column {
                table_type,
                tag: u32::from(tag),
                repeated,
                subfields,
            },
        );

        tag += 1;
    }

    (
        DescriptorProto {
            name: Some(schema_name.to_string()),
            field: proto_fields,
            extension: vec![],
            nested_type: nested_types,
            enum_type: vec![],
            extension_range: vec![],
            oneof_decl: vec![],
            options: None,
            reserved_range: vec![],
            reserved_name: vec![],
        },
        fields,
    )
}

fn mismatch(name: &str, column: &Column, value: &FieldValue) -> WriteError {
    WriteError::malformed(format!(
        "field `{name}` of type {:?} can not hold {value:?}",
        column.table_type
    ))
}

fn encode_field(
    name: &str,
    value: &FieldValue,
    column: &Column,
    result: &mut Vec<u8>,
) -> Result<(), WriteError> {
    match value {
        // absent columns are null
        FieldValue::Null => Ok(()),
        FieldValue::Array(values) if column.repeated => {
            for v in values {
                encode_value(name, v, column, result)?;
            }
            Ok(())
        }
        _ if column.repeated => Err(mismatch(name, column, value)),
        _ => encode_value(name, value, column, result),
    }
}

fn encode_value(
    name: &str,
    value: &FieldValue,
    column: &Column,
    result: &mut Vec<u8>,
) -> Result<(), WriteError> {
    let tag = column.tag;

    match (column.table_type, value) {
        (TableType::Double, FieldValue::Float64(f)) => {
            prost::encoding::double::encode(tag, f, result);
        }
        #[allow(clippy::cast_precision_loss)]
        (TableType::Double, FieldValue::Int64(i)) => {
            prost::encoding::double::encode(tag, &(*i as f64), result);
        }
        (TableType::Int64, FieldValue::Int64(i)) => prost::encoding::int64::encode(tag, i, result),
        (TableType::Bool, FieldValue::Bool(b)) => prost::encoding::bool::encode(tag, b, result),
        (
            TableType::String
            | TableType::Date
            | TableType::Time
            | TableType::Datetime
            | TableType::Timestamp
            // String, because it has decimal precision, f32/f64 would lose precision
            | TableType::Numeric
            | TableType::Bignumeric
            | TableType::Geography
            | TableType::Interval
            | TableType::Json,
            FieldValue::String(s),
        ) => prost::encoding::string::encode(tag, s, result),
        (TableType::Numeric | TableType::Bignumeric, FieldValue::Int64(_) | FieldValue::Float64(_))
        | (TableType::Json, _) => {
            prost::encoding::string::encode(tag, &value.to_json().encode(), result);
        }
        (TableType::Struct, FieldValue::Struct(fields)) => {
            let mut struct_buf: Vec<u8> = vec![];
            encode_fields(fields, &column.subfields, &mut struct_buf)?;
            prost::encoding::encode_key(tag, WireType::LengthDelimited, result);
            prost::encoding::encode_varint(struct_buf.len() as u64, result);
            result.append(&mut struct_buf);
        }
        (TableType::Bytes, FieldValue::Bytes(b)) => prost::encoding::bytes::encode(tag, b, result),
        (TableType::Unspecified, _) => {
            warn!("Found a field of unspecified type - ignoring.");
        }
        _ => return Err(mismatch(name, column, value)),
    }

    Ok(())
}

fn encode_fields(
    fields: &[Field],
    columns: &HashMap<String, Column>,
    result: &mut Vec<u8>,
) -> Result<(), WriteError> {
    for field in fields {
        if let Some(column) = columns.get(&field.name) {
            encode_field(&field.name, &field.value, column, result)?;
        } else {
            debug!("Field {} is not present in the table definition", field.name);
        }
    }
    Ok(())
}

/// Maps records onto protobuf rows following the table schema
struct RowMapping {
    columns: HashMap<String, Column>,
    descriptor: DescriptorProto,
}

impl RowMapping {
    fn new(schema: &[TableFieldSchema], table: &TableId) -> Self {
        let (descriptor, columns) = map_field("table", schema, table);
        Self {
            columns,
            descriptor,
        }
    }

    fn map(&self, fields: &[Field]) -> Result<Vec<u8>, WriteError> {
        let mut result = Vec::with_capacity(fields.len());
        encode_fields(fields, &self.columns, &mut result)?;
        Ok(result)
    }

    fn descriptor(&self) -> &DescriptorProto {
        &self.descriptor
    }
}

/// Opens committed write streams through the storage write API
pub struct StorageWriteFactory<
    T: TokenProvider,
    TChannel: GbqChannel<TChannelError>,
    TChannelError: GbqChannelError,
> {
    token_provider: T,
    channel_factory: Box<dyn ChannelFactory<TChannel> + Send + Sync>,
    channel: Mutex<Option<TChannel>>,
    connect_timeout: Duration,
    request_timeout: Duration,
    quota_project: Option<String>,
    _error_phantom: PhantomData<fn() -> TChannelError>,
}

impl<T: TokenProvider, TChannel: GbqChannel<TChannelError>, TChannelError: GbqChannelError>
    StorageWriteFactory<T, TChannel, TChannelError>
{
    /// creates a new factory, no connection is made until the handshake
    pub fn new(
        token_provider: T,
        channel_factory: Box<dyn ChannelFactory<TChannel> + Send + Sync>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            token_provider,
            channel_factory,
            channel: Mutex::new(None),
            connect_timeout,
            request_timeout,
            quota_project: None,
            _error_phantom: PhantomData,
        }
    }

    /// bills quota of every request to `project`
    #[must_use]
    pub fn with_quota_project(mut self, project: impl Into<String>) -> Self {
        self.quota_project = Some(project.into());
        self
    }

    async fn channel(&self) -> Result<TChannel, ClientError> {
        let mut channel = self.channel.lock().await;
        if let Some(channel) = channel.as_ref() {
            return Ok(channel.clone());
        }
        let new_channel = self
            .channel_factory
            .make_channel(self.connect_timeout)
            .await
            .map_err(|e| ClientError::Channel(e.to_string()))?;
        *channel = Some(new_channel.clone());
        Ok(new_channel)
    }
}

#[async_trait::async_trait]
impl<T, TChannel, TChannelError> SessionFactory for StorageWriteFactory<T, TChannel, TChannelError>
where
    T: TokenProvider,
    TChannel: GbqChannel<TChannelError> + 'static,
    TChannel::Future: Send,
    TChannelError: GbqChannelError + 'static,
{
    async fn handshake(&self) -> Result<(), ClientError> {
        info!("Connecting to BigQuery");
        self.channel().await?;
        let mut token_provider = self.token_provider.clone();
        // minting a token blocks
        tokio::task::spawn_blocking(move || token_provider.get_token())
            .await
            .map_err(|e| ClientError::AuthenticationRejected(e.to_string()))?
            .map_err(|s| ClientError::AuthenticationRejected(s.message().to_string()))?;
        Ok(())
    }

    async fn open(&self, table: &TableId) -> Result<Box<dyn WriteSession>, ClientError> {
        let channel = self.channel().await?;
        let mut client = BigQueryWriteClient::with_interceptor(
            channel,
            AuthInterceptor {
                token_provider: self.token_provider.clone(),
                quota_project: self.quota_project.clone(),
            },
        );
        let request = CreateWriteStreamRequest {
            parent: table.path(),
            write_stream: Some(WriteStream {
                // The stream name here will be ignored and a generated value will be set in the response
                name: String::new(),
                r#type: i32::from(write_stream::Type::Committed),
                create_time: None,
                commit_time: None,
                table_schema: None,
            }),
        };
        let stream = match timeout(self.request_timeout, client.create_write_stream(request)).await
        {
            Ok(Ok(response)) => response.into_inner(),
            Ok(Err(status)) if status.code() == Code::Unauthenticated => {
                return Err(ClientError::AuthenticationRejected(
                    status.message().to_string(),
                ))
            }
            Ok(Err(status)) => {
                return Err(ClientError::Connect {
                    table: table.clone(),
                    reason: format!("{:?}: {}", status.code(), status.message()),
                })
            }
            Err(_) => {
                return Err(ClientError::Connect {
                    table: table.clone(),
                    reason: format!(
                        "creating the write stream timed out after {}ms",
                        self.request_timeout.as_millis()
                    ),
                })
            }
        };

        let schema = stream
            .table_schema
            .ok_or_else(|| ClientError::SchemaNotProvided(table.clone()))?;
        let mapping = RowMapping::new(&schema.fields, table);

        Ok(Box::new(StorageWriteSession {
            table: table.clone(),
            client,
            stream: stream.name,
            mapping,
            request_timeout: self.request_timeout,
            _error_phantom: PhantomData::<fn() -> TChannelError>,
        }))
    }
}

struct StorageWriteSession<T: TokenProvider, TChannel, TChannelError> {
    table: TableId,
    client: BigQueryWriteClient<InterceptedService<TChannel, AuthInterceptor<T>>>,
    stream: String,
    mapping: RowMapping,
    request_timeout: Duration,
    _error_phantom: PhantomData<fn() -> TChannelError>,
}

impl<T, TChannel, TChannelError> StorageWriteSession<T, TChannel, TChannelError>
where
    T: TokenProvider,
    TChannel: GbqChannel<TChannelError> + 'static,
    TChannel::Future: Send,
    TChannelError: GbqChannelError + 'static,
{
    fn request(&self, rows: &[Vec<u8>]) -> AppendRowsRequest {
        AppendRowsRequest {
            write_stream: self.stream.clone(),
            offset: None,
            rows: Some(append_rows_request::Rows::ProtoRows(ProtoData {
                writer_schema: Some(ProtoSchema {
                    proto_descriptor: Some(self.mapping.descriptor().clone()),
                }),
                rows: Some(ProtoRows {
                    serialized_rows: rows.to_vec(),
                }),
            })),
            trace_id: String::new(),
        }
    }

    fn update_schema(&mut self, fields: &[TableFieldSchema]) {
        let description = fields
            .iter()
            .map(|f| {
                let kind = table_field_schema::Type::from_i32(f.r#type)
                    .map_or_else(|| "unknown".to_string(), |t| format!("{t:?}"));
                format!("{}: {kind}", f.name)
            })
            .collect::<Vec<_>>()
            .join(", ");
        info!("[{}] GBQ Schema was updated: {description}", self.table);
        self.mapping = RowMapping::new(fields, &self.table);
    }
}

#[async_trait::async_trait]
impl<T, TChannel, TChannelError> WriteSession for StorageWriteSession<T, TChannel, TChannelError>
where
    T: TokenProvider,
    TChannel: GbqChannel<TChannelError> + 'static,
    TChannel::Future: Send,
    TChannelError: GbqChannelError + 'static,
{
    fn encode(&self, record: &Record) -> Result<Vec<u8>, WriteError> {
        self.mapping.map(record.fields())
    }

    async fn append(&mut self, rows: &[Vec<u8>]) -> Result<AckToken, WriteError> {
        let request = self.request(rows);
        let req_timeout = self.request_timeout;
        let Ok(append_response) = timeout(
            req_timeout,
            self.client.append_rows(stream::iter(vec![request])),
        )
        .await
        else {
            return Err(WriteError::transport(format!(
                "GBQ request timed out after {}ms",
                req_timeout.as_millis()
            )));
        };
        let mut responses = append_response?.into_inner();

        let Ok(response) = timeout(req_timeout, responses.next()).await else {
            return Err(WriteError::transport(format!(
                "Receiving GBQ response timed out after {}ms",
                req_timeout.as_millis()
            )));
        };
        match response {
            Some(Ok(res)) => {
                if let Some(updated_schema) = res.updated_schema.as_ref() {
                    self.update_schema(&updated_schema.fields);
                }
                match res.response {
                    Some(Response::AppendResult(AppendResult { offset })) => Ok(AckToken {
                        stream: self.stream.clone(),
                        offset,
                        rows: rows.len(),
                    }),
                    Some(Response::Error(e)) => {
                        Err(classify_grpc(Code::from_i32(e.code), &e.message))
                    }
                    None => Err(WriteError::transport("GBQ response carried no result")),
                }
            }
            Some(Err(status)) => Err(WriteError::from(status)),
            None => Err(WriteError::transport("GBQ response stream closed")),
        }
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        let request = FinalizeWriteStreamRequest {
            name: self.stream.clone(),
        };
        match timeout(self.request_timeout, self.client.finalize_write_stream(request)).await {
            Ok(Ok(response)) => {
                debug!(
                    "[{}] Write stream finalized with {} rows",
                    self.table,
                    response.into_inner().row_count
                );
                Ok(())
            }
            Ok(Err(status)) => Err(ClientError::Close {
                table: self.table.clone(),
                reason: format!("{:?}: {}", status.code(), status.message()),
            }),
            Err(_) => Err(ClientError::Close {
                table: self.table.clone(),
                reason: "finalizing the write stream timed out".to_string(),
            }),
        }
    }
}
