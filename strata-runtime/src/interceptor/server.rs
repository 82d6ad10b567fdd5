//! Terminal stage: serializes the request and hands it to the transport.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use strata_core::{FetchSource, StrataError, StrataResult, Variables};

use super::{EventSink, Interceptor, InterceptorChain, InterceptorRequest, InterceptorResponse};
use crate::transport::{NetworkTransport, TransportRequest};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestBody<'a> {
    operation_name: &'a str,
    variables: Variables,
    #[serde(skip_serializing_if = "Option::is_none")]
    query: Option<&'a str>,
    extensions: Extensions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Extensions {
    persisted_query: PersistedQuery,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PersistedQuery {
    version: u8,
    sha256_hash: String,
}

/// Serialize a request as the JSON body the server expects.
pub fn serialize_request(request: &InterceptorRequest) -> StrataResult<Vec<u8>> {
    let operation = request.operation.as_ref();
    let body = RequestBody {
        operation_name: operation.name(),
        variables: operation.variables(),
        query: request.send_query_document.then(|| operation.document()),
        extensions: Extensions {
            persisted_query: PersistedQuery {
                version: 1,
                sha256_hash: operation.operation_id(),
            },
        },
    };
    serde_json::to_vec(&body)
        .map_err(|e| StrataError::parse(format!("failed to encode request: {e}")))
}

pub struct ServerInterceptor {
    transport: Arc<dyn NetworkTransport>,
}

impl ServerInterceptor {
    pub fn new(transport: Arc<dyn NetworkTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Interceptor for ServerInterceptor {
    async fn intercept(&self, request: InterceptorRequest, _chain: InterceptorChain, sink: EventSink) {
        sink.on_fetch(FetchSource::Network);
        let body = match serialize_request(&request) {
            Ok(body) => body,
            Err(error) => {
                sink.on_failure(error);
                return;
            }
        };
        let transport_request = TransportRequest {
            operation_name: request.operation.name().to_string(),
            body,
            headers: request.request_headers.clone(),
        };
        match self.transport.execute(transport_request).await {
            Ok(bytes) => {
                sink.on_response(InterceptorResponse::from_network(bytes));
                sink.on_completed();
            }
            Err(error) => {
                tracing::debug!(
                    operation = request.operation.name(),
                    error = %error,
                    "transport failed"
                );
                sink.on_failure(error.into());
            }
        }
    }
}
