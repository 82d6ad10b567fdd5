//! Decodes raw transport bodies into data, errors and normalized records.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use strata_core::{GraphQlError, OperationDescriptor, StrataError, StrataResult};
use strata_storage::Store;

use super::{EventSink, Interceptor, InterceptorChain, InterceptorEvent, InterceptorRequest, InterceptorResponse};

/// Top level of a server response body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Option<Vec<GraphQlError>>,
    #[serde(default)]
    pub extensions: Option<Map<String, Value>>,
}

pub struct ParseInterceptor {
    store: Arc<dyn Store>,
}

impl ParseInterceptor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn parse(
        &self,
        operation: &dyn OperationDescriptor,
        mut response: InterceptorResponse,
    ) -> StrataResult<InterceptorResponse> {
        let Some(raw) = response.raw.as_ref() else {
            return Ok(response);
        };
        let envelope: ResponseEnvelope = serde_json::from_slice(&raw.body).map_err(|e| {
            StrataError::parse(format!("failed to parse response of {}: {e}", operation.name()))
        })?;

        let data = envelope.data.filter(|data| !data.is_null());
        let normalized = match &data {
            Some(data) => self.store.normalizer().normalize_operation(operation, data)?,
            None => Default::default(),
        };

        response.data = data;
        response.errors = envelope.errors.unwrap_or_default();
        response.extensions = envelope.extensions.unwrap_or_default();
        response.dependent_keys = normalized.dependent_keys;
        response.records = Some(normalized.records);
        Ok(response)
    }
}

#[async_trait]
impl Interceptor for ParseInterceptor {
    async fn intercept(&self, request: InterceptorRequest, chain: InterceptorChain, sink: EventSink) {
        let mut upstream = chain.proceed(request.clone());
        while let Some(event) = upstream.next().await {
            match event {
                InterceptorEvent::Response(response) => {
                    match self.parse(request.operation.as_ref(), *response) {
                        Ok(parsed) => sink.on_response(parsed),
                        Err(error) => {
                            tracing::debug!(
                                operation = request.operation.name(),
                                error = %error,
                                "failed to parse network response"
                            );
                            sink.on_failure(error);
                            return;
                        }
                    }
                }
                terminal @ (InterceptorEvent::Failure(_) | InterceptorEvent::Completed) => {
                    sink.forward(terminal);
                    return;
                }
                InterceptorEvent::Fetch(source) => sink.on_fetch(source),
            }
        }
    }
}
