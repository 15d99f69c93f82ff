//! Off-chain API calls.
//!
//! The coordinator does not speak to third-party APIs itself. It forwards each resolved call to
//! an adapter service over HTTP and gets back the status code and ABI-encoded payload to put on
//! chain.

use alloy::primitives::{B256, Bytes, U256};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::Instrument;
use url::Url;

use crate::chain::{CoordinatorError, RrpProvider};
use crate::config::AdapterConfig;
use crate::state::ProviderState;
use crate::types::{ApiResponse, Request, RequestError, RequestStatus};

/// Body posted to the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterRequest {
    pub request_id: B256,
    pub chain_id: u64,
    pub provider_id: B256,
    pub endpoint_id: B256,
    pub parameters: Bytes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_parameters: Option<Bytes>,
}

impl AdapterRequest {
    /// `None` for withdrawals and for calls whose endpoint is not resolved.
    pub fn from_request(request: &Request, chain_id: u64, provider_id: B256) -> Option<Self> {
        let call = request.api_call()?;
        Some(Self {
            request_id: request.id,
            chain_id,
            provider_id,
            endpoint_id: request.endpoint_id()?,
            parameters: call.parameters.clone(),
            template_parameters: call.template_parameters.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdapterResponse {
    status_code: u64,
    data: Bytes,
}

#[async_trait]
pub trait ApiCaller: Send + Sync {
    async fn call(&self, request: &AdapterRequest) -> Result<ApiResponse, CoordinatorError>;
}

/// [`ApiCaller`] posting JSON to the configured adapter URL.
#[derive(Debug, Clone)]
pub struct HttpApiCaller {
    client: reqwest::Client,
    url: Url,
}

impl HttpApiCaller {
    pub fn try_new(config: &AdapterConfig) -> Result<Self, CoordinatorError> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| CoordinatorError::Config("adapter.url is not set".to_string()))?;
        Self::with_timeout(url, config.timeout())
    }

    pub fn with_timeout(url: Url, timeout: Duration) -> Result<Self, CoordinatorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoordinatorError::Config(format!("failed to build adapter HTTP client: {e}")))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl ApiCaller for HttpApiCaller {
    async fn call(&self, request: &AdapterRequest) -> Result<ApiResponse, CoordinatorError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(request)
            .send()
            .await
            .map_err(|e| CoordinatorError::ApiCall(format!("adapter unreachable: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoordinatorError::ApiCall(format!("adapter returned {status}: {body}")));
        }
        let body: AdapterResponse = response
            .json()
            .await
            .map_err(|e| CoordinatorError::Decoding(format!("adapter response: {e}")))?;
        Ok(ApiResponse {
            status_code: U256::from(body.status_code),
            data: body.data,
        })
    }
}

/// Performs the API call of every authorized request that has no response yet.
///
/// Calls run concurrently. A failed call leaves the request authorized with an
/// [`RequestError::ApiCallFailed`] marker, so that a `fail` transaction settles it.
pub async fn call_apis<P: RrpProvider>(
    state: &ProviderState<P>,
    api: &dyn ApiCaller,
) -> Vec<Request> {
    let chain_id = state.settings.chain_id;
    let provider_id = state.settings.provider_id;
    let calls = state.requests.iter().map(|request| async move {
        let pending = request.status == RequestStatus::Authorized
            && request.api_call().is_some_and(|c| c.response.is_none())
            && !request.has_api_error();
        if !pending {
            return request.clone();
        }
        let Some(body) = AdapterRequest::from_request(request, chain_id, provider_id) else {
            return request.clone();
        };
        match api
            .call(&body)
            .instrument(tracing::info_span!("api_call", request_id = %request.id, endpoint_id = %body.endpoint_id))
            .await
        {
            Ok(response) => {
                tracing::info!(request_id = %request.id, status_code = %response.status_code, "API call succeeded");
                request.with_response(response)
            }
            Err(e) => {
                tracing::warn!(request_id = %request.id, error = %e, "API call failed");
                request.with_error(RequestStatus::Authorized, RequestError::ApiCallFailed(e.to_string()))
            }
        }
    });
    join_all(calls).await
}
