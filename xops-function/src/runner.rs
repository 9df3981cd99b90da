//! Invoking functions over gRPC.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use prost::Message as _;
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tonic::transport::{Channel, Endpoint};

use crate::proto::function_runner_service_client::FunctionRunnerServiceClient;
use crate::proto::{RequestMeta, RunFunctionRequest, RunFunctionResponse};

/// Ways running a function can fail.
///
/// Any gRPC error is fatal to the step that made the call; retries happen at
/// the operation level, not here.
#[derive(Debug, Error)]
pub enum Error {
    /// The function name does not resolve to an endpoint.
    #[error("no endpoint known for function {0:?}")]
    UnknownFunction(String),
    /// The resolved endpoint is not a valid gRPC target.
    #[error("invalid endpoint {endpoint:?} for function {function:?}")]
    InvalidEndpoint {
        /// The function whose endpoint was rejected.
        function: String,
        /// The rejected endpoint.
        endpoint: String,
        /// Why it was rejected.
        #[source]
        source: tonic::transport::Error,
    },
    /// The function returned a gRPC error.
    #[error("function {0:?} returned a gRPC error")]
    RunFunction(String, #[source] tonic::Status),
}

/// Something that can run a named function once.
///
/// Implemented by the gRPC transport and by decorators such as the response
/// cache, which wrap another runner.
#[async_trait]
pub trait FunctionRunner: Send + Sync {
    /// Run the named function and return its response.
    async fn run_function(
        &self,
        function: &str,
        req: RunFunctionRequest,
    ) -> Result<RunFunctionResponse, Error>;
}

/// Resolves a function name to a gRPC target such as `http://10.0.0.7:9443`.
///
/// How endpoints are discovered (package manager, DNS, static config) is not
/// this crate's concern.
pub trait FunctionLocator: Send + Sync {
    /// The gRPC target for the named function, if known.
    fn resolve(&self, function: &str) -> Option<String>;
}

/// A locator backed by a fixed name to endpoint map.
#[derive(Clone, Debug, Default)]
pub struct StaticFunctionLocator {
    endpoints: BTreeMap<String, String>,
}

impl StaticFunctionLocator {
    /// A locator serving the given name to endpoint pairs.
    pub fn new<I, K, V>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            endpoints: endpoints
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl FunctionLocator for StaticFunctionLocator {
    fn resolve(&self, function: &str) -> Option<String> {
        self.endpoints.get(function).cloned()
    }
}

/// Runs functions over plaintext gRPC channels, one channel per function.
///
/// Channels are created lazily and reused across calls.
pub struct GrpcFunctionRunner<L> {
    locator: L,
    channels: Mutex<HashMap<String, Channel>>,
}

impl<L: FunctionLocator> GrpcFunctionRunner<L> {
    /// A runner resolving endpoints through the given locator.
    pub fn new(locator: L) -> Self {
        Self {
            locator,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channel_for(&self, function: &str) -> Result<Channel, Error> {
        if let Some(channel) = self.channels.lock().get(function) {
            return Ok(channel.clone());
        }
        let endpoint = self
            .locator
            .resolve(function)
            .ok_or_else(|| Error::UnknownFunction(function.to_string()))?;
        let channel = Endpoint::from_shared(endpoint.clone())
            .map_err(|source| Error::InvalidEndpoint {
                function: function.to_string(),
                endpoint,
                source,
            })?
            .connect_lazy();
        self.channels
            .lock()
            .insert(function.to_string(), channel.clone());
        Ok(channel)
    }
}

#[async_trait]
impl<L: FunctionLocator> FunctionRunner for GrpcFunctionRunner<L> {
    async fn run_function(
        &self,
        function: &str,
        req: RunFunctionRequest,
    ) -> Result<RunFunctionResponse, Error> {
        let channel = self.channel_for(function)?;
        let mut client = FunctionRunnerServiceClient::new(channel);
        let rsp = client
            .run_function(req)
            .await
            .map_err(|status| Error::RunFunction(function.to_string(), status))?;
        Ok(rsp.into_inner())
    }
}

/// Compute the content tag of a request.
///
/// The tag is the hex encoded SHA-256 of the request's deterministic proto
/// encoding with `meta` cleared, so a request hashes the same regardless of
/// any tag already set on it.
pub fn request_tag(req: &RunFunctionRequest) -> String {
    let mut untagged = req.clone();
    untagged.meta = None;
    hex::encode(Sha256::digest(untagged.encode_to_vec()))
}

/// Set `req.meta.tag` to the request's content tag.
pub fn tag_request(req: &mut RunFunctionRequest) {
    let tag = request_tag(req);
    req.meta.get_or_insert_with(RequestMeta::default).tag = tag;
}
