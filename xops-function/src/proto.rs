//! Wire types for the `RunFunction` and `PipelineInspector` gRPC protocols.
//!
//! These are hand-maintained prost messages rather than `build.rs` output so
//! the crate builds without a protoc toolchain. The clients at the bottom
//! mirror what `tonic-build` would emit for the same services. Map fields
//! use `BTreeMap` so that encoding a message is deterministic, which the
//! request tag computation relies on.

use std::collections::BTreeMap;

/// Metadata sent with every [`RunFunctionRequest`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestMeta {
    /// Content hash of the request body, excluding this meta. Used as the
    /// response cache key. Empty means the request is not cacheable.
    #[prost(string, tag = "1")]
    pub tag: String,
}

/// Metadata returned with every [`RunFunctionResponse`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseMeta {
    /// The tag of the request this response answers.
    #[prost(string, tag = "1")]
    pub tag: String,
    /// How long the response may be served from cache. Unset or zero means
    /// the response must not be cached.
    #[prost(message, optional, tag = "2")]
    pub ttl: Option<::prost_types::Duration>,
}

/// The observed or desired state carried across a pipeline.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct State {
    /// The resource the pipeline was triggered by, if any.
    #[prost(message, optional, tag = "1")]
    pub composite: Option<Resource>,
    /// Named resources composed by the pipeline.
    #[prost(btree_map = "string, message", tag = "2")]
    pub resources: BTreeMap<String, Resource>,
}

/// A single resource and its connection details.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Resource {
    /// The resource body.
    #[prost(message, optional, tag = "1")]
    pub resource: Option<::prost_types::Struct>,
    /// Sensitive connection details associated with the resource.
    #[prost(btree_map = "string, bytes", tag = "2")]
    pub connection_details: BTreeMap<String, Vec<u8>>,
    /// Whether the resource is ready.
    #[prost(enumeration = "Ready", tag = "3")]
    pub ready: i32,
}

/// Readiness of a [`Resource`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Ready {
    /// Readiness is unknown.
    Unspecified = 0,
    /// The resource is ready.
    True = 1,
    /// The resource is not ready.
    False = 2,
}

/// Credentials a step supplies to its function.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Credentials {
    /// Where the credentials come from.
    #[prost(oneof = "credentials::Source", tags = "1")]
    pub source: Option<credentials::Source>,
}

/// Nested types for [`Credentials`].
pub mod credentials {
    /// Sources of credentials.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Source {
        /// Raw credential data.
        #[prost(message, tag = "1")]
        CredentialData(super::CredentialData),
    }
}

/// Raw credential data, keyed like a Kubernetes secret.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CredentialData {
    /// The credential bytes, by key.
    #[prost(btree_map = "string, bytes", tag = "1")]
    pub data: BTreeMap<String, Vec<u8>>,
}

/// A set of resources satisfying one requirement.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Resources {
    /// The matching resources.
    #[prost(message, repeated, tag = "1")]
    pub items: Vec<Resource>,
}

/// Resources a function wants fetched before its next invocation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Requirements {
    /// Selectors by requirement name.
    #[prost(btree_map = "string, message", tag = "1")]
    pub resources: BTreeMap<String, ResourceSelector>,
}

/// Selects resources by name or by labels.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResourceSelector {
    /// The apiVersion of the resources to select.
    #[prost(string, tag = "1")]
    pub api_version: String,
    /// The kind of the resources to select.
    #[prost(string, tag = "2")]
    pub kind: String,
    /// How to match resources.
    #[prost(oneof = "resource_selector::Match", tags = "3, 4")]
    pub r#match: Option<resource_selector::Match>,
    /// Restrict the selection to one namespace.
    #[prost(string, optional, tag = "5")]
    pub namespace: Option<String>,
}

/// Nested types for [`ResourceSelector`].
pub mod resource_selector {
    /// Ways to match resources.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Match {
        /// Match a single resource by name.
        #[prost(string, tag = "3")]
        MatchName(String),
        /// Match resources by labels.
        #[prost(message, tag = "4")]
        MatchLabels(super::MatchLabels),
    }
}

/// A label selector.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MatchLabels {
    /// Labels the resources must carry.
    #[prost(btree_map = "string, string", tag = "1")]
    pub labels: BTreeMap<String, String>,
}

/// A request to run a function once.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunFunctionRequest {
    /// Request metadata.
    #[prost(message, optional, tag = "1")]
    pub meta: Option<RequestMeta>,
    /// The observed state of the pipeline.
    #[prost(message, optional, tag = "2")]
    pub observed: Option<State>,
    /// The desired state accumulated by earlier steps.
    #[prost(message, optional, tag = "3")]
    pub desired: Option<State>,
    /// The step's opaque input.
    #[prost(message, optional, tag = "4")]
    pub input: Option<::prost_types::Struct>,
    /// Cross-step context. Later steps see what earlier steps wrote.
    #[prost(message, optional, tag = "5")]
    pub context: Option<::prost_types::Struct>,
    /// Hydrated credentials, by credential name.
    #[prost(btree_map = "string, message", tag = "6")]
    pub credentials: BTreeMap<String, Credentials>,
    /// Resources fetched to satisfy the step's requirements, by requirement
    /// name.
    #[prost(btree_map = "string, message", tag = "7")]
    pub required_resources: BTreeMap<String, Resources>,
}

/// A function's answer to a [`RunFunctionRequest`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunFunctionResponse {
    /// Response metadata.
    #[prost(message, optional, tag = "1")]
    pub meta: Option<ResponseMeta>,
    /// The updated desired state.
    #[prost(message, optional, tag = "2")]
    pub desired: Option<State>,
    /// Results the function wants recorded.
    #[prost(message, repeated, tag = "3")]
    pub results: Vec<FunctionResult>,
    /// Context updates, merged over the pipeline's context.
    #[prost(message, optional, tag = "4")]
    pub context: Option<::prost_types::Struct>,
    /// Resources the function wants fetched before it runs again.
    #[prost(message, optional, tag = "5")]
    pub requirements: Option<Requirements>,
}

/// One result entry returned by a function.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FunctionResult {
    /// How severe the result is.
    #[prost(enumeration = "Severity", tag = "1")]
    pub severity: i32,
    /// Human readable detail.
    #[prost(string, tag = "2")]
    pub message: String,
    /// Machine readable, PascalCase word summarizing the result.
    #[prost(string, tag = "3")]
    pub reason: String,
}

/// Severity of a [`FunctionResult`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Severity {
    /// Not set. Treated like normal.
    Unspecified = 0,
    /// The attempt failed; no further steps run.
    Fatal = 1,
    /// Something is off, but the attempt continues.
    Warning = 2,
    /// Purely informational.
    Normal = 3,
}

impl Severity {
    /// The protobuf JSON name of the severity.
    pub fn as_str_name(&self) -> &'static str {
        match self {
            Severity::Unspecified => "SEVERITY_UNSPECIFIED",
            Severity::Fatal => "SEVERITY_FATAL",
            Severity::Warning => "SEVERITY_WARNING",
            Severity::Normal => "SEVERITY_NORMAL",
        }
    }
}

impl Ready {
    /// The protobuf JSON name of the readiness.
    pub fn as_str_name(&self) -> &'static str {
        match self {
            Ready::Unspecified => "READY_UNSPECIFIED",
            Ready::True => "READY_TRUE",
            Ready::False => "READY_FALSE",
        }
    }
}

/// What the response cache persists for one request tag.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CachedRunFunctionResponse {
    /// Absolute expiry of the entry. The entry is a miss at or after this
    /// instant.
    #[prost(message, optional, tag = "1")]
    pub deadline: Option<::prost_types::Timestamp>,
    /// The cached response.
    #[prost(message, optional, tag = "2")]
    pub response: Option<RunFunctionResponse>,
}

/// Identifies which pipeline step an inspector payload belongs to.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StepMeta {
    /// Name of the invoked function.
    #[prost(string, tag = "1")]
    pub function_name: String,
    /// Name of the pipeline step.
    #[prost(string, tag = "2")]
    pub step_name: String,
    /// Name of the operation (or composite) being reconciled.
    #[prost(string, tag = "3")]
    pub operation: String,
    /// When the step ran.
    #[prost(message, optional, tag = "4")]
    pub wall_time: Option<::prost_types::Timestamp>,
}

/// Carries a redacted, JSON-encoded request to the inspector.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EmitRequestRequest {
    /// Which step the request belongs to.
    #[prost(message, optional, tag = "1")]
    pub meta: Option<StepMeta>,
    /// Protobuf JSON encoding of the redacted request.
    #[prost(bytes = "vec", tag = "2")]
    pub request: Vec<u8>,
}

/// The inspector's (empty) answer to an emitted request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EmitRequestResponse {}

/// Carries a redacted, JSON-encoded response to the inspector.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EmitResponseRequest {
    /// Which step the response belongs to.
    #[prost(message, optional, tag = "1")]
    pub meta: Option<StepMeta>,
    /// Protobuf JSON encoding of the redacted response. Empty when the
    /// function call failed.
    #[prost(bytes = "vec", tag = "2")]
    pub response: Vec<u8>,
    /// The error the function call failed with, if it did.
    #[prost(string, optional, tag = "3")]
    pub error: Option<String>,
}

/// The inspector's (empty) answer to an emitted response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EmitResponseResponse {}

/// Client for the `apiextensions.fn.proto.v1.FunctionRunnerService` service.
pub mod function_runner_service_client {
    #![allow(unused_variables, dead_code, missing_docs, clippy::wildcard_imports)]
    use tonic::codegen::http::Uri;
    use tonic::codegen::*;

    /// A unary client for running functions.
    #[derive(Debug, Clone)]
    pub struct FunctionRunnerServiceClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl FunctionRunnerServiceClient<tonic::transport::Channel> {
        /// Attempt to create a new client by connecting to a given endpoint.
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }

    impl<T> FunctionRunnerServiceClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }

        pub fn with_origin(inner: T, origin: Uri) -> Self {
            let inner = tonic::client::Grpc::with_origin(inner, origin);
            Self { inner }
        }

        /// Run a function once and return its response.
        pub async fn run_function(
            &mut self,
            request: impl tonic::IntoRequest<super::RunFunctionRequest>,
        ) -> std::result::Result<tonic::Response<super::RunFunctionResponse>, tonic::Status>
        {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/apiextensions.fn.proto.v1.FunctionRunnerService/RunFunction",
            );
            let mut req = request.into_request();
            req.extensions_mut().insert(GrpcMethod::new(
                "apiextensions.fn.proto.v1.FunctionRunnerService",
                "RunFunction",
            ));
            self.inner.unary(req, path, codec).await
        }
    }
}

/// Server glue for the `ops.inspector.v1.PipelineInspector` service, for
/// sidecar implementations and tests.
pub mod pipeline_inspector_server {
    #![allow(unused_variables, dead_code, missing_docs, clippy::wildcard_imports)]
    use tonic::codegen::*;

    /// What a pipeline inspector sidecar implements.
    #[async_trait]
    pub trait PipelineInspector: std::marker::Send + std::marker::Sync + 'static {
        /// Receive a redacted request about to be sent to a function.
        async fn emit_request(
            &self,
            request: tonic::Request<super::EmitRequestRequest>,
        ) -> std::result::Result<tonic::Response<super::EmitRequestResponse>, tonic::Status>;

        /// Receive a redacted response received from a function.
        async fn emit_response(
            &self,
            request: tonic::Request<super::EmitResponseRequest>,
        ) -> std::result::Result<tonic::Response<super::EmitResponseResponse>, tonic::Status>;
    }

    /// A tonic service serving a [`PipelineInspector`] implementation.
    #[derive(Debug)]
    pub struct PipelineInspectorServer<T> {
        inner: Arc<T>,
        accept_compression_encodings: EnabledCompressionEncodings,
        send_compression_encodings: EnabledCompressionEncodings,
        max_decoding_message_size: Option<usize>,
        max_encoding_message_size: Option<usize>,
    }

    impl<T> PipelineInspectorServer<T> {
        pub fn new(inner: T) -> Self {
            Self::from_arc(Arc::new(inner))
        }

        pub fn from_arc(inner: Arc<T>) -> Self {
            Self {
                inner,
                accept_compression_encodings: Default::default(),
                send_compression_encodings: Default::default(),
                max_decoding_message_size: None,
                max_encoding_message_size: None,
            }
        }
    }

    impl<T, B> tonic::codegen::Service<http::Request<B>> for PipelineInspectorServer<T>
    where
        T: PipelineInspector,
        B: Body + std::marker::Send + 'static,
        B::Error: Into<StdError> + std::marker::Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = std::convert::Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(
            &mut self,
            _cx: &mut Context<'_>,
        ) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            match req.uri().path() {
                "/ops.inspector.v1.PipelineInspector/EmitRequest" => {
                    #[allow(non_camel_case_types)]
                    struct EmitRequestSvc<T: PipelineInspector>(pub Arc<T>);
                    impl<T: PipelineInspector>
                        tonic::server::UnaryService<super::EmitRequestRequest>
                        for EmitRequestSvc<T>
                    {
                        type Response = super::EmitRequestResponse;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::EmitRequestRequest>,
                        ) -> Self::Future {
                            let inner = Arc::clone(&self.0);
                            let fut = async move {
                                <T as PipelineInspector>::emit_request(&inner, request).await
                            };
                            Box::pin(fut)
                        }
                    }
                    let accept_compression_encodings = self.accept_compression_encodings;
                    let send_compression_encodings = self.send_compression_encodings;
                    let max_decoding_message_size = self.max_decoding_message_size;
                    let max_encoding_message_size = self.max_encoding_message_size;
                    let inner = self.inner.clone();
                    let fut = async move {
                        let method = EmitRequestSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec)
                            .apply_compression_config(
                                accept_compression_encodings,
                                send_compression_encodings,
                            )
                            .apply_max_message_size_config(
                                max_decoding_message_size,
                                max_encoding_message_size,
                            );
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                "/ops.inspector.v1.PipelineInspector/EmitResponse" => {
                    #[allow(non_camel_case_types)]
                    struct EmitResponseSvc<T: PipelineInspector>(pub Arc<T>);
                    impl<T: PipelineInspector>
                        tonic::server::UnaryService<super::EmitResponseRequest>
                        for EmitResponseSvc<T>
                    {
                        type Response = super::EmitResponseResponse;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::EmitResponseRequest>,
                        ) -> Self::Future {
                            let inner = Arc::clone(&self.0);
                            let fut = async move {
                                <T as PipelineInspector>::emit_response(&inner, request).await
                            };
                            Box::pin(fut)
                        }
                    }
                    let accept_compression_encodings = self.accept_compression_encodings;
                    let send_compression_encodings = self.send_compression_encodings;
                    let max_decoding_message_size = self.max_decoding_message_size;
                    let max_encoding_message_size = self.max_encoding_message_size;
                    let inner = self.inner.clone();
                    let fut = async move {
                        let method = EmitResponseSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec)
                            .apply_compression_config(
                                accept_compression_encodings,
                                send_compression_encodings,
                            )
                            .apply_max_message_size_config(
                                max_decoding_message_size,
                                max_encoding_message_size,
                            );
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                _ => Box::pin(async move {
                    Ok(http::Response::builder()
                        .status(200)
                        .header("grpc-status", tonic::Code::Unimplemented as i32)
                        .header(
                            http::header::CONTENT_TYPE,
                            tonic::metadata::GRPC_CONTENT_TYPE,
                        )
                        .body(empty_body())
                        .unwrap())
                }),
            }
        }
    }

    impl<T> Clone for PipelineInspectorServer<T> {
        fn clone(&self) -> Self {
            let inner = self.inner.clone();
            Self {
                inner,
                accept_compression_encodings: self.accept_compression_encodings,
                send_compression_encodings: self.send_compression_encodings,
                max_decoding_message_size: self.max_decoding_message_size,
                max_encoding_message_size: self.max_encoding_message_size,
            }
        }
    }

    /// The fully qualified gRPC service name.
    pub const SERVICE_NAME: &str = "ops.inspector.v1.PipelineInspector";

    impl<T> tonic::server::NamedService for PipelineInspectorServer<T> {
        const NAME: &'static str = SERVICE_NAME;
    }
}

/// Client for the `ops.inspector.v1.PipelineInspector` service.
pub mod pipeline_inspector_client {
    #![allow(unused_variables, dead_code, missing_docs, clippy::wildcard_imports)]
    use tonic::codegen::http::Uri;
    use tonic::codegen::*;

    /// A unary client for shipping redacted pipeline payloads to a sidecar.
    #[derive(Debug, Clone)]
    pub struct PipelineInspectorClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl PipelineInspectorClient<tonic::transport::Channel> {
        /// Attempt to create a new client by connecting to a given endpoint.
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }

    impl<T> PipelineInspectorClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }

        pub fn with_origin(inner: T, origin: Uri) -> Self {
            let inner = tonic::client::Grpc::with_origin(inner, origin);
            Self { inner }
        }

        /// Emit a redacted copy of a request about to be sent to a function.
        pub async fn emit_request(
            &mut self,
            request: impl tonic::IntoRequest<super::EmitRequestRequest>,
        ) -> std::result::Result<tonic::Response<super::EmitRequestResponse>, tonic::Status>
        {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/ops.inspector.v1.PipelineInspector/EmitRequest",
            );
            let mut req = request.into_request();
            req.extensions_mut().insert(GrpcMethod::new(
                "ops.inspector.v1.PipelineInspector",
                "EmitRequest",
            ));
            self.inner.unary(req, path, codec).await
        }

        /// Emit a redacted copy of a response received from a function.
        pub async fn emit_response(
            &mut self,
            request: impl tonic::IntoRequest<super::EmitResponseRequest>,
        ) -> std::result::Result<tonic::Response<super::EmitResponseResponse>, tonic::Status>
        {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/ops.inspector.v1.PipelineInspector/EmitResponse",
            );
            let mut req = request.into_request();
            req.extensions_mut().insert(GrpcMethod::new(
                "ops.inspector.v1.PipelineInspector",
                "EmitResponse",
            ));
            self.inner.unary(req, path, codec).await
        }
    }
}
