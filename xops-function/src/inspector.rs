//! Ships redacted request/response pairs to a pipeline inspector sidecar.
//!
//! The inspector listens on a local Unix socket; emits are bounded by a
//! short deadline and never fail the pipeline step they describe. Payloads
//! are sanitized before they leave the process: credential data, connection
//! details, and Kubernetes `Secret` data all become [`REDACTED`].

use std::path::Path;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use prost_types::value::Kind;
use prost_types::Struct;
use thiserror::Error;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};

use crate::json::{request_to_json, response_to_json};
use crate::proto::pipeline_inspector_client::PipelineInspectorClient;
use crate::proto::{
    credentials, EmitRequestRequest, EmitResponseRequest, Resource, RunFunctionRequest,
    RunFunctionResponse, State, StepMeta,
};
use crate::runner;

/// What redacted values are replaced with.
pub const REDACTED: &str = "**REDACTED**";

/// How long an emit may take before it is abandoned.
pub const DEFAULT_EMIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Ways shipping a payload to the inspector can fail.
///
/// None of these abort the step being inspected; callers log and continue.
#[derive(Debug, Error)]
pub enum EmitError {
    /// The socket address could not be used.
    #[error("cannot reach the inspector socket")]
    Connect(#[source] tonic::transport::Error),
    /// The payload could not be encoded.
    #[error("cannot encode the inspector payload")]
    Encode(#[source] serde_json::Error),
    /// The inspector rejected the emit.
    #[error("the inspector rejected the emit")]
    Emit(#[source] tonic::Status),
    /// The inspector did not answer in time.
    #[error("emit timed out after {0:?}")]
    Timeout(Duration),
}

/// Emits redacted pipeline payloads to a local inspector sidecar.
#[derive(Clone)]
pub struct InspectorEmitter {
    channel: Channel,
    timeout: Duration,
}

impl InspectorEmitter {
    /// An emitter talking plaintext gRPC over the given Unix socket.
    ///
    /// The channel connects lazily; a missing sidecar surfaces as emit
    /// errors, not as a construction failure.
    pub fn unix(socket: impl AsRef<Path>) -> Result<Self, EmitError> {
        let socket = socket.as_ref().to_path_buf();
        // The endpoint URI is never dialed; the connector ignores it.
        let channel = Endpoint::try_from("http://[::]:50051")
            .map_err(EmitError::Connect)?
            .connect_with_connector_lazy(tower::service_fn(move |_: Uri| {
                let socket = socket.clone();
                async move {
                    Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(socket).await?))
                }
            }));
        Ok(Self {
            channel,
            timeout: DEFAULT_EMIT_TIMEOUT,
        })
    }

    /// Use a different per-call deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Emit a redacted copy of a request about to go to a function.
    pub async fn emit_request(
        &self,
        meta: StepMeta,
        req: &RunFunctionRequest,
    ) -> Result<(), EmitError> {
        let payload =
            serde_json::to_vec(&request_to_json(&sanitize_request(req))).map_err(EmitError::Encode)?;
        let msg = EmitRequestRequest {
            meta: Some(meta),
            request: payload,
        };
        let mut client = PipelineInspectorClient::new(self.channel.clone());
        match tokio::time::timeout(self.timeout, client.emit_request(msg)).await {
            Err(_elapsed) => Err(EmitError::Timeout(self.timeout)),
            Ok(Err(status)) => Err(EmitError::Emit(status)),
            Ok(Ok(_)) => Ok(()),
        }
    }

    /// Emit a redacted copy of what a function call produced.
    pub async fn emit_response(
        &self,
        meta: StepMeta,
        rsp: Result<&RunFunctionResponse, &runner::Error>,
    ) -> Result<(), EmitError> {
        let msg = match rsp {
            Ok(rsp) => EmitResponseRequest {
                meta: Some(meta),
                response: serde_json::to_vec(&response_to_json(&sanitize_response(rsp)))
                    .map_err(EmitError::Encode)?,
                error: None,
            },
            Err(e) => EmitResponseRequest {
                meta: Some(meta),
                response: vec![],
                error: Some(e.to_string()),
            },
        };
        let mut client = PipelineInspectorClient::new(self.channel.clone());
        match tokio::time::timeout(self.timeout, client.emit_response(msg)).await {
            Err(_elapsed) => Err(EmitError::Timeout(self.timeout)),
            Ok(Err(status)) => Err(EmitError::Emit(status)),
            Ok(Ok(_)) => Ok(()),
        }
    }
}

impl StepMeta {
    /// Step metadata stamped with the current wall time.
    pub fn now(function: &str, step: &str, operation: &str) -> Self {
        let now = chrono::Utc::now();
        Self {
            function_name: function.to_string(),
            step_name: step.to_string(),
            operation: operation.to_string(),
            wall_time: Some(prost_types::Timestamp {
                seconds: now.timestamp(),
                nanos: now.timestamp_subsec_nanos() as i32,
            }),
        }
    }
}

/// A deep copy of `req` with every sensitive value redacted.
///
/// `req` itself is untouched; the copy that reaches the function still
/// carries real credentials.
pub fn sanitize_request(req: &RunFunctionRequest) -> RunFunctionRequest {
    let mut req = req.clone();
    for creds in req.credentials.values_mut() {
        if let Some(credentials::Source::CredentialData(data)) = &mut creds.source {
            for value in data.data.values_mut() {
                *value = REDACTED.as_bytes().to_vec();
            }
        }
    }
    if let Some(state) = &mut req.observed {
        sanitize_state(state);
    }
    if let Some(state) = &mut req.desired {
        sanitize_state(state);
    }
    for resources in req.required_resources.values_mut() {
        for resource in &mut resources.items {
            sanitize_resource(resource);
        }
    }
    req
}

/// A deep copy of `rsp` with every sensitive value redacted.
pub fn sanitize_response(rsp: &RunFunctionResponse) -> RunFunctionResponse {
    let mut rsp = rsp.clone();
    if let Some(state) = &mut rsp.desired {
        sanitize_state(state);
    }
    rsp
}

fn sanitize_state(state: &mut State) {
    if let Some(composite) = &mut state.composite {
        sanitize_resource(composite);
    }
    for resource in state.resources.values_mut() {
        sanitize_resource(resource);
    }
}

fn sanitize_resource(resource: &mut Resource) {
    for value in resource.connection_details.values_mut() {
        *value = REDACTED.as_bytes().to_vec();
    }
    if let Some(body) = &mut resource.resource {
        if is_secret(body) {
            redact_secret_data(body);
        }
    }
}

fn is_secret(body: &Struct) -> bool {
    string_field(body, "apiVersion") == Some("v1") && string_field(body, "kind") == Some("Secret")
}

fn string_field<'s>(body: &'s Struct, field: &str) -> Option<&'s str> {
    match body.fields.get(field)?.kind.as_ref()? {
        Kind::StringValue(s) => Some(s),
        _ => None,
    }
}

fn redact_secret_data(body: &mut Struct) {
    let Some(data) = body.fields.get_mut("data") else {
        return;
    };
    if let Some(Kind::StructValue(data)) = &mut data.kind {
        for value in data.fields.values_mut() {
            value.kind = Some(Kind::StringValue(REDACTED.to_string()));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::convert::json_to_struct;
    use crate::proto::{CredentialData, Credentials};
    use serde_json::json;

    fn request_with_secrets() -> RunFunctionRequest {
        let secret = json_to_struct(&json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "db-creds"},
            "data": {"password": "aHVudGVyMg=="}
        }))
        .unwrap();
        RunFunctionRequest {
            credentials: [(
                "db".to_string(),
                Credentials {
                    source: Some(credentials::Source::CredentialData(CredentialData {
                        data: [("password".to_string(), b"hunter2".to_vec())].into(),
                    })),
                },
            )]
            .into(),
            observed: Some(State {
                composite: Some(Resource {
                    resource: None,
                    connection_details: [("endpoint".to_string(), b"10.0.0.1".to_vec())].into(),
                    ready: 0,
                }),
                resources: [(
                    "creds".to_string(),
                    Resource {
                        resource: Some(secret),
                        connection_details: Default::default(),
                        ready: 0,
                    },
                )]
                .into(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn sensitive_values_are_redacted() {
        let req = request_with_secrets();
        let clean = sanitize_request(&req);

        let Some(credentials::Source::CredentialData(creds)) = &clean.credentials["db"].source
        else {
            panic!("credential data must survive sanitization");
        };
        assert_eq!(creds.data["password"], REDACTED.as_bytes());

        let observed = clean.observed.as_ref().unwrap();
        assert_eq!(
            observed.composite.as_ref().unwrap().connection_details["endpoint"],
            REDACTED.as_bytes()
        );

        let secret = observed.resources["creds"].resource.as_ref().unwrap();
        assert_eq!(string_field(secret, "kind"), Some("Secret"));
        let Some(Kind::StructValue(data)) = &secret.fields["data"].kind else {
            panic!("data must stay a struct");
        };
        assert!(matches!(
            data.fields["password"].kind.as_ref().unwrap(),
            Kind::StringValue(s) if s == REDACTED
        ));
    }

    #[test]
    fn the_original_request_is_unchanged() {
        let req = request_with_secrets();
        let _ = sanitize_request(&req);

        let Some(credentials::Source::CredentialData(creds)) = &req.credentials["db"].source
        else {
            panic!("credential data must survive sanitization");
        };
        assert_eq!(creds.data["password"], b"hunter2");
        assert_eq!(
            req.observed.as_ref().unwrap().composite.as_ref().unwrap().connection_details
                ["endpoint"],
            b"10.0.0.1"
        );
    }

    #[tokio::test]
    async fn payloads_round_trip_redacted_over_a_unix_socket() {
        use crate::proto::pipeline_inspector_server::{
            PipelineInspector, PipelineInspectorServer,
        };
        use crate::proto::{EmitRequestResponse, EmitResponseResponse};
        use base64::Engine as _;
        use tokio::sync::mpsc;

        struct Sink(mpsc::UnboundedSender<Vec<u8>>);

        #[tonic::async_trait]
        impl PipelineInspector for Sink {
            async fn emit_request(
                &self,
                request: tonic::Request<EmitRequestRequest>,
            ) -> Result<tonic::Response<EmitRequestResponse>, tonic::Status> {
                let _ = self.0.send(request.into_inner().request);
                Ok(tonic::Response::new(EmitRequestResponse::default()))
            }

            async fn emit_response(
                &self,
                _request: tonic::Request<EmitResponseRequest>,
            ) -> Result<tonic::Response<EmitResponseResponse>, tonic::Status> {
                Ok(tonic::Response::new(EmitResponseResponse::default()))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("inspector.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = tokio::spawn(
            tonic::transport::Server::builder()
                .add_service(PipelineInspectorServer::new(Sink(tx)))
                .serve_with_incoming(tokio_stream::wrappers::UnixListenerStream::new(listener)),
        );

        let emitter = InspectorEmitter::unix(&socket)
            .unwrap()
            .with_timeout(Duration::from_secs(5));
        emitter
            .emit_request(
                StepMeta::now("fn-a", "step-a", "op-a"),
                &request_with_secrets(),
            )
            .await
            .unwrap();

        let payload = rx.recv().await.unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        let redacted = base64::engine::general_purpose::STANDARD.encode(REDACTED);
        assert_eq!(
            doc["credentials"]["db"]["credentialData"]["data"]["password"],
            redacted
        );
        assert_eq!(
            doc["observed"]["composite"]["connectionDetails"]["endpoint"],
            redacted
        );
        server.abort();
    }

    #[tokio::test]
    async fn emit_failures_are_contained() {
        let dir = tempfile::tempdir().unwrap();
        // Nothing listens on this socket; the emit must fail as an error,
        // never hang past its deadline.
        let emitter = InspectorEmitter::unix(dir.path().join("missing.sock"))
            .unwrap()
            .with_timeout(Duration::from_millis(50));
        let err = emitter
            .emit_request(
                StepMeta::now("fn-a", "step-a", "op-a"),
                &RunFunctionRequest::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EmitError::Emit(_) | EmitError::Timeout(_)));
    }

    #[test]
    fn non_secret_resources_keep_their_data() {
        let cm = json_to_struct(&json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "data": {"greeting": "hello"}
        }))
        .unwrap();
        let req = RunFunctionRequest {
            observed: Some(State {
                composite: None,
                resources: [(
                    "cm".to_string(),
                    Resource {
                        resource: Some(cm),
                        connection_details: Default::default(),
                        ready: 0,
                    },
                )]
                .into(),
            }),
            ..Default::default()
        };
        let clean = sanitize_request(&req);
        let body = clean.observed.unwrap().resources["cm"].resource.clone().unwrap();
        let Some(Kind::StructValue(data)) = &body.fields["data"].kind else {
            panic!("data must stay a struct");
        };
        assert!(matches!(
            data.fields["greeting"].kind.as_ref().unwrap(),
            Kind::StringValue(s) if s == "hello"
        ));
    }
}
