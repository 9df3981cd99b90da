//! In-memory fakes for the capability traits, shared by the unit tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use kube::api::DynamicObject;
use parking_lot::Mutex;

use xops_api::{AppliedResourceRef, RequiredResourceSelector};
use xops_function::proto::{RunFunctionRequest, RunFunctionResponse};
use xops_function::runner;
use xops_function::FunctionRunner;

use crate::resource::{Error as ResourceError, ResourceApplier, ResourceReader};

/// A function runner serving canned responses per function, in order.
/// Functions with no queued response answer with an empty response.
#[derive(Default)]
pub(crate) struct FakeFunctions {
    responses: Mutex<HashMap<String, VecDeque<RunFunctionResponse>>>,
    failing: Mutex<HashSet<String>>,
    requests: Mutex<Vec<RunFunctionRequest>>,
    calls: Mutex<Vec<String>>,
}

impl FakeFunctions {
    /// Queue a response for the named function.
    pub fn respond(self, function: &str, rsp: RunFunctionResponse) -> Self {
        self.responses
            .lock()
            .entry(function.to_string())
            .or_default()
            .push_back(rsp);
        self
    }

    /// Make the named function fail every call.
    pub fn fail(self, function: &str) -> Self {
        self.failing.lock().insert(function.to_string());
        self
    }

    /// Every request received, in call order.
    pub fn requests(&self) -> Vec<RunFunctionRequest> {
        self.requests.lock().clone()
    }

    /// Every function name called, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl FunctionRunner for FakeFunctions {
    async fn run_function(
        &self,
        function: &str,
        req: RunFunctionRequest,
    ) -> Result<RunFunctionResponse, runner::Error> {
        self.calls.lock().push(function.to_string());
        self.requests.lock().push(req);
        if self.failing.lock().contains(function) {
            return Err(runner::Error::UnknownFunction(function.to_string()));
        }
        let rsp = self
            .responses
            .lock()
            .get_mut(function)
            .and_then(VecDeque::pop_front);
        Ok(rsp.unwrap_or_default())
    }
}

/// An in-memory stand-in for the API server capabilities.
#[derive(Default)]
pub(crate) struct FakeResources {
    objects: Mutex<Vec<DynamicObject>>,
    secrets: Mutex<HashMap<(String, String), BTreeMap<String, Vec<u8>>>>,
    fetched: Mutex<Vec<RequiredResourceSelector>>,
    applied: Mutex<Vec<serde_json::Value>>,
    fail_applies: bool,
}

impl FakeResources {
    /// Make every apply fail.
    pub fn fail_applies(mut self) -> Self {
        self.fail_applies = true;
        self
    }

    /// Serve these objects to any matching requirement fetch.
    pub fn with_object(self, object: DynamicObject) -> Self {
        self.objects.lock().push(object);
        self
    }

    /// Serve a secret's data.
    pub fn with_secret(
        self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Self {
        self.secrets
            .lock()
            .insert((namespace.to_string(), name.to_string()), data);
        self
    }

    /// Every selector that was resolved, in order.
    pub fn fetched_selectors(&self) -> Vec<RequiredResourceSelector> {
        self.fetched.lock().clone()
    }

    /// Every manifest that was applied, in order.
    pub fn applied_manifests(&self) -> Vec<serde_json::Value> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl ResourceReader for FakeResources {
    async fn fetch_required(
        &self,
        selector: &RequiredResourceSelector,
    ) -> Result<Vec<DynamicObject>, ResourceError> {
        self.fetched.lock().push(selector.clone());
        let objects = self.objects.lock();
        Ok(objects
            .iter()
            .filter(|o| match &selector.name {
                Some(name) => o.metadata.name.as_deref() == Some(name),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn read_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, ResourceError> {
        self.secrets
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ResourceError::ReadSecret {
                namespace: namespace.to_string(),
                name: name.to_string(),
                source: kube::Error::Api(kube::core::ErrorResponse {
                    status: "Failure".to_string(),
                    message: "not found".to_string(),
                    reason: "NotFound".to_string(),
                    code: 404,
                }),
            })
    }
}

#[async_trait]
impl ResourceApplier for FakeResources {
    async fn apply(
        &self,
        manifest: &serde_json::Value,
        _field_manager: &str,
    ) -> Result<AppliedResourceRef, ResourceError> {
        let name = manifest["metadata"]["name"]
            .as_str()
            .ok_or(ResourceError::IncompleteManifest)?;
        if self.fail_applies {
            return Err(ResourceError::Apply(
                name.to_string(),
                kube::Error::Api(kube::core::ErrorResponse {
                    status: "Failure".to_string(),
                    message: "apply rejected".to_string(),
                    reason: "Invalid".to_string(),
                    code: 422,
                }),
            ));
        }
        self.applied.lock().push(manifest.clone());
        Ok(AppliedResourceRef {
            api_version: manifest["apiVersion"].as_str().unwrap_or_default().to_string(),
            kind: manifest["kind"].as_str().unwrap_or_default().to_string(),
            namespace: manifest["metadata"]["namespace"].as_str().map(String::from),
            name: name.to_string(),
        })
    }
}
