//! Resource model base and the generic collection endpoint.
//!
//! Every server-side object kind implements [`ResourceKind`], which binds its
//! typed attributes to a collection path and a key. [`Resource`] is the
//! point-in-time snapshot handed to callers; [`Collection`] is the stateless
//! list/get/create/update/delete dispatcher for one kind.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use tracing::{debug, info};

use incus_core::query::{encode_segment, QueryParams};
use incus_core::transport::ApiRequest;
use incus_core::{Error, Operation};

use crate::client::{Client, WeakClient};
use crate::operation::{OperationTracker, Outcome};
use crate::Result;

/// A kind of server-side object exposed as a collection.
pub trait ResourceKind:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
    /// Request body accepted by `POST` on the collection.
    type Create: Serialize + Send + Sync;

    /// Collection path, e.g. `/1.0/instances`.
    const PATH: &'static str;

    /// Singular name used in log output.
    const KIND: &'static str;

    /// Whether requests carry the client's `project=` parameter.
    const PROJECT_SCOPED: bool;

    /// Identifier used in the resource path (name or fingerprint).
    fn key(&self) -> &str;

    /// Key of the object a create request produced, if it can be derived
    /// from the request or the finished operation.
    fn created_key(request: &Self::Create, operation: Option<&Operation>) -> Option<String>;

    /// Whether a listed object is the one produced by `request`. Used when
    /// [`ResourceKind::created_key`] cannot name it.
    fn is_created(_request: &Self::Create, _candidate: &Self) -> bool {
        false
    }
}

/// Kinds that can be renamed with `POST {path}/{name}`.
pub trait Renamable: ResourceKind {}

pub(crate) fn resource_path<K: ResourceKind>(key: &str) -> String {
    format!("{}/{}", K::PATH, encode_segment(key))
}

/// Shallow-merge object-valued fields with the current state; caller values
/// win and non-object fields are sent as given.
pub(crate) fn merge_fields(current: &Value, fields: Map<String, Value>) -> Map<String, Value> {
    fields
        .into_iter()
        .map(|(key, value)| {
            let merged = match (current.get(&key), value) {
                (Some(Value::Object(existing)), Value::Object(update)) => {
                    let mut combined = existing.clone();
                    combined.extend(update);
                    Value::Object(combined)
                }
                (_, value) => value,
            };
            (key, merged)
        })
        .collect()
}

/// Snapshot of one server-side object.
///
/// The snapshot is never refreshed behind the caller's back; only
/// [`Resource::refresh`] and [`Resource::update`] replace it. After
/// [`Resource::delete`] the snapshot is stale.
#[derive(Debug, Clone)]
pub struct Resource<K> {
    attrs: K,
    client: WeakClient,
}

impl<K> Deref for Resource<K> {
    type Target = K;

    fn deref(&self) -> &K {
        &self.attrs
    }
}

impl<K: ResourceKind> Resource<K> {
    pub(crate) fn new(client: &Client, attrs: K) -> Self {
        Self {
            attrs,
            client: client.downgrade(),
        }
    }

    pub(crate) fn from_value(client: &Client, value: Value) -> Result<Self> {
        let attrs = serde_json::from_value(value)
            .map_err(|err| Error::Decode(format!("Invalid {} payload: {err}", K::KIND)))?;
        Ok(Self::new(client, attrs))
    }

    pub(crate) fn client(&self) -> Result<Client> {
        self.client.upgrade()
    }

    /// Identifier used in the resource path.
    #[must_use]
    pub fn key(&self) -> &str {
        self.attrs.key()
    }

    /// API path of this object.
    #[must_use]
    pub fn path(&self) -> String {
        resource_path::<K>(self.attrs.key())
    }

    /// Typed attributes.
    #[must_use]
    pub fn attributes(&self) -> &K {
        &self.attrs
    }

    /// Consume the snapshot, returning its attributes.
    #[must_use]
    pub fn into_attributes(self) -> K {
        self.attrs
    }

    /// Attributes as raw JSON, including fields not modelled by `K`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the attributes cannot be serialized.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.attrs)?)
    }

    /// Replace the snapshot with the server's current state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the object no longer exists.
    pub async fn refresh(&mut self) -> Result<()> {
        let client = self.client()?;
        let fresh = Collection::<K>::new(&client).get(self.key()).await?;
        self.attrs = fresh.attrs;
        Ok(())
    }

    /// Apply a partial update (`PATCH`).
    ///
    /// Object-valued fields such as `config` are merged with this snapshot,
    /// the caller's keys winning. The snapshot is refreshed once the update
    /// has been applied.
    ///
    /// # Errors
    ///
    /// Returns transport, API or wait errors.
    pub async fn update(&mut self, fields: Map<String, Value>, wait: bool) -> Result<Outcome> {
        let client = self.client()?;
        let body = merge_fields(&self.to_value()?, fields);
        info!(kind = K::KIND, name = %self.key(), "Updating resource");

        let request = client.scoped(
            ApiRequest::patch(self.path(), Value::Object(body)),
            K::PROJECT_SCOPED,
        );
        let outcome = client.dispatch(request, wait).await?;
        self.refresh_after(&outcome).await?;
        Ok(outcome)
    }

    /// Replace the writable state (`PUT`) with exactly `body`.
    ///
    /// # Errors
    ///
    /// Returns transport, API or wait errors.
    pub async fn replace(&mut self, body: Map<String, Value>, wait: bool) -> Result<Outcome> {
        let client = self.client()?;
        info!(kind = K::KIND, name = %self.key(), "Replacing resource");

        let request = client.scoped(
            ApiRequest::put(self.path(), Value::Object(body)),
            K::PROJECT_SCOPED,
        );
        let outcome = client.dispatch(request, wait).await?;
        self.refresh_after(&outcome).await?;
        Ok(outcome)
    }

    /// Delete the object on the server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if it is already gone.
    pub async fn delete(&self, wait: bool) -> Result<Outcome> {
        let client = self.client()?;
        Collection::<K>::new(&client).delete(self.key(), wait).await
    }

    async fn refresh_after(&mut self, outcome: &Outcome) -> Result<()> {
        let applied = match outcome {
            Outcome::Sync(_) => true,
            Outcome::Completed(operation) => operation.is_success(),
            Outcome::Pending(_) => false,
        };
        if applied {
            self.refresh().await?;
        }
        Ok(())
    }
}

impl<K: Renamable> Resource<K> {
    /// Rename the object. The snapshot keeps the old name.
    ///
    /// # Errors
    ///
    /// Returns transport, API or wait errors.
    pub async fn rename(&self, new_name: &str, wait: bool) -> Result<Outcome> {
        let client = self.client()?;
        Collection::<K>::new(&client)
            .rename(self.key(), new_name, wait)
            .await
    }
}

/// Result of a create call.
#[derive(Debug, Clone)]
pub enum Created<K> {
    /// The object exists and was fetched.
    Ready(Resource<K>),
    /// Creation continues in the background.
    Pending(OperationTracker),
}

impl<K> Created<K> {
    /// Returns true if the object was fetched.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// The created object, if creation has finished.
    #[must_use]
    pub fn into_resource(self) -> Option<Resource<K>> {
        match self {
            Self::Ready(resource) => Some(resource),
            Self::Pending(_) => None,
        }
    }

    /// The tracker of a creation still in progress.
    #[must_use]
    pub fn into_tracker(self) -> Option<OperationTracker> {
        match self {
            Self::Ready(_) => None,
            Self::Pending(tracker) => Some(tracker),
        }
    }
}

/// Filters for list requests.
#[derive(Debug, Default, Clone)]
pub struct ListOptions {
    /// Server-side filter expression, e.g. `status eq Running`.
    pub filter: Option<String>,
    /// List across all projects.
    pub all_projects: bool,
}

impl ListOptions {
    /// Set the filter expression.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// List across all projects.
    #[must_use]
    pub fn across_projects(mut self) -> Self {
        self.all_projects = true;
        self
    }

    /// Convert the options into URL query pairs.
    #[must_use]
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut params = QueryParams::new();
        params.push("recursion", 1);
        params.push_opt("filter", self.filter.as_deref());
        params.push_flag("all-projects", self.all_projects);
        params.into_pairs()
    }
}

/// Stateless endpoint for one resource kind.
pub struct Collection<'a, K> {
    client: &'a Client,
    kind: PhantomData<fn() -> K>,
}

impl<K> Clone for Collection<'_, K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Collection<'_, K> {}

impl<K: ResourceKind> fmt::Debug for Collection<'_, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("path", &K::PATH)
            .finish_non_exhaustive()
    }
}

impl<'a, K: ResourceKind> Collection<'a, K> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self {
            client,
            kind: PhantomData,
        }
    }

    pub(crate) fn client(&self) -> &'a Client {
        self.client
    }

    pub(crate) fn request(&self, request: ApiRequest) -> ApiRequest {
        self.client.scoped(request, K::PROJECT_SCOPED)
    }

    /// List every object of this kind.
    ///
    /// # Errors
    ///
    /// Returns transport or API errors, or [`Error::Decode`] naming the
    /// first element that does not parse.
    pub async fn list(&self) -> Result<Vec<Resource<K>>> {
        self.list_with(&ListOptions::default()).await
    }

    /// List objects matching `options`.
    ///
    /// # Errors
    ///
    /// See [`Collection::list`].
    pub async fn list_with(&self, options: &ListOptions) -> Result<Vec<Resource<K>>> {
        let request = ApiRequest::get(K::PATH).with_query(options.to_pairs());
        let request = if options.all_projects {
            request
        } else {
            self.request(request)
        };

        let items: Option<Vec<Value>> = self.client.get_metadata(request).await?;
        let items = items.unwrap_or_default();
        debug!(kind = K::KIND, count = items.len(), "Listed resources");

        items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                Resource::from_value(self.client, item).map_err(|err| match err {
                    Error::Decode(message) => Error::Decode(format!("{} [{index}]: {message}", K::PATH)),
                    other => other,
                })
            })
            .collect()
    }

    /// Fetch one object by key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if it does not exist.
    pub async fn get(&self, key: &str) -> Result<Resource<K>> {
        let request = self.request(ApiRequest::get(resource_path::<K>(key)));
        let value: Value = self.client.get_metadata(request).await?;
        Resource::from_value(self.client, value)
    }

    /// Returns whether an object with this key exists.
    ///
    /// # Errors
    ///
    /// Returns errors other than [`Error::NotFound`].
    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Create an object.
    ///
    /// When the server answers synchronously, or `wait` is set and the
    /// background operation succeeds, the new object is fetched and
    /// returned. Otherwise the pending operation is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Operation`] if the background creation failed, plus
    /// transport, API and wait errors.
    pub async fn create(&self, request: &K::Create, wait: bool) -> Result<Created<K>> {
        let body = serde_json::to_value(request)?;
        info!(kind = K::KIND, wait, "Creating resource");

        let response = self
            .client
            .call(self.request(ApiRequest::post(K::PATH, body)))
            .await?;

        let operation = if response.is_async() {
            let mut tracker = OperationTracker::from_response(self.client, &response)?;
            if !wait {
                return Ok(Created::Pending(tracker));
            }
            Some(tracker.wait_success(None).await?)
        } else {
            None
        };

        self.locate_created(request, operation.as_ref())
            .await
            .map(Created::Ready)
    }

    async fn locate_created(
        &self,
        request: &K::Create,
        operation: Option<&Operation>,
    ) -> Result<Resource<K>> {
        if let Some(key) = K::created_key(request, operation) {
            return self.get(&key).await;
        }

        self.list()
            .await?
            .into_iter()
            .find(|candidate| K::is_created(request, candidate))
            .ok_or_else(|| {
                Error::Decode(format!("Created {} could not be located", K::KIND))
            })
    }

    /// Fetch an object and apply a partial update to it. See
    /// [`Resource::update`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the object does not exist, plus
    /// transport, API and wait errors.
    pub async fn update(
        &self,
        key: &str,
        fields: Map<String, Value>,
        wait: bool,
    ) -> Result<Outcome> {
        let mut resource = self.get(key).await?;
        resource.update(fields, wait).await
    }

    /// Replace the writable state of an object with exactly `body`.
    ///
    /// # Errors
    ///
    /// Returns transport, API or wait errors.
    pub async fn replace(
        &self,
        key: &str,
        body: Map<String, Value>,
        wait: bool,
    ) -> Result<Outcome> {
        info!(kind = K::KIND, name = key, "Replacing resource");
        let request = self.request(ApiRequest::put(resource_path::<K>(key), Value::Object(body)));
        self.client.dispatch(request, wait).await
    }

    /// Delete an object.
    ///
    /// With `wait` unset a pending deletion is returned as
    /// [`Outcome::Pending`]; waiting on it does not re-send the delete.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the object does not exist.
    pub async fn delete(&self, key: &str, wait: bool) -> Result<Outcome> {
        info!(kind = K::KIND, name = key, "Deleting resource");
        let request = self.request(ApiRequest::delete(resource_path::<K>(key)));
        self.client.dispatch(request, wait).await
    }
}

impl<K: Renamable> Collection<'_, K> {
    /// Rename an object.
    ///
    /// # Errors
    ///
    /// Returns transport, API or wait errors.
    pub async fn rename(&self, key: &str, new_name: &str, wait: bool) -> Result<Outcome> {
        if new_name.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "New {} name must not be empty",
                K::KIND
            )));
        }

        info!(kind = K::KIND, name = key, new_name, "Renaming resource");
        let body = serde_json::json!({ "name": new_name });
        let request = self.request(ApiRequest::post(resource_path::<K>(key), body));
        self.client.dispatch(request, wait).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProfileCreate;
    use crate::test_support::{client_with, sync_response, MockTransport};
    use mockall::Sequence;
    use serde_json::json;

    fn profile_json(description: &str) -> Value {
        json!({
            "name": "web",
            "description": description,
            "config": {"limits.cpu": "2", "limits.memory": "1GiB"},
            "devices": {"root": {"path": "/", "pool": "default", "type": "disk"}},
            "used_by": []
        })
    }

    #[test]
    fn merge_keeps_existing_object_keys() {
        let current = json!({"config": {"a": "1", "b": "1"}, "description": "old"});
        let fields = json!({"config": {"b": "2"}, "description": "new"});
        let Value::Object(fields) = fields else {
            unreachable!()
        };

        let merged = merge_fields(&current, fields);
        assert_eq!(
            Value::Object(merged),
            json!({"config": {"a": "1", "b": "2"}, "description": "new"})
        );
    }

    #[test]
    fn list_options_pairs() {
        let options = ListOptions::default()
            .with_filter("status eq Running")
            .across_projects();
        assert_eq!(
            options.to_pairs(),
            vec![
                ("recursion", "1".to_string()),
                ("filter", "status eq Running".to_string()),
                ("all-projects", "true".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn update_sends_merged_fields_then_refreshes() {
        let mut transport = MockTransport::new();
        let mut seq = Sequence::new();
        transport
            .expect_send()
            .withf(|request| request.method == reqwest::Method::GET)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(sync_response(profile_json("old"))));
        transport
            .expect_send()
            .withf(|request| {
                request.method == reqwest::Method::PATCH
                    && request.path == "/1.0/profiles/web"
                    && request.body
                        == Some(json!({
                            "config": {"limits.cpu": "4", "limits.memory": "1GiB"}
                        }))
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(sync_response(Value::Null)));
        transport
            .expect_send()
            .withf(|request| request.method == reqwest::Method::GET)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                let mut fresh = profile_json("old");
                fresh["config"]["limits.cpu"] = json!("4");
                Ok(sync_response(fresh))
            });
        let client = client_with(transport);

        let mut profile = client.profiles().get("web").await.unwrap();
        let mut fields = Map::new();
        fields.insert("config".into(), json!({"limits.cpu": "4"}));
        profile.update(fields, true).await.unwrap();

        assert_eq!(profile.config["limits.cpu"], "4");
    }

    #[tokio::test]
    async fn replace_sends_exact_mapping() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|request| {
                request.method == reqwest::Method::PUT
                    && request.body == Some(json!({"config": {"limits.cpu": "4"}}))
            })
            .times(1)
            .returning(|_| Ok(sync_response(Value::Null)));
        let client = client_with(transport);

        let mut body = Map::new();
        body.insert("config".into(), json!({"limits.cpu": "4"}));
        let outcome = client.profiles().replace("web", body, true).await.unwrap();
        assert!(matches!(outcome, Outcome::Sync(_)));
    }

    #[tokio::test]
    async fn create_sync_refetches() {
        let mut transport = MockTransport::new();
        let mut seq = Sequence::new();
        transport
            .expect_send()
            .withf(|request| {
                request.method == reqwest::Method::POST
                    && request.path == "/1.0/profiles"
                    && request.body.as_ref().map(|body| body["name"].clone()) == Some(json!("web"))
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(sync_response(Value::Null)));
        transport
            .expect_send()
            .withf(|request| request.path == "/1.0/profiles/web")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(sync_response(profile_json("fresh"))));
        let client = client_with(transport);

        let created = client
            .profiles()
            .create(&ProfileCreate::new("web"), false)
            .await
            .unwrap();
        let profile = created.into_resource().unwrap();
        assert_eq!(profile.description, "fresh");
    }

    #[tokio::test]
    async fn list_reports_bad_element() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .returning(|_| Ok(sync_response(json!([profile_json("ok"), {"name": 5}]))));
        let client = client_with(transport);

        let err = client.profiles().list().await.unwrap_err();
        match err {
            Error::Decode(message) => assert!(message.contains("[1]")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn rename_rejects_empty_name() {
        let mut transport = MockTransport::new();
        transport.expect_send().times(0);
        let client = client_with(transport);

        let err = client.profiles().rename("web", "", false).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn resource_outliving_client_reports_closed() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .returning(|_| Ok(sync_response(profile_json("x"))));
        let client = client_with(transport);
        let mut profile = client.profiles().get("web").await.unwrap();
        drop(client);

        assert!(matches!(profile.refresh().await, Err(Error::ClientClosed)));
        assert_eq!(profile.name, "web");
    }
}
