//! Name-keyed registries for orchestrations and activities
//!
//! A single generic `Registry<H>` stores both handler kinds. Orchestrations can
//! additionally declare the activity names they call; the runtime checks those
//! declarations against the activity registry before it starts dispatching.

use super::{ActivityContext, ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::OrchestrationContext;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Registration or startup validation problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The same name was registered twice.
    Duplicate { kind: &'static str, name: String },
    /// An orchestration declared activities that nobody registered.
    UndeclaredActivities { orchestration: String, missing: Vec<String> },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Duplicate { kind, name } => write!(f, "duplicate {kind} registration: {name}"),
            RegistryError::UndeclaredActivities { orchestration, missing } => write!(
                f,
                "orchestration '{orchestration}' uses unregistered activities: {}",
                missing.join(", ")
            ),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Immutable name -> handler map. Cheap to clone.
pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, Arc<H>>>,
    /// Activity names each orchestration declared at registration.
    declared: Arc<HashMap<String, BTreeSet<String>>>,
}

// Manual Clone impl since H: ?Sized doesn't auto-derive Clone
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            declared: Arc::clone(&self.declared),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
            declared: Arc::new(HashMap::new()),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Arc<H>>,
    declared: HashMap<String, BTreeSet<String>>,
    errors: Vec<RegistryError>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            declared: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        let found = self.inner.get(name).cloned();
        if found.is_none() {
            tracing::debug!(
                target: "duratask::runtime::registry",
                requested_name = %name,
                registered_names = ?self.list_names(),
                "Registry lookup miss"
            );
        }
        found
    }

    /// Registered names, sorted.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

impl OrchestrationRegistry {
    /// Activity names `orchestration` declared, if any.
    pub fn declared_activities(&self, orchestration: &str) -> Vec<String> {
        self.declared
            .get(orchestration)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Check every declared activity is registered in `activities`.
    ///
    /// # Errors
    ///
    /// Returns the first orchestration (by name) with missing activities.
    pub fn validate_activities(&self, activities: &ActivityRegistry) -> Result<(), RegistryError> {
        let mut names: Vec<&String> = self.declared.keys().collect();
        names.sort();
        for orchestration in names {
            let missing: Vec<String> = self.declared[orchestration]
                .iter()
                .filter(|a| !activities.has(a))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(RegistryError::UndeclaredActivities {
                    orchestration: orchestration.clone(),
                    missing,
                });
            }
        }
        Ok(())
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    /// Build the registry. On duplicate names the first registration wins.
    pub fn build(self) -> Registry<H> {
        for err in &self.errors {
            tracing::warn!(target: "duratask::runtime::registry", error = %err, "Ignoring registration");
        }
        Registry {
            inner: Arc::new(self.map),
            declared: Arc::new(self.declared),
        }
    }

    /// Build the registry, returning an error if there were any registration errors.
    ///
    /// # Errors
    ///
    /// Returns the first registration error.
    pub fn build_result(mut self) -> Result<Registry<H>, RegistryError> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.remove(0))
        }
    }

    fn insert(&mut self, kind: &'static str, name: String, handler: Arc<H>) -> bool {
        if self.map.contains_key(&name) {
            self.errors.push(RegistryError::Duplicate { kind, name });
            false
        } else {
            self.map.insert(name, handler);
            true
        }
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert("orchestration", name.into(), Arc::new(FnOrchestration(f)));
        self
    }

    /// Register an orchestration together with the activity names it calls.
    /// `Runtime::start_*` refuses to start when one of them is unregistered.
    pub fn register_with_activities<F, Fut, I, S>(mut self, name: impl Into<String>, activities: I, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        if self.insert("orchestration", name.clone(), Arc::new(FnOrchestration(f))) {
            self.declared
                .insert(name, activities.into_iter().map(Into::into).collect());
        }
        self
    }

    /// Register an orchestration whose input and output are JSON-encoded.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(name, move |ctx: OrchestrationContext, input_s: String| {
            let f = f.clone();
            async move {
                let input: In = serde_json::from_str(&input_s).map_err(|e| format!("decode: {e}"))?;
                let out: Out = f(ctx, input).await?;
                serde_json::to_string(&out).map_err(|e| format!("encode: {e}"))
            }
        })
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert("activity", name.into(), Arc::new(FnActivity(f)));
        self
    }

    /// Register a prebuilt handler, e.g. one that owns collaborators.
    pub fn register_handler(mut self, name: impl Into<String>, handler: Arc<dyn ActivityHandler>) -> Self {
        self.insert("activity", name.into(), handler);
        self
    }

    /// Register an activity whose input and output are JSON-encoded.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(name, move |ctx: ActivityContext, input_s: String| {
            let f = f.clone();
            async move {
                let input: In = serde_json::from_str(&input_s).map_err(|e| format!("decode: {e}"))?;
                let out: Out = f(ctx, input).await?;
                serde_json::to_string(&out).map_err(|e| format!("encode: {e}"))
            }
        })
    }
}
