//! Name-keyed registries for orchestrations and activities
//!
//! Both kinds of handler share one `Registry<H>` type. Registries are immutable
//! once built and cheap to clone; duplicate names are collected by the builder
//! and reported by [`RegistryBuilder::build_result`].

use std::collections::HashMap;
use std::sync::Arc;

use super::{ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::codec::Json;
use crate::{ActivityContext, OrchestrationContext};

pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, Arc<H>>>,
}

// Manual Clone impl since H: ?Sized doesn't auto-derive Clone
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Arc<H>>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn builder_from(reg: &Registry<H>) -> RegistryBuilder<H> {
        RegistryBuilder {
            map: reg.inner.as_ref().clone(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        let found = self.inner.get(name).cloned();
        if found.is_none() {
            tracing::debug!(
                target: "durafan::runtime::registry",
                requested_name = %name,
                registered_names = ?self.list_names(),
                "Registry lookup miss"
            );
        }
        found
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    /// Build the registry. The first registration of a duplicated name wins.
    pub fn build(self) -> Registry<H> {
        if !self.errors.is_empty() {
            tracing::warn!(
                target: "durafan::runtime::registry",
                errors = ?self.errors,
                "registry built with duplicate registrations"
            );
        }
        Registry {
            inner: Arc::new(self.map),
        }
    }

    /// Build the registry, returning an error if there were any registration errors.
    ///
    /// # Errors
    ///
    /// Returns all duplicate-registration messages joined with `; `.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    fn insert(&mut self, name: String, handler: Arc<H>, error_prefix: &str) {
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate {error_prefix} registration: {name}"));
            return;
        }
        self.map.insert(name, handler);
    }

    fn merge_registry(mut self, other: Registry<H>, error_prefix: &str) -> Self {
        for (name, handler) in other.inner.iter() {
            self.insert(name.clone(), handler.clone(), error_prefix);
        }
        self
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnOrchestration(f)), "orchestration");
        self
    }

    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = Json::decode(&input_s)?;
                let out: Out = f_inner(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.insert(name.into(), Arc::new(FnOrchestration(wrapper)), "orchestration");
        self
    }

    pub fn merge(self, other: OrchestrationRegistry) -> Self {
        self.merge_registry(other, "orchestration")
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnActivity(f)), "activity");
        self
    }

    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: ActivityContext, input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = Json::decode(&input_s)?;
                let out: Out = (f_inner)(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.insert(name.into(), Arc::new(FnActivity(wrapper)), "activity");
        self
    }

    pub fn merge(self, other: ActivityRegistry) -> Self {
        self.merge_registry(other, "activity")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_names_are_reported() {
        let result = ActivityRegistry::builder()
            .register("A", |_ctx, input| async move { Ok(input) })
            .register("A", |_ctx, _input| async move { Ok("second".to_string()) })
            .build_result();
        let err = result.err().unwrap();
        assert!(err.contains("duplicate activity registration: A"), "{err}");
    }

    #[test]
    fn lookup_and_listing() {
        let reg = OrchestrationRegistry::builder()
            .register("Beta", |_ctx, input| async move { Ok(input) })
            .register("Alpha", |_ctx, input| async move { Ok(input) })
            .build();
        assert!(reg.has("Alpha"));
        assert!(reg.get("Gamma").is_none());
        assert_eq!(reg.list_names(), vec!["Alpha".to_string(), "Beta".to_string()]);
        assert_eq!(reg.count(), 2);
    }

    #[test]
    fn merge_keeps_both_sides() {
        let base = ActivityRegistry::builder()
            .register("A", |_ctx, input| async move { Ok(input) })
            .build();
        let merged = ActivityRegistry::builder()
            .register("B", |_ctx, input| async move { Ok(input) })
            .merge(base.clone())
            .build_result()
            .unwrap();
        assert_eq!(merged.list_names(), vec!["A".to_string(), "B".to_string()]);
        assert!(ActivityRegistry::builder_from(&base).merge(base).build_result().is_err());
    }

    #[tokio::test]
    async fn typed_activity_decodes_and_encodes() {
        let reg = ActivityRegistry::builder()
            .register_typed::<Vec<u64>, u64, _, _>("Sum", |_ctx, xs| async move { Ok(xs.iter().sum()) })
            .build();
        let handler = reg.get("Sum").unwrap();
        let ctx = ActivityContext::new("i", 0, "Sum", 1);
        assert_eq!(handler.invoke(ctx, "[1,2,3]".to_string()).await.unwrap(), "6");
    }
}
