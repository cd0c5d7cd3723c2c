/// Mutator registry and the generic key/value mutators
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::WriteTransaction;

/// Application logic run for a mutation name.
///
/// An error means the mutation had no further effect; writes made before the
/// error are kept.
#[async_trait]
pub trait Mutator: Send + Sync {
    async fn apply(&self, tx: &dyn WriteTransaction, args: Value) -> anyhow::Result<()>;
}

/// Name to mutator lookup injected into the replay engine.
#[derive(Clone, Default)]
pub struct MutatorRegistry {
    mutators: HashMap<String, Arc<dyn Mutator>>,
}

impl MutatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the generic `put` and `del` mutators.
    pub fn with_builtins() -> Self {
        Self::new()
            .with_mutator("put", PutMutator)
            .with_mutator("del", DelMutator)
    }

    pub fn with_mutator(mut self, name: impl Into<String>, mutator: impl Mutator + 'static) -> Self {
        self.register(name, mutator);
        self
    }

    pub fn register(&mut self, name: impl Into<String>, mutator: impl Mutator + 'static) {
        self.mutators.insert(name.into(), Arc::new(mutator));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Mutator>> {
        self.mutators.get(name)
    }
}

impl fmt::Debug for MutatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.mutators.keys().collect();
        names.sort();
        f.debug_struct("MutatorRegistry")
            .field("mutators", &names)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct PutArgs {
    key: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
struct DelArgs {
    key: String,
}

/// `put` with `{key, value}`
#[derive(Debug, Clone, Copy, Default)]
pub struct PutMutator;

#[async_trait]
impl Mutator for PutMutator {
    async fn apply(&self, tx: &dyn WriteTransaction, args: Value) -> anyhow::Result<()> {
        let args: PutArgs = serde_json::from_value(args).context("invalid put arguments")?;
        tx.put(&args.key, args.value).await?;
        Ok(())
    }
}

/// `del` with `{key}`
#[derive(Debug, Clone, Copy, Default)]
pub struct DelMutator;

#[async_trait]
impl Mutator for DelMutator {
    async fn apply(&self, tx: &dyn WriteTransaction, args: Value) -> anyhow::Result<()> {
        let args: DelArgs = serde_json::from_value(args).context("invalid del arguments")?;
        tx.del(&args.key).await?;
        Ok(())
    }
}
