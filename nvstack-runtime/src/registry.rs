//! Function registry: name to (execute, recover) entry points.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::context::ExecutionContext;
use crate::error::{Result, RuntimeError};

/// A registered entry point. Receives the callee's raw argument bytes.
pub type EntryPoint = Arc<dyn Fn(&mut ExecutionContext, &[u8]) -> Result<()> + Send + Sync>;

/// The normal implementation of a function and its recovery counterpart.
#[derive(Clone)]
pub struct FunctionEntry {
    /// Runs the function in execution mode.
    pub execute: EntryPoint,
    /// Re-derives whether the interrupted call committed and finishes it.
    pub recover: EntryPoint,
}

/// Process-wide table of callable functions.
///
/// Populated before any worker starts and read-only afterwards; shared
/// through [`SystemConfig`](crate::context::SystemConfig).
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    entries: HashMap<String, FunctionEntry>,
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`. A second registration under the same name replaces
    /// the first.
    pub fn register<E, R>(&mut self, name: impl Into<String>, execute: E, recover: R)
    where
        E: Fn(&mut ExecutionContext, &[u8]) -> Result<()> + Send + Sync + 'static,
        R: Fn(&mut ExecutionContext, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        let entry = FunctionEntry {
            execute: Arc::new(execute),
            recover: Arc::new(recover),
        };
        if self.entries.insert(name.clone(), entry).is_some() {
            warn!(function = %name, "function registered twice, keeping the latest");
        }
    }

    /// Both entry points of `name`, if registered.
    pub fn get(&self, name: &str) -> Option<&FunctionEntry> {
        self.entries.get(name)
    }

    /// The execute or recover entry point of `name`.
    pub fn lookup(&self, name: &str, recover: bool) -> Result<EntryPoint> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownFunction(name.to_string()))?;
        Ok(if recover {
            Arc::clone(&entry.recover)
        } else {
            Arc::clone(&entry.execute)
        })
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut ExecutionContext, _: &[u8]) -> Result<()> {
        Ok(())
    }

    fn failing(_: &mut ExecutionContext, _: &[u8]) -> Result<()> {
        Err(RuntimeError::Task("recover".into()))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = FunctionRegistry::new();
        assert!(registry.is_empty());
        registry.register("f", noop, failing);
        assert!(registry.contains("f"));
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup("f", false).is_ok());
        assert!(registry.lookup("f", true).is_ok());
        assert!(registry.get("f").is_some());
    }

    #[test]
    fn test_unknown_function() {
        let registry = FunctionRegistry::new();
        match registry.lookup("missing", false) {
            Err(RuntimeError::UnknownFunction(name)) => assert_eq!(name, "missing"),
            _ => panic!("expected UnknownFunction"),
        }
    }

    #[test]
    fn test_reregister_replaces() {
        let mut registry = FunctionRegistry::new();
        registry.register("f", noop, noop);
        registry.register("f", failing, failing);
        assert_eq!(registry.len(), 1);
        assert_eq!(format!("{registry:?}"), "FunctionRegistry { functions: [\"f\"] }");
    }
}
