//! Extension units and self-registration
//!
//! A unit is one loadable source of extensions. Loading a unit yields an
//! [`ExtensionModule`], which declares its API version and registers one
//! factory per extension with a [`Registrar`]. Nothing is discovered by
//! reflection: native units are listed in a [`ModuleCatalog`], wasm units
//! describe themselves through their manifest export.
//!
//! ```rust,ignore
//! let mut catalog = ModuleCatalog::new();
//! catalog.register("weather", || {
//!     Ok(NativeModule::new("1.1")
//!         .extension(ExtensionInfo::new("weather", "0.1.0"), || Ok(Weather::default())))
//! });
//! ```

use crate::extension::Extension;
use glint_ext_api::ExtensionInfo;
use std::fmt;

/// Builds one extension instance
pub type ExtensionFactory = Box<dyn FnOnce() -> anyhow::Result<Box<dyn Extension>> + Send>;

/// Runs a native unit's top-level code
pub type ModuleInit = Box<dyn Fn() -> anyhow::Result<Box<dyn ExtensionModule>> + Send + Sync>;

/// A loaded unit
pub trait ExtensionModule: Send {
    /// Declared API version, `None` if the unit declares none
    fn api_version(&self) -> Option<&str>;

    /// Register every extension this unit provides
    fn register(self: Box<Self>, registrar: &mut Registrar) -> anyhow::Result<()>;
}

/// Collects extension factories while a unit registers
#[derive(Default)]
pub struct Registrar {
    entries: Vec<(ExtensionInfo, ExtensionFactory)>,
}

impl Registrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its declared identity
    pub fn register<F>(&mut self, info: ExtensionInfo, factory: F)
    where
        F: FnOnce() -> anyhow::Result<Box<dyn Extension>> + Send + 'static,
    {
        self.entries.push((info, Box::new(factory)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn into_entries(self) -> Vec<(ExtensionInfo, ExtensionFactory)> {
        self.entries
    }
}

impl fmt::Debug for Registrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(info, _)| &info.name))
            .finish()
    }
}

/// A unit implemented in Rust and linked into the host
pub struct NativeModule {
    api_version: Option<String>,
    entries: Vec<(ExtensionInfo, ExtensionFactory)>,
}

impl NativeModule {
    pub fn new(api_version: impl Into<String>) -> Self {
        Self {
            api_version: Some(api_version.into()),
            entries: Vec::new(),
        }
    }

    /// A unit that declares no API version; the loader will skip it
    pub fn unversioned() -> Self {
        Self {
            api_version: None,
            entries: Vec::new(),
        }
    }

    /// Add an extension
    pub fn extension<E, F>(mut self, info: ExtensionInfo, factory: F) -> Self
    where
        E: Extension + 'static,
        F: FnOnce() -> anyhow::Result<E> + Send + 'static,
    {
        let factory: ExtensionFactory =
            Box::new(move || factory().map(|ext| Box::new(ext) as Box<dyn Extension>));
        self.entries.push((info, factory));
        self
    }
}

impl ExtensionModule for NativeModule {
    fn api_version(&self) -> Option<&str> {
        self.api_version.as_deref()
    }

    fn register(self: Box<Self>, registrar: &mut Registrar) -> anyhow::Result<()> {
        registrar.entries.extend(self.entries);
        Ok(())
    }
}

/// Native units in registration order
#[derive(Default)]
pub struct ModuleCatalog {
    units: Vec<(String, ModuleInit)>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a unit; `init` is the unit's top-level code and runs sandboxed
    pub fn register<F, M>(&mut self, unit: impl Into<String>, init: F) -> &mut Self
    where
        F: Fn() -> anyhow::Result<M> + Send + Sync + 'static,
        M: ExtensionModule + 'static,
    {
        let init: ModuleInit =
            Box::new(move || init().map(|module| Box::new(module) as Box<dyn ExtensionModule>));
        self.units.push((unit.into(), init));
        self
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub(crate) fn units(&self) -> impl Iterator<Item = (&str, &ModuleInit)> {
        self.units.iter().map(|(name, init)| (name.as_str(), init))
    }
}

impl fmt::Debug for ModuleCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.units.iter().map(|(name, _)| name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Noop;

    impl Extension for Noop {}

    #[test]
    fn test_native_module_registers_in_order() {
        let module = NativeModule::new("1.1")
            .extension(ExtensionInfo::new("a", "1.0.0"), || Ok(Noop))
            .extension(ExtensionInfo::new("b", "1.0.0"), || Ok(Noop));
        assert_eq!(module.api_version(), Some("1.1"));

        let mut registrar = Registrar::new();
        Box::new(module).register(&mut registrar).unwrap();

        let names: Vec<_> = registrar
            .into_entries()
            .into_iter()
            .map(|(info, factory)| {
                assert!(factory().is_ok());
                info.name
            })
            .collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn test_catalog_keeps_registration_order() {
        let mut catalog = ModuleCatalog::new();
        catalog
            .register("zeta", || Ok(NativeModule::new("1.1")))
            .register("alpha", || Ok(NativeModule::unversioned()));

        let units: Vec<_> = catalog.units().map(|(name, _)| name.to_string()).collect();
        assert_eq!(units, ["zeta", "alpha"]);
        assert_eq!(catalog.len(), 2);

        let (_, init) = catalog.units().nth(1).unwrap();
        assert!(init().unwrap().api_version().is_none());
    }
}
