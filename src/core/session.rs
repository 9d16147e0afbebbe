//! KN-009: Session: one construct graph plus its output registry.
//!
//! A session is created per script run and is never shared. It holds the
//! application context, the constructs keyed by name, and the registry of
//! deferred values. Building the IR and running resolution rounds both go
//! through it.

use super::binding::{self, BindingArgs};
use super::construct::{Construct, ConstructRef, Property};
use super::error::{Error, Result};
use super::output::{Combinator, Output, Registry};
use super::resolver;
use super::types::{
    Application, ConstructStatus, IrDocument, OutputFacts, ResolvedOutput, Value, SCHEMA_VERSION,
};
use super::urn::Urn;
use indexmap::IndexMap;

/// Resource type segment used for every construct URN.
pub const CONSTRUCT_TYPE: &str = "construct";

/// IR document version emitted by [`Session::to_ir`].
pub const IR_VERSION: u32 = 1;

#[derive(Debug, Default)]
pub struct Session {
    application: Option<Application>,
    constructs: IndexMap<String, Construct>,
    registry: Registry,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_application(application: Application) -> Self {
        Self {
            application: Some(application),
            ..Self::default()
        }
    }

    pub fn set_application(&mut self, application: Application) {
        self.application = Some(application);
    }

    pub fn application(&self) -> Option<&Application> {
        self.application.as_ref()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn constructs(&self) -> impl Iterator<Item = &Construct> {
        self.constructs.values()
    }

    pub fn construct(&self, handle: &ConstructRef) -> Option<&Construct> {
        self.constructs
            .get(&handle.name)
            .filter(|c| c.urn() == &handle.urn)
    }

    /// URN a construct named `name` of `construct_type` gets in this session.
    pub fn construct_urn(&self, name: &str, construct_type: &str) -> Result<Urn> {
        let app = self
            .application
            .as_ref()
            .ok_or_else(|| Error::NoApplication(name.to_string()))?;
        Ok(Urn {
            resource_type: CONSTRUCT_TYPE.to_string(),
            subtype: construct_type.to_string(),
            resource_id: name.to_string(),
            ..app.app_urn()
        })
    }

    /// Declare a construct.
    ///
    /// Properties are classified once, bindings applied in order. A later
    /// declaration under the same name replaces the earlier one.
    pub fn new_construct(
        &mut self,
        name: &str,
        construct_type: &str,
        properties: IndexMap<String, Property>,
        bindings: Vec<BindingArgs>,
        options: IndexMap<String, Value>,
    ) -> Result<ConstructRef> {
        let urn = self.construct_urn(name, construct_type)?;
        let mut construct = Construct::new(
            name,
            construct_type,
            urn,
            &self.registry,
            properties,
            options,
        );
        for args in bindings {
            binding::add_binding(&mut construct, &self.registry, args)?;
        }

        let handle = construct.handle();
        if let Some(previous) = self.constructs.insert(name.to_string(), construct) {
            tracing::warn!(construct = %name, replaced = %previous.urn(), "construct redeclared");
        } else {
            tracing::debug!(construct = %name, urn = %handle.urn, "construct declared");
        }
        Ok(handle)
    }

    /// Bind `source` to another construct.
    pub fn add_binding(&mut self, source: &ConstructRef, args: BindingArgs) -> Result<()> {
        let construct = self
            .constructs
            .get_mut(&source.name)
            .filter(|c| c.urn() == &source.urn)
            .ok_or_else(|| Error::UnknownConstruct(source.urn.to_string()))?;
        binding::add_binding(construct, &self.registry, args)
    }

    /// Deferred value for an attribute of `construct` not yet known.
    ///
    /// Addressed at the construct's URN with `name` as output, and waiting on
    /// that same address. Asking twice returns the same output.
    pub fn output_of(&mut self, construct: &ConstructRef, name: &str) -> Result<Output> {
        let address = construct.urn.with_output(name).to_string();
        if let Some(existing) = self.registry.output(&address) {
            return Ok(existing);
        }
        self.registry.new_output(
            [address.clone()],
            Some(address),
            None,
            Combinator::Passthrough,
        )
    }

    /// Serialize the graph. Every construct still `new` becomes `pending`.
    pub fn to_ir(&mut self) -> Result<IrDocument> {
        let app = self
            .application
            .as_ref()
            .ok_or_else(|| Error::NoApplication("IR".to_string()))?;

        let mut constructs = IndexMap::new();
        for (name, construct) in &mut self.constructs {
            construct.advance(ConstructStatus::Pending);
            constructs.insert(name.clone(), construct.to_wire());
        }

        Ok(IrDocument {
            schema_version: SCHEMA_VERSION,
            version: IR_VERSION,
            project_urn: app.project_urn(),
            app_urn: app.app_urn(),
            environment: app.environment.clone(),
            default_region: app.default_region.clone(),
            constructs,
        })
    }

    /// Run one resolution round and relay the results into the constructs.
    ///
    /// Constructs named by `facts` record their outputs and become resolved.
    /// Pending inputs waiting on a reported attribute or a resolved output
    /// pick up the value. Inputs referencing a construct that reported see
    /// every output it has reported so far.
    pub fn resolve_round(&mut self, facts: &OutputFacts) -> Result<Vec<ResolvedOutput>> {
        let resolved = resolver::resolve_round(&mut self.registry, facts)?;

        for (urn, outputs) in facts {
            let Ok(urn) = Urn::parse(urn) else {
                continue;
            };
            let mut reported = outputs.clone();
            for construct in self.constructs.values_mut() {
                if construct.urn() == &urn {
                    construct.record_outputs(outputs);
                    reported = construct.outputs().clone();
                }
            }

            let reported: serde_yaml_ng::Mapping = reported
                .into_iter()
                .map(|(k, v)| (Value::String(k), v))
                .collect();
            let reported = Value::Mapping(reported);
            for construct in self.constructs.values_mut() {
                construct.refresh_references(&urn, &reported);
            }
            for (name, value) in outputs {
                self.relay(&urn.with_output(name).to_string(), value);
            }
        }
        for output in &resolved {
            self.relay(&output.id, &output.value);
        }

        Ok(resolved)
    }

    fn relay(&mut self, address: &str, value: &Value) {
        for construct in self.constructs.values_mut() {
            construct.resolve_inputs(address, value);
        }
    }
}
