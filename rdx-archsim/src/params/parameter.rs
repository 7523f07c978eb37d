//! Typed parameter cells and the set declarations that create them.

use super::value::{DisplayBase, ParamConvert, ParamType, ParamValue};
use crate::error::{SimError, SimResult};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

/// A validation hook run against every newly assigned value.
pub type Validator = Rc<dyn Fn(&ParamValue) -> Result<(), String>>;

/// A typed parameter cell living under a `params` node.
#[derive(Clone)]
pub struct Parameter {
    name: String,
    doc: String,
    ptype: ParamType,
    default: ParamValue,
    value: ParamValue,
    base: DisplayBase,
    origin: String,
    read_count: Cell<u32>,
    write_count: u32,
    user_set: bool,
    ignored: Cell<bool>,
    volatile: bool,
    validators: Vec<Validator>,
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.name)
            .field("type", &self.ptype.name())
            .field("value", &self.value)
            .field("default", &self.default)
            .field("origin", &self.origin)
            .field("reads", &self.read_count.get())
            .field("writes", &self.write_count)
            .finish()
    }
}

impl Parameter {
    pub(crate) fn from_def(def: ParameterDef) -> Self {
        Self {
            name: def.name,
            doc: def.doc,
            ptype: def.ptype,
            value: def.default.clone(),
            default: def.default,
            base: def.base,
            origin: "default".into(),
            read_count: Cell::new(0),
            write_count: 0,
            user_set: false,
            ignored: Cell::new(false),
            volatile: def.volatile,
            validators: def.validators,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc(&self) -> &str {
        &self.doc
    }

    pub fn param_type(&self) -> &ParamType {
        &self.ptype
    }

    pub fn display_base(&self) -> DisplayBase {
        self.base
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn read_count(&self) -> u32 {
        self.read_count.get()
    }

    pub fn write_count(&self) -> u32 {
        self.write_count
    }

    pub fn is_volatile(&self) -> bool {
        self.volatile
    }

    pub fn is_ignored(&self) -> bool {
        self.ignored.get()
    }

    /// True once a user (configuration or API) assigned a value.
    pub fn was_set_by_user(&self) -> bool {
        self.user_set
    }

    pub fn is_default(&self) -> bool {
        self.value == self.default
    }

    /// Reads the value as `T`, counting the read.
    pub fn get<T: ParamConvert>(&self) -> SimResult<T> {
        let value = T::from_value(&self.value).ok_or_else(|| SimError::TypeMismatch {
            location: self.name.clone(),
            expected: T::param_type().name(),
            found: self.ptype.name(),
        })?;
        self.mark_read();
        Ok(value)
    }

    /// The raw value, counting the read.
    pub fn value(&self) -> &ParamValue {
        self.mark_read();
        &self.value
    }

    fn mark_read(&self) {
        self.read_count.set(self.read_count.get().saturating_add(1));
    }

    /// The raw value without counting a read.
    pub fn peek(&self) -> &ParamValue {
        &self.value
    }

    pub fn default_value(&self) -> &ParamValue {
        &self.default
    }

    /// Marks the parameter as consumed without reading it.
    pub fn ignore(&self) {
        self.ignored.set(true);
    }

    /// Renders the current value in this parameter's display base. Not a read.
    pub fn value_as_string(&self) -> String {
        self.value.render(self.base)
    }

    pub fn default_as_string(&self) -> String {
        self.default.render(self.base)
    }

    pub fn set<T: ParamConvert>(&mut self, value: T, origin: &str) -> SimResult<()> {
        self.assign(value.to_value(), origin)
    }

    pub fn set_from_string(&mut self, text: &str, origin: &str) -> SimResult<()> {
        let value = self.ptype.parse(text).map_err(|reason| SimError::TypeMismatch {
            location: self.name.clone(),
            expected: self.ptype.name(),
            found: reason,
        })?;
        self.assign(value, origin)
    }

    fn assign(&mut self, value: ParamValue, origin: &str) -> SimResult<()> {
        if !self.ptype.accepts(&value) {
            return Err(SimError::TypeMismatch {
                location: self.name.clone(),
                expected: self.ptype.name(),
                found: format!("{value:?}"),
            });
        }
        for validator in &self.validators {
            validator(&value).map_err(|reason| SimError::InvalidParameter {
                location: self.name.clone(),
                reason,
            })?;
        }
        self.value = value;
        self.origin = origin.to_string();
        self.write_count = self.write_count.saturating_add(1);
        self.user_set = true;
        Ok(())
    }

    /// Number of nested vector levels (0 for scalars).
    pub fn dimensionality(&self) -> usize {
        self.ptype.dimensionality()
    }

    /// Renders the element found at `indices` without counting a read.
    pub fn peek_item_value_as_string(&self, indices: &[usize]) -> Option<String> {
        self.value.item_at(indices).map(|v| v.render(self.base))
    }

    /// Length of the vector found at `indices`, or `None` if it is a scalar.
    pub fn peek_vector_size_at(&self, indices: &[usize]) -> Option<usize> {
        match self.value.item_at(indices)? {
            ParamValue::Vector(items) => Some(items.len()),
            _ => None,
        }
    }

    /// Set by a user, never read, not ignored and not volatile.
    pub fn is_unread(&self) -> bool {
        self.user_set && self.read_count.get() == 0 && !self.ignored.get() && !self.volatile
    }
}

/// Declaration of one parameter inside a [`ParameterSet`].
#[derive(Clone)]
pub struct ParameterDef {
    name: String,
    doc: String,
    ptype: ParamType,
    default: ParamValue,
    base: DisplayBase,
    volatile: bool,
    validators: Vec<Validator>,
}

impl ParameterDef {
    pub fn new<T: ParamConvert>(name: &str, default: T, doc: &str) -> Self {
        Self {
            name: name.to_string(),
            doc: doc.to_string(),
            ptype: T::param_type(),
            default: default.to_value(),
            base: DisplayBase::Dec,
            volatile: false,
            validators: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(mut self, base: DisplayBase) -> Self {
        self.base = base;
        self
    }

    pub fn volatile(mut self) -> Self {
        self.volatile = true;
        self
    }

    pub fn validate(mut self, check: impl Fn(&ParamValue) -> Result<(), String> + 'static) -> Self {
        self.validators.push(Rc::new(check));
        self
    }
}

/// An ordered list of parameter declarations, instantiated as a `params`
/// child node.
#[derive(Clone, Default)]
pub struct ParameterSet {
    defs: Vec<ParameterDef>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, def: ParameterDef) -> &mut Self {
        self.defs.push(def);
        self
    }

    pub fn param<T: ParamConvert>(&mut self, name: &str, default: T, doc: &str) -> &mut Self {
        self.add(ParameterDef::new(name, default, doc))
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub(crate) fn into_defs(self) -> Vec<ParameterDef> {
        self.defs
    }
}
