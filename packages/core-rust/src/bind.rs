//! Declarative binding of configuration maps into typed structs.
//!
//! A type opts in by implementing [`Bind`] and describing its fields with a
//! [`Schema`]. Each field carries a tag of the form `key[,required]`: the
//! first token is the lookup key at the current map level, the remaining
//! tokens may include the literal `required`.
//!
//! ```
//! use radian_core::{Bind, ConfigStore, Schema};
//!
//! #[derive(Default)]
//! struct Listener {
//!     host: String,
//!     port: u16,
//! }
//!
//! impl Bind for Listener {
//!     fn schema() -> Schema<Self> {
//!         Schema::new()
//!             .field("host", |c: &mut Self| &mut c.host)
//!             .field("port,required", |c: &mut Self| &mut c.port)
//!     }
//! }
//!
//! let mut store = ConfigStore::new();
//! store.set_value(&["port"], "8080").unwrap();
//!
//! let mut listener = Listener::default();
//! store.bind(&mut listener, false).unwrap();
//! assert_eq!(listener.port, 8080);
//! ```

use tracing::debug;

use crate::convert::{ConversionError, FromConfigValue};
use crate::value::{ConfigMap, ConfigValue};

/// Tag keyword marking a field as mandatory.
pub const REQUIRED_TAG: &str = "required";

/// Errors produced while binding a map into a struct.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BindError {
    #[error("field '{field}' is required")]
    MissingRequired { field: String },
    #[error("field '{field}': {source}")]
    Conversion {
        field: String,
        #[source]
        source: ConversionError,
    },
}

/// Parsed form of a `key[,required]` binding tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingTag {
    pub key: String,
    pub required: bool,
}

impl BindingTag {
    /// Parses a comma-separated tag. Tokens after the key other than
    /// `required` are ignored.
    #[must_use]
    pub fn parse(tag: &str) -> Self {
        let mut tokens = tag.split(',').map(str::trim);
        let key = tokens.next().unwrap_or_default().to_owned();
        let required = tokens.any(|t| t == REQUIRED_TAG);
        Self { key, required }
    }
}

type ApplyFn<T> = Box<dyn Fn(&mut T, &ConfigValue) -> Result<(), ConversionError> + Send + Sync>;

struct FieldBinding<T> {
    tag: BindingTag,
    apply: ApplyFn<T>,
}

/// Ordered list of field bindings for `T`.
pub struct Schema<T> {
    fields: Vec<FieldBinding<T>>,
}

impl<T: 'static> Schema<T> {
    #[must_use]
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Adds a field bound under `tag`. `accessor` projects the destination
    /// struct onto the field to fill.
    #[must_use]
    pub fn field<V>(mut self, tag: &str, accessor: fn(&mut T) -> &mut V) -> Self
    where
        V: FromConfigValue + 'static,
    {
        let apply: ApplyFn<T> = Box::new(move |target, value| {
            *accessor(target) = V::from_config_value(value)?;
            Ok(())
        });
        self.fields.push(FieldBinding {
            tag: BindingTag::parse(tag),
            apply,
        });
        self
    }

    /// Returns the parsed tags in declaration order.
    pub fn tags(&self) -> impl Iterator<Item = &BindingTag> {
        self.fields.iter().map(|f| &f.tag)
    }

    /// Fills `dest` from `map`.
    ///
    /// Absent keys leave the field untouched unless the field is required
    /// and `skip_required` is false. The first failing field aborts binding;
    /// fields bound before it keep their new values.
    ///
    /// # Errors
    ///
    /// [`BindError::MissingRequired`] for an absent required key,
    /// [`BindError::Conversion`] when a stored value does not convert.
    pub fn bind(&self, map: &ConfigMap, dest: &mut T, skip_required: bool) -> Result<(), BindError> {
        for field in &self.fields {
            let key = &field.tag.key;
            if key.is_empty() {
                continue;
            }

            let Some(value) = map.get(key) else {
                if field.tag.required && !skip_required {
                    return Err(BindError::MissingRequired { field: key.clone() });
                }
                debug!(field = %key, "field is not in config, skipping");
                continue;
            };

            (field.apply)(dest, value).map_err(|source| BindError::Conversion {
                field: key.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

impl<T: 'static> Default for Schema<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Types populated from configuration through a [`Schema`].
pub trait Bind: Sized + 'static {
    fn schema() -> Schema<Self>;
}
