//! Radian core: hierarchical configuration store and declarative struct binding.

pub mod bind;
pub mod convert;
pub mod error;
pub mod store;
pub mod value;

pub use bind::{Bind, BindError, BindingTag, Schema, REQUIRED_TAG};
pub use convert::{ConversionError, FromConfigValue};
pub use error::ConfigError;
pub use store::{
    config_arg_body, ConfigStore, DEFAULT_ARG_PREFIX, DEFAULT_CONFIG_PATH, DEFAULT_ENV_PREFIX,
};
pub use value::{ConfigMap, ConfigValue};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
