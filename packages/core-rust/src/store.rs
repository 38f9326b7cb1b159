//! Hierarchical, path-addressed configuration store.
//!
//! The store is a tree of string-keyed maps merged from three sources:
//! - a JSON document (file or bytes), which **replaces** the whole tree
//! - environment variables `PREFIX_seg1_seg2=value`
//! - command-line arguments `-prefix-seg1-seg2=value`
//!
//! Environment and argument entries are last-write-wins per full path.
//! After the startup merge the store is read-only in practice and may be
//! shared across tasks.

use std::path::Path;

use tracing::{debug, error, warn};

use crate::bind::Bind;
use crate::error::ConfigError;
use crate::value::{ConfigMap, ConfigValue};

/// File loaded when a blank path is given.
pub const DEFAULT_CONFIG_PATH: &str = "config.json";
/// Environment variable prefix used when none is configured.
pub const DEFAULT_ENV_PREFIX: &str = "RADIAN";
/// Command-line argument prefix used when none is configured.
pub const DEFAULT_ARG_PREFIX: &str = "radian";

const ENV_SEGMENT_DELIMITER: char = '_';
const ARG_SEGMENT_DELIMITER: char = '-';

/// Nested string-keyed configuration tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigStore {
    root: ConfigMap,
}

impl ConfigStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing map.
    #[must_use]
    pub fn from_map(root: ConfigMap) -> Self {
        Self { root }
    }

    /// Returns the root map.
    #[must_use]
    pub fn as_map(&self) -> &ConfigMap {
        &self.root
    }

    #[must_use]
    pub fn into_map(self) -> ConfigMap {
        self.root
    }

    /// Parses a JSON object and replaces the whole tree with it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] if `bytes` is not a JSON object. The
    /// existing tree is left untouched in that case.
    pub fn load_from_json(&mut self, bytes: &[u8]) -> Result<(), ConfigError> {
        self.root = serde_json::from_slice(bytes)?;
        Ok(())
    }

    /// Reads a JSON file and replaces the whole tree with its content.
    ///
    /// A blank path falls back to [`DEFAULT_CONFIG_PATH`].
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, [`ConfigError::Json`]
    /// if it does not hold a JSON object.
    pub fn load_from_file(&mut self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let path = if path.as_os_str().to_string_lossy().trim().is_empty() {
            Path::new(DEFAULT_CONFIG_PATH)
        } else {
            path
        };

        let data = std::fs::read(path).map_err(|source| {
            warn!(path = %path.display(), error = %source, "cannot read configuration file");
            ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }
        })?;

        self.load_from_json(&data).inspect_err(|err| {
            error!(path = %path.display(), error = %err, "cannot apply configuration file");
        })
    }

    /// Merges process environment variables named `PREFIX_seg1_seg2...`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotAMap`] if a variable addresses a path
    /// through an existing scalar.
    ///
    /// Variables whose name or value is not valid UTF-8 are skipped.
    pub fn load_from_env(&mut self, prefix: &str) -> Result<usize, ConfigError> {
        let entries = std::env::vars_os().filter_map(|(key, value)| {
            match (key.into_string(), value.into_string()) {
                (Ok(key), Ok(value)) => Some(format!("{key}={value}")),
                (key, _) => {
                    debug!(variable = ?key, "skipping non UTF-8 environment variable");
                    None
                }
            }
        });
        self.load_from_vars(prefix, entries)
    }

    /// Merges `KEY=value` entries using the environment convention.
    ///
    /// Returns the number of entries applied.
    ///
    /// # Errors
    ///
    /// See [`load_from_env`](Self::load_from_env).
    pub fn load_from_vars<I, S>(&mut self, prefix: &str, vars: I) -> Result<usize, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let marker = format!("{prefix}{ENV_SEGMENT_DELIMITER}");
        self.load_entries(
            vars,
            |entry| entry.strip_prefix(marker.as_str()),
            ENV_SEGMENT_DELIMITER,
        )
    }

    /// Merges the process's command-line arguments (program name excluded).
    ///
    /// # Errors
    ///
    /// See [`load_from_args`](Self::load_from_args).
    ///
    /// Arguments that are not valid UTF-8 are skipped.
    pub fn load_from_process_args(&mut self, prefix: &str) -> Result<usize, ConfigError> {
        let args = std::env::args_os()
            .skip(1)
            .filter_map(|arg| arg.into_string().ok());
        self.load_from_args(prefix, args)
    }

    /// Merges arguments of the form `-prefix-seg1-seg2=value` (a leading
    /// `--` is accepted too). Non-matching arguments are ignored.
    ///
    /// Returns the number of arguments applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotAMap`] if an argument addresses a path
    /// through an existing scalar.
    pub fn load_from_args<I, S>(&mut self, prefix: &str, args: I) -> Result<usize, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.load_entries(
            args,
            |entry| config_arg_body(entry, prefix),
            ARG_SEGMENT_DELIMITER,
        )
    }

    fn load_entries<I, S, F>(
        &mut self,
        entries: I,
        strip: F,
        delimiter: char,
    ) -> Result<usize, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(&str) -> Option<&str>,
    {
        let mut applied = 0;
        for entry in entries {
            let entry = entry.as_ref();
            let Some(body) = strip(entry) else {
                continue;
            };
            let Some((key, value)) = body.split_once('=') else {
                debug!(entry, "configuration entry has no value, skipping");
                continue;
            };

            let path: Vec<&str> = key.split(delimiter).collect();
            self.set_value(&path, value)?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Returns a reference to the value at a non-empty `path`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::EmptyPath`] for an empty path, [`ConfigError::NotFound`]
    /// if any segment is absent, [`ConfigError::NotAMap`] if an intermediate
    /// segment is not a nested map.
    pub fn get<S: AsRef<str>>(&self, path: &[S]) -> Result<&ConfigValue, ConfigError> {
        let Some((last, parents)) = path.split_last() else {
            return Err(ConfigError::EmptyPath);
        };

        let mut node = &self.root;
        for (depth, segment) in parents.iter().enumerate() {
            match node.get(segment.as_ref()) {
                Some(ConfigValue::Map(child)) => node = child,
                Some(other) => {
                    return Err(ConfigError::NotAMap {
                        path: join_path(&path[..=depth]),
                        kind: other.kind(),
                    })
                }
                None => {
                    return Err(ConfigError::NotFound {
                        path: join_path(&path[..=depth]),
                    })
                }
            }
        }

        node.get(last.as_ref()).ok_or_else(|| ConfigError::NotFound {
            path: join_path(path),
        })
    }

    /// Returns a copy of the value at `path`; an empty path yields the whole
    /// tree as a [`ConfigValue::Map`].
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    pub fn get_value<S: AsRef<str>>(&self, path: &[S]) -> Result<ConfigValue, ConfigError> {
        if path.is_empty() {
            return Ok(ConfigValue::Map(self.root.clone()));
        }
        self.get(path).cloned()
    }

    /// Stores `value` at `path`, creating intermediate maps as needed.
    ///
    /// # Errors
    ///
    /// [`ConfigError::EmptyPath`] for an empty path, [`ConfigError::NotAMap`]
    /// if an intermediate segment exists but is not a nested map.
    pub fn set_value<S: AsRef<str>>(
        &mut self,
        path: &[S],
        value: impl Into<ConfigValue>,
    ) -> Result<(), ConfigError> {
        let Some((last, parents)) = path.split_last() else {
            return Err(ConfigError::EmptyPath);
        };

        let mut node = &mut self.root;
        for (depth, segment) in parents.iter().enumerate() {
            let entry = node
                .entry(segment.as_ref().to_owned())
                .or_insert_with(|| ConfigValue::Map(ConfigMap::new()));
            match entry {
                ConfigValue::Map(child) => node = child,
                other => {
                    return Err(ConfigError::NotAMap {
                        path: join_path(&path[..=depth]),
                        kind: other.kind(),
                    })
                }
            }
        }

        node.insert(last.as_ref().to_owned(), value.into());
        Ok(())
    }

    /// Returns an independent copy of the nested map at `path` as a new
    /// store. An empty path copies the whole tree.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get); additionally [`ConfigError::NotAMap`] if the
    /// addressed value is a scalar or sequence.
    pub fn get_subtree<S: AsRef<str>>(&self, path: &[S]) -> Result<ConfigStore, ConfigError> {
        if path.is_empty() {
            return Ok(self.clone());
        }
        match self.get(path)? {
            ConfigValue::Map(map) => Ok(Self::from_map(map.clone())),
            other => Err(ConfigError::NotAMap {
                path: join_path(path),
                kind: other.kind(),
            }),
        }
    }

    /// Binds the root map into `dest`.
    ///
    /// # Errors
    ///
    /// Propagates [`BindError`](crate::BindError) from the type's schema.
    pub fn bind<T: Bind>(&self, dest: &mut T, skip_required: bool) -> Result<(), crate::BindError> {
        T::schema().bind(&self.root, dest, skip_required)
    }

    /// Binds the nested map at `path` into `dest`.
    ///
    /// # Errors
    ///
    /// Path errors as in [`get_subtree`](Self::get_subtree), wrapped binding
    /// errors as [`ConfigError::Bind`].
    pub fn bind_path<T: Bind, S: AsRef<str>>(
        &self,
        path: &[S],
        dest: &mut T,
        skip_required: bool,
    ) -> Result<(), ConfigError> {
        if path.is_empty() {
            return Ok(self.bind(dest, skip_required)?);
        }
        match self.get(path)? {
            ConfigValue::Map(map) => Ok(T::schema().bind(map, dest, skip_required)?),
            other => Err(ConfigError::NotAMap {
                path: join_path(path),
                kind: other.kind(),
            }),
        }
    }
}

/// Returns the `seg1-seg2=value` body of a configuration argument, or `None`
/// if `arg` does not follow the `-prefix-...` convention.
#[must_use]
pub fn config_arg_body<'a>(arg: &'a str, prefix: &str) -> Option<&'a str> {
    let flag = arg
        .strip_prefix("--")
        .or_else(|| arg.strip_prefix(ARG_SEGMENT_DELIMITER))?;
    flag.strip_prefix(prefix)?
        .strip_prefix(ARG_SEGMENT_DELIMITER)
}

fn join_path<S: AsRef<str>>(path: &[S]) -> String {
    path.iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use proptest::prelude::*;

    use super::*;
    use crate::bind::{BindError, Schema};

    #[test]
    fn set_then_get_nested_value() {
        let mut store = ConfigStore::new();
        store.set_value(&["a", "b", "c"], 42).unwrap();

        assert_eq!(store.get_value(&["a", "b", "c"]).unwrap(), ConfigValue::Int(42));
        assert!(matches!(
            store.get_value(&["a", "x"]),
            Err(ConfigError::NotFound { .. })
        ));
    }

    #[test]
    fn empty_path_returns_whole_tree() {
        let mut store = ConfigStore::new();
        store.set_value(&["k"], "v").unwrap();

        let tree = store.get_value::<&str>(&[]).unwrap();
        assert_eq!(tree.as_map().unwrap()["k"], ConfigValue::from("v"));
    }

    #[test]
    fn empty_path_is_rejected_for_set() {
        let mut store = ConfigStore::new();
        assert!(matches!(
            store.set_value::<&str>(&[], 1),
            Err(ConfigError::EmptyPath)
        ));
    }

    #[test]
    fn intermediate_scalar_is_a_type_conflict() {
        let mut store = ConfigStore::new();
        store.set_value(&["db"], "postgres://").unwrap();

        let err = store.set_value(&["db", "host"], "x").unwrap_err();
        assert!(matches!(err, ConfigError::NotAMap { ref path, kind: "string" } if path == "db"));

        let err = store.get_value(&["db", "host"]).unwrap_err();
        assert!(matches!(err, ConfigError::NotAMap { .. }));
    }

    #[test]
    fn missing_intermediate_segment_is_not_found() {
        let mut store = ConfigStore::new();
        store.set_value(&["a", "b"], 1).unwrap();

        let err = store.get_value(&["x", "b"]).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { ref path } if path == "x"));
    }

    #[test]
    fn load_from_json_replaces_tree() {
        let mut store = ConfigStore::new();
        store.set_value(&["old"], 1).unwrap();
        store.load_from_json(br#"{"new": {"port": 8080}}"#).unwrap();

        assert!(store.get_value(&["old"]).is_err());
        assert_eq!(store.get_value(&["new", "port"]).unwrap(), ConfigValue::Int(8080));
    }

    #[test]
    fn invalid_json_leaves_tree_untouched() {
        let mut store = ConfigStore::new();
        store.set_value(&["keep"], true).unwrap();

        assert!(matches!(
            store.load_from_json(b"[1, 2]"),
            Err(ConfigError::Json(_))
        ));
        assert_eq!(store.get_value(&["keep"]).unwrap(), ConfigValue::Bool(true));
    }

    #[test]
    fn load_from_file_reads_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"monitoring": {"Listen": "0.0.0.0", "Port": 9090}}"#)
            .unwrap();

        let mut store = ConfigStore::new();
        store.load_from_file(file.path()).unwrap();
        assert_eq!(
            store.get_value(&["monitoring", "Port"]).unwrap(),
            ConfigValue::Int(9090)
        );
    }

    #[test]
    fn load_from_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConfigStore::new();
        let err = store
            .load_from_file(dir.path().join("absent.json"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn env_entries_encode_paths_with_underscores() {
        let mut store = ConfigStore::new();
        let applied = store
            .load_from_vars(
                "RADIAN",
                ["RADIAN_DB_HOST=localhost", "PATH=/usr/bin", "RADIANT_X=1"],
            )
            .unwrap();

        assert_eq!(applied, 1);
        assert_eq!(
            store.get_value(&["DB", "HOST"]).unwrap(),
            ConfigValue::from("localhost")
        );
        assert!(store.get_value(&["T"]).is_err());
    }

    #[test]
    fn env_values_keep_embedded_equals_signs() {
        let mut store = ConfigStore::new();
        store
            .load_from_vars("RADIAN", ["RADIAN_DB_DSN=user=admin"])
            .unwrap();
        assert_eq!(
            store.get_value(&["DB", "DSN"]).unwrap(),
            ConfigValue::from("user=admin")
        );
    }

    #[test]
    fn load_from_process_env() {
        std::env::set_var("RADIANTEST_SVC_PORT", "7070");
        let mut store = ConfigStore::new();
        store.load_from_env("RADIANTEST").unwrap();
        assert_eq!(
            store.get_value(&["SVC", "PORT"]).unwrap(),
            ConfigValue::from("7070")
        );
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_environment_is_skipped() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        std::env::set_var("RADIANUTF8_BAD", OsStr::from_bytes(b"\xff\xfe"));
        std::env::set_var(OsStr::from_bytes(b"RADIANUTF8_\xff"), "1");
        std::env::set_var("RADIANUTF8_SVC_PORT", "7070");

        let mut store = ConfigStore::new();
        assert_eq!(store.load_from_env("RADIANUTF8").unwrap(), 1);
        assert_eq!(
            store.get_value(&["SVC", "PORT"]).unwrap(),
            ConfigValue::from("7070")
        );
        assert!(store.get(&["BAD"]).is_err());
    }

    #[test]
    fn args_encode_paths_with_dashes() {
        let mut store = ConfigStore::new();
        let applied = store
            .load_from_args(
                "radian",
                [
                    "-radian-db-host=localhost",
                    "--radian-db-port=5432",
                    "--mode=all",
                    "-radian-flag",
                ],
            )
            .unwrap();

        assert_eq!(applied, 2);
        assert_eq!(
            store.get_value(&["db", "host"]).unwrap(),
            ConfigValue::from("localhost")
        );
        assert_eq!(
            store.get_value(&["db", "port"]).unwrap(),
            ConfigValue::from("5432")
        );
    }

    #[test]
    fn later_sources_override_by_full_path() {
        let mut store = ConfigStore::new();
        store
            .load_from_json(br#"{"db": {"host": "file", "port": 1}}"#)
            .unwrap();
        store
            .load_from_vars("RADIAN", ["RADIAN_db_host=env"])
            .unwrap();

        assert_eq!(store.get_value(&["db", "host"]).unwrap(), ConfigValue::from("env"));
        assert_eq!(store.get_value(&["db", "port"]).unwrap(), ConfigValue::Int(1));
    }

    #[test]
    fn subtree_is_a_copy() {
        let mut store = ConfigStore::new();
        store.set_value(&["svc", "port"], 1).unwrap();

        let mut sub = store.get_subtree(&["svc"]).unwrap();
        sub.set_value(&["port"], 2).unwrap();

        assert_eq!(store.get_value(&["svc", "port"]).unwrap(), ConfigValue::Int(1));
        assert_eq!(sub.get_value(&["port"]).unwrap(), ConfigValue::Int(2));
        assert!(matches!(
            store.get_subtree(&["svc", "port"]),
            Err(ConfigError::NotAMap { .. })
        ));
    }

    #[derive(Default)]
    struct Service {
        port: i64,
    }

    impl Bind for Service {
        fn schema() -> Schema<Self> {
            Schema::new().field("port,required", |s: &mut Self| &mut s.port)
        }
    }

    #[test]
    fn bind_path_converts_env_strings() {
        let mut store = ConfigStore::new();
        store.load_from_vars("RADIAN", ["RADIAN_svc_port=8080"]).unwrap();

        let mut svc = Service::default();
        store.bind_path(&["svc"], &mut svc, false).unwrap();
        assert_eq!(svc.port, 8080);

        store.set_value(&["svc", "port"], "notanumber").unwrap();
        let err = store.bind_path(&["svc"], &mut svc, false).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Bind(BindError::Conversion { ref field, .. }) if field == "port"
        ));
    }

    #[test]
    fn config_arg_body_matches_both_dash_forms() {
        assert_eq!(config_arg_body("-radian-a-b=1", "radian"), Some("a-b=1"));
        assert_eq!(config_arg_body("--radian-a=1", "radian"), Some("a=1"));
        assert_eq!(config_arg_body("-radians-a=1", "radian"), None);
        assert_eq!(config_arg_body("radian-a=1", "radian"), None);
    }

    proptest! {
        #[test]
        fn set_get_round_trip(
            path in proptest::collection::vec("[a-z]{1,6}", 1..5),
            value in any::<i64>(),
        ) {
            let mut store = ConfigStore::new();
            store.set_value(&path[..], value).unwrap();
            prop_assert_eq!(store.get_value(&path[..]).unwrap(), ConfigValue::Int(value));
        }
    }
}
