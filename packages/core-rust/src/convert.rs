//! Conversion from untyped [`ConfigValue`] nodes into typed struct fields.
//!
//! Rules, in priority order:
//! 1. Sequence fields (`Vec<T>`) are filled element-wise from an array.
//! 2. Numeric and boolean fields accept either the native scalar or a
//!    string that parses exactly with the standard `FromStr` parser.
//! 3. Everything else requires the stored kind to match the field kind.

use crate::value::ConfigValue;

/// Failure converting one stored value into a field's declared type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConversionError {
    #[error("expected {expected}, found {found}")]
    KindMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("cannot parse {value:?} as {expected}")]
    Parse {
        value: String,
        expected: &'static str,
    },
    #[error("value {value} is out of range for {expected}")]
    OutOfRange {
        value: String,
        expected: &'static str,
    },
    #[error("element {index}: {source}")]
    Element {
        index: usize,
        #[source]
        source: Box<ConversionError>,
    },
}

/// Types that can be populated from a configuration value.
pub trait FromConfigValue: Sized {
    /// Converts `value` into `Self`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConversionError`] when the stored kind is incompatible or
    /// a string does not parse.
    fn from_config_value(value: &ConfigValue) -> Result<Self, ConversionError>;
}

fn parse_str<T: std::str::FromStr>(s: &str, expected: &'static str) -> Result<T, ConversionError> {
    s.parse().map_err(|_| ConversionError::Parse {
        value: s.to_owned(),
        expected,
    })
}

macro_rules! impl_from_config_int {
    ($($ty:ty),* $(,)?) => {$(
        impl FromConfigValue for $ty {
            fn from_config_value(value: &ConfigValue) -> Result<Self, ConversionError> {
                let expected = stringify!($ty);
                match value {
                    ConfigValue::Int(i) => <$ty>::try_from(*i).map_err(|_| {
                        ConversionError::OutOfRange { value: i.to_string(), expected }
                    }),
                    ConfigValue::Float(f) => {
                        // Whole floats only: 8080.0 binds, 80.5 does not. `i64::MAX as f64`
                        // rounds up to 2^63, which is itself out of range.
                        #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
                        let in_range = f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64;
                        if !in_range {
                            return Err(ConversionError::OutOfRange { value: f.to_string(), expected });
                        }
                        #[allow(clippy::cast_possible_truncation)]
                        let whole = *f as i64;
                        <$ty>::try_from(whole).map_err(|_| {
                            ConversionError::OutOfRange { value: f.to_string(), expected }
                        })
                    }
                    ConfigValue::String(s) => parse_str(s, expected),
                    other => Err(ConversionError::KindMismatch { expected, found: other.kind() }),
                }
            }
        }
    )*};
}

impl_from_config_int!(i8, i16, i32, i64, u8, u16, u32, u64, usize);

impl FromConfigValue for f64 {
    fn from_config_value(value: &ConfigValue) -> Result<Self, ConversionError> {
        match value {
            ConfigValue::Float(f) => Ok(*f),
            #[allow(clippy::cast_precision_loss)]
            ConfigValue::Int(i) => Ok(*i as f64),
            ConfigValue::String(s) => parse_str(s, "f64"),
            other => Err(ConversionError::KindMismatch {
                expected: "f64",
                found: other.kind(),
            }),
        }
    }
}

impl FromConfigValue for f32 {
    fn from_config_value(value: &ConfigValue) -> Result<Self, ConversionError> {
        match value {
            ConfigValue::String(s) => parse_str(s, "f32"),
            other => {
                let wide = f64::from_config_value(other).map_err(|err| match err {
                    ConversionError::KindMismatch { found, .. } => ConversionError::KindMismatch {
                        expected: "f32",
                        found,
                    },
                    err => err,
                })?;
                #[allow(clippy::cast_possible_truncation)]
                Ok(wide as f32)
            }
        }
    }
}

impl FromConfigValue for bool {
    fn from_config_value(value: &ConfigValue) -> Result<Self, ConversionError> {
        match value {
            ConfigValue::Bool(b) => Ok(*b),
            ConfigValue::String(s) => parse_str(s, "bool"),
            other => Err(ConversionError::KindMismatch {
                expected: "bool",
                found: other.kind(),
            }),
        }
    }
}

impl FromConfigValue for String {
    fn from_config_value(value: &ConfigValue) -> Result<Self, ConversionError> {
        match value {
            ConfigValue::String(s) => Ok(s.clone()),
            other => Err(ConversionError::KindMismatch {
                expected: "string",
                found: other.kind(),
            }),
        }
    }
}

impl<T: FromConfigValue> FromConfigValue for Vec<T> {
    fn from_config_value(value: &ConfigValue) -> Result<Self, ConversionError> {
        let ConfigValue::Array(items) = value else {
            return Err(ConversionError::KindMismatch {
                expected: "array",
                found: value.kind(),
            });
        };

        items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                T::from_config_value(item).map_err(|source| ConversionError::Element {
                    index,
                    source: Box::new(source),
                })
            })
            .collect()
    }
}

impl<T: FromConfigValue> FromConfigValue for Option<T> {
    fn from_config_value(value: &ConfigValue) -> Result<Self, ConversionError> {
        match value {
            ConfigValue::Null => Ok(None),
            other => T::from_config_value(other).map(Some),
        }
    }
}

impl FromConfigValue for ConfigValue {
    fn from_config_value(value: &ConfigValue) -> Result<Self, ConversionError> {
        Ok(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_from_native_and_string() {
        assert_eq!(u16::from_config_value(&ConfigValue::Int(8080)), Ok(8080));
        assert_eq!(u16::from_config_value(&ConfigValue::from("8080")), Ok(8080));
        assert_eq!(i64::from_config_value(&ConfigValue::Float(3.0)), Ok(3));
    }

    #[test]
    fn integer_rejects_garbage_overflow_and_fractions() {
        assert!(matches!(
            u16::from_config_value(&ConfigValue::from("notanumber")),
            Err(ConversionError::Parse { .. })
        ));
        assert!(matches!(
            u8::from_config_value(&ConfigValue::Int(300)),
            Err(ConversionError::OutOfRange { .. })
        ));
        assert!(matches!(
            i32::from_config_value(&ConfigValue::Float(1.5)),
            Err(ConversionError::OutOfRange { .. })
        ));
        assert!(matches!(
            i64::from_config_value(&ConfigValue::Float(9_223_372_036_854_775_808.0)),
            Err(ConversionError::OutOfRange { .. })
        ));
        assert!(matches!(
            i64::from_config_value(&ConfigValue::Float(9.3e18)),
            Err(ConversionError::OutOfRange { .. })
        ));
        assert_eq!(
            i64::from_config_value(&ConfigValue::Float(-9_223_372_036_854_775_808.0)),
            Ok(i64::MIN)
        );
        // Exact parse only: surrounding whitespace is not tolerated.
        assert!(u16::from_config_value(&ConfigValue::from(" 80")).is_err());
    }

    #[test]
    fn bool_accepts_native_and_exact_strings() {
        assert_eq!(bool::from_config_value(&ConfigValue::Bool(true)), Ok(true));
        assert_eq!(bool::from_config_value(&ConfigValue::from("false")), Ok(false));
        assert!(bool::from_config_value(&ConfigValue::from("yes")).is_err());
        assert!(bool::from_config_value(&ConfigValue::Int(1)).is_err());
    }

    #[test]
    fn string_requires_string_kind() {
        assert_eq!(
            String::from_config_value(&ConfigValue::from("host")),
            Ok("host".to_string())
        );
        assert_eq!(
            String::from_config_value(&ConfigValue::Int(1)),
            Err(ConversionError::KindMismatch {
                expected: "string",
                found: "integer"
            })
        );
    }

    #[test]
    fn vec_converts_element_wise_and_reports_index() {
        let value = ConfigValue::Array(vec![ConfigValue::Int(1), ConfigValue::from("2")]);
        assert_eq!(Vec::<u32>::from_config_value(&value), Ok(vec![1, 2]));

        let bad = ConfigValue::Array(vec![ConfigValue::Int(1), ConfigValue::from("x")]);
        let err = Vec::<u32>::from_config_value(&bad).unwrap_err();
        assert!(matches!(err, ConversionError::Element { index: 1, .. }));

        assert!(Vec::<u32>::from_config_value(&ConfigValue::from("1,2")).is_err());
    }

    #[test]
    fn option_maps_null_to_none() {
        assert_eq!(Option::<u16>::from_config_value(&ConfigValue::Null), Ok(None));
        assert_eq!(
            Option::<u16>::from_config_value(&ConfigValue::Int(7)),
            Ok(Some(7))
        );
    }

    #[test]
    fn floats_accept_integers_and_strings() {
        assert_eq!(f64::from_config_value(&ConfigValue::Int(2)), Ok(2.0));
        assert_eq!(f32::from_config_value(&ConfigValue::from("0.5")), Ok(0.5));
        assert!(matches!(
            f32::from_config_value(&ConfigValue::Bool(true)),
            Err(ConversionError::KindMismatch { expected: "f32", .. })
        ));
    }
}
