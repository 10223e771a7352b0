//! Best-effort conversions of loosely typed values for logs and JSON payloads.
//!
//! Both conversions never fail: a value whose text rendering fails is replaced by a placeholder
//! instead of aborting the whole conversion.

use std::fmt::{self, Display, Write};
use std::sync::Arc;

use serde_json::{Map, Value};

/// Substituted by [safe_for_json] for a value that cannot be rendered as text.
pub const CONVERSION_FAILED: &str = "<conversion to text failed>";

/// Returned by [repr_safe_str] for a value that cannot be rendered as text.
const UNPRINTABLE: &[u8] = b"<unprintable value>";

/// A loosely typed value, e.g. the payload or the arguments of a map task.
#[derive(Clone)]
pub enum Dynamic {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Dynamic>),
    Tuple(Vec<Dynamic>),
    Set(Vec<Dynamic>),
    /// Key/value pairs in insertion order, keys may be any value.
    Map(Vec<(Dynamic, Dynamic)>),
    /// Anything else, known only through its [Display] implementation.
    Object(Arc<dyn Display + Send + Sync>),
}

impl Dynamic {
    pub fn object<D>(value: D) -> Self
    where
        D: Display + Send + Sync + 'static,
    {
        Dynamic::Object(Arc::new(value))
    }

    pub fn map<K, V, It>(entries: It) -> Self
    where
        K: Into<Dynamic>,
        V: Into<Dynamic>,
        It: IntoIterator<Item = (K, V)>,
    {
        Dynamic::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Renders the value as text, failing only if an [Dynamic::Object] fails to render.
    pub fn render(&self) -> Result<String, fmt::Error> {
        let mut out = String::new();
        write!(out, "{self}")?;
        Ok(out)
    }

    fn render_or_marker(&self) -> String {
        self.render()
            .unwrap_or_else(|_| CONVERSION_FAILED.to_string())
    }
}

fn write_seq(
    f: &mut fmt::Formatter<'_>,
    open: &str,
    items: &[Dynamic],
    close: &str,
) -> fmt::Result {
    f.write_str(open)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write_nested(f, item)?;
    }
    f.write_str(close)
}

/// Text nested in a container is quoted so `["a, b"]` and `["a", "b"]` stay apart.
fn write_nested(f: &mut fmt::Formatter<'_>, value: &Dynamic) -> fmt::Result {
    match value {
        Dynamic::Text(s) => write!(f, "{s:?}"),
        other => write!(f, "{other}"),
    }
}

impl Display for Dynamic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dynamic::Null => f.write_str("null"),
            Dynamic::Bool(b) => write!(f, "{b}"),
            Dynamic::Int(i) => write!(f, "{i}"),
            Dynamic::Float(x) => write!(f, "{x}"),
            Dynamic::Text(s) => f.write_str(s),
            Dynamic::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
            Dynamic::List(items) => write_seq(f, "[", items, "]"),
            Dynamic::Tuple(items) => write_seq(f, "(", items, ")"),
            Dynamic::Set(items) => write_seq(f, "{", items, "}"),
            Dynamic::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write_nested(f, k)?;
                    f.write_str(": ")?;
                    write_nested(f, v)?;
                }
                f.write_str("}")
            }
            Dynamic::Object(obj) => write!(f, "{obj}"),
        }
    }
}

impl fmt::Debug for Dynamic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.render() {
            Ok(text) => write!(f, "Dynamic({text:?})"),
            Err(_) => f.write_str("Dynamic(<unprintable>)"),
        }
    }
}

impl From<bool> for Dynamic {
    fn from(value: bool) -> Self {
        Dynamic::Bool(value)
    }
}

impl From<i64> for Dynamic {
    fn from(value: i64) -> Self {
        Dynamic::Int(value)
    }
}

impl From<i32> for Dynamic {
    fn from(value: i32) -> Self {
        Dynamic::Int(i64::from(value))
    }
}

impl From<u32> for Dynamic {
    fn from(value: u32) -> Self {
        Dynamic::Int(i64::from(value))
    }
}

impl From<f64> for Dynamic {
    fn from(value: f64) -> Self {
        Dynamic::Float(value)
    }
}

impl From<&str> for Dynamic {
    fn from(value: &str) -> Self {
        Dynamic::Text(value.to_string())
    }
}

impl From<String> for Dynamic {
    fn from(value: String) -> Self {
        Dynamic::Text(value)
    }
}

impl From<&[u8]> for Dynamic {
    fn from(value: &[u8]) -> Self {
        Dynamic::Bytes(value.to_vec())
    }
}

impl<T: Into<Dynamic>> From<Vec<T>> for Dynamic {
    fn from(value: Vec<T>) -> Self {
        Dynamic::List(value.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Dynamic>> From<Option<T>> for Dynamic {
    fn from(value: Option<T>) -> Self {
        value.map_or(Dynamic::Null, Into::into)
    }
}

/// Returns a byte representation of `value` that is always safe to log.
///
/// Text is returned as its UTF-8 encoding and bytes are returned unchanged. Every other value is
/// rendered as text first.
pub fn repr_safe_str(value: &Dynamic) -> Vec<u8> {
    match value {
        Dynamic::Text(s) => s.as_bytes().to_vec(),
        Dynamic::Bytes(b) => b.clone(),
        other => other
            .render()
            .map(String::into_bytes)
            .unwrap_or_else(|_| UNPRINTABLE.to_vec()),
    }
}

/// Converts `value` into something [serde_json] can always serialize.
///
/// Lists, tuples and sets become arrays, maps become objects keyed by the text rendering of their
/// keys (a later duplicate key wins), text stays text and every other value becomes its text
/// rendering. A value that cannot be rendered becomes [CONVERSION_FAILED].
pub fn safe_for_json(value: &Dynamic) -> Value {
    match value {
        Dynamic::Text(s) => Value::String(s.clone()),
        Dynamic::List(items) | Dynamic::Tuple(items) | Dynamic::Set(items) => {
            Value::Array(items.iter().map(safe_for_json).collect())
        }
        Dynamic::Map(entries) => {
            let mut object = Map::with_capacity(entries.len());
            for (k, v) in entries {
                let key = match k {
                    Dynamic::Text(s) => s.clone(),
                    other => other.render_or_marker(),
                };
                object.insert(key, safe_for_json(v));
            }
            Value::Object(object)
        }
        other => Value::String(other.render_or_marker()),
    }
}
