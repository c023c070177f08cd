use std::fmt;

use super::codec::WideString;
use super::instance::Instance;

/// A dynamically typed value as it crosses the provider boundary.
///
/// The provider documents most numeric fields as 64-bit, but in practice it
/// hands back whatever width it likes (and sometimes decimal text), so
/// callers decode through [`crate::core::codec::variant_to_u64`] rather than
/// matching on a single variant.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Variant {
    #[default]
    Empty,
    Bool(bool),
    I2(i16),
    I4(i32),
    I8(i64),
    UI2(u16),
    UI4(u32),
    UI8(u64),
    Bstr(WideString),
    Object(Box<Instance>),
    Array(Vec<Variant>),
}

impl Variant {
    /// Wide-string variant from native text.
    pub fn text(s: &str) -> Self {
        Self::Bstr(WideString::new(s))
    }

    pub fn object(instance: Instance) -> Self {
        Self::Object(Box::new(instance))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Empty => "VT_EMPTY",
            Self::Bool(_) => "VT_BOOL",
            Self::I2(_) => "VT_I2",
            Self::I4(_) => "VT_I4",
            Self::I8(_) => "VT_I8",
            Self::UI2(_) => "VT_UI2",
            Self::UI4(_) => "VT_UI4",
            Self::UI8(_) => "VT_UI8",
            Self::Bstr(_) => "VT_BSTR",
            Self::Object(_) => "VT_UNKNOWN",
            Self::Array(_) => "VT_ARRAY",
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn as_bstr(&self) -> Option<&WideString> {
        match self {
            Self::Bstr(s) => Some(s),
            _ => None,
        }
    }

    /// Narrow text of a `VT_BSTR`; `None` for every other type.
    pub fn as_string(&self) -> Option<String> {
        self.as_bstr().map(WideString::to_string_lossy)
    }

    pub fn as_object(&self) -> Option<&Instance> {
        match self {
            Self::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Variant]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Signed reading of the integer variants, used for count fields.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I2(v) => Some(*v as i64),
            Self::I4(v) => Some(*v as i64),
            Self::I8(v) => Some(*v),
            Self::UI2(v) => Some(*v as i64),
            Self::UI4(v) => Some(*v as i64),
            Self::UI8(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "<empty>"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::I2(v) => write!(f, "{}", v),
            Self::I4(v) => write!(f, "{}", v),
            Self::I8(v) => write!(f, "{}", v),
            Self::UI2(v) => write!(f, "{}", v),
            Self::UI4(v) => write!(f, "{}", v),
            Self::UI8(v) => write!(f, "{}", v),
            Self::Bstr(s) => write!(f, "\"{}\"", s.to_string_lossy()),
            Self::Object(obj) => write!(f, "<{}>", obj.class()),
            Self::Array(items) => write!(f, "[{} items]", items.len()),
        }
    }
}

impl From<&str> for Variant {
    fn from(s: &str) -> Self {
        Self::text(s)
    }
}

impl From<u32> for Variant {
    fn from(v: u32) -> Self {
        Self::UI4(v)
    }
}

impl From<u64> for Variant {
    fn from(v: u64) -> Self {
        Self::UI8(v)
    }
}
