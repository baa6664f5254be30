//! GDB Machine Interface (MI) Type Definitions

use serde::Serialize;

/// GDB/MI result class types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

impl ResultClass {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "done" => Some(ResultClass::Done),
            "running" => Some(ResultClass::Running),
            "connected" => Some(ResultClass::Connected),
            "error" => Some(ResultClass::Error),
            "exit" => Some(ResultClass::Exit),
            _ => None,
        }
    }
}

/// GDB/MI value: a C-escaped string, a `{}` tuple, or a `[]` list.
///
/// Tuples keep insertion order so repeated parses of one line produce
/// identical structures.
#[derive(Debug, Clone, PartialEq)]
pub enum MiValue {
    String(String),
    Tuple(Vec<(String, MiValue)>),
    List(Vec<MiValue>),
}

impl MiValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MiValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[(String, MiValue)]> {
        match self {
            MiValue::Tuple(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[MiValue]> {
        match self {
            MiValue::List(l) => Some(l),
            _ => None,
        }
    }

    /// Look up a key in a tuple value.
    pub fn get(&self, key: &str) -> Option<&MiValue> {
        self.as_tuple()
            .and_then(|t| t.iter().find(|(k, _)| k == key).map(|(_, v)| v))
    }

    /// Parse a string value as an integer, accepting `0x` hex.
    pub fn as_u64(&self) -> Option<u64> {
        let s = self.as_str()?;
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u64::from_str_radix(hex, 16).ok()
        } else {
            s.parse().ok()
        }
    }
}

/// Convenience lookup over a record's top-level results.
pub fn find<'a>(results: &'a [(String, MiValue)], key: &str) -> Option<&'a MiValue> {
    results.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

/// The body of a `^` result record, as delivered to a command's caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub class: ResultClass,
    pub results: Vec<(String, MiValue)>,
}

impl ResultRecord {
    /// The `msg` field of an `^error` record, if any.
    pub fn error_msg(&self) -> Option<&str> {
        find(&self.results, "msg").and_then(|v| v.as_str())
    }

    pub fn is_error(&self) -> bool {
        self.class == ResultClass::Error
    }
}

/// Stream record kinds (`~` console, `@` target, `&` log).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Console,
    Target,
    Log,
}

/// One parsed line of GDB/MI output.
///
/// Async classes are carried as strings: the engine republishes every
/// out-of-band record to the front end rather than enumerating a closed set.
#[derive(Debug, Clone, PartialEq)]
pub enum MiRecord {
    Result {
        token: Option<u64>,
        class: ResultClass,
        results: Vec<(String, MiValue)>,
    },
    /// `*` exec-async record (`*stopped`, `*running`).
    ExecAsync {
        token: Option<u64>,
        class: String,
        results: Vec<(String, MiValue)>,
    },
    /// `=` notify-async record (`=breakpoint-modified`, ...).
    Notify {
        class: String,
        results: Vec<(String, MiValue)>,
    },
    Stream {
        kind: StreamKind,
        text: String,
    },
}
