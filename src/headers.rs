use std::fmt;

/// Pseudo-header carrying the status code through the codec.
pub(crate) const PSEUDO_STATUS: &str = ":status";
/// Pseudo-header carrying the reason phrase through the codec.
pub(crate) const PSEUDO_REASON: &str = ":reason";
/// Pseudo-header carrying the entity length decision through the codec.
///
/// `"*"` means streaming with unknown length, `"@"` means no body at all,
/// a decimal integer means identity framing with that many bytes.
pub(crate) const PSEUDO_ENTITY_LENGTH: &str = ":aerys-entity-length";

/// Ordered header multimap.
///
/// Field names are lowercased on insert and insertion order of fields is
/// preserved, so serialization is stable. Names starting with `:` are
/// pseudo-headers: in-pipeline metadata that is stripped before the
/// header block hits the wire. `http::HeaderMap` refuses such names,
/// which is why the response side carries its own table.
#[derive(Debug, Clone, Default)]
pub struct HeaderTable {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderTable {
    pub fn new() -> Self {
        HeaderTable::default()
    }

    fn position(&self, field: &str) -> Option<usize> {
        self.entries.iter().position(|(f, _)| f == field)
    }

    /// Append a value to the field's list.
    pub fn add(&mut self, field: &str, value: impl Into<String>) {
        let field = field.to_ascii_lowercase();
        let value = value.into();

        match self.position(&field) {
            Some(i) => self.entries[i].1.push(value),
            None => self.entries.push((field, vec![value])),
        }
    }

    /// Replace the field's list with exactly one value.
    pub fn set(&mut self, field: &str, value: impl Into<String>) {
        let field = field.to_ascii_lowercase();
        let value = value.into();

        match self.position(&field) {
            Some(i) => {
                let list = &mut self.entries[i].1;
                list.clear();
                list.push(value);
            }
            None => self.entries.push((field, vec![value])),
        }
    }

    /// First value for the field, if any.
    pub fn get(&self, field: &str) -> Option<&str> {
        let field = field.to_ascii_lowercase();
        self.position(&field)
            .and_then(|i| self.entries[i].1.first())
            .map(|s| s.as_str())
    }

    /// All values for the field in insertion order.
    pub fn get_all(&self, field: &str) -> &[String] {
        let field = field.to_ascii_lowercase();
        match self.position(&field) {
            Some(i) => &self.entries[i].1,
            None => &[],
        }
    }

    pub fn contains(&self, field: &str) -> bool {
        let field = field.to_ascii_lowercase();
        self.position(&field).is_some()
    }

    /// Remove the field entirely, returning its values.
    pub fn remove(&mut self, field: &str) -> Option<Vec<String>> {
        let field = field.to_ascii_lowercase();
        self.position(&field).map(|i| self.entries.remove(i).1)
    }

    /// Iterate `(field, value)` pairs, fields in insertion order, values
    /// in insertion order within each field.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(f, vs)| vs.iter().map(move |v| (f.as_str(), v.as_str())))
    }
}

/// A single cookie flag.
///
/// Bare flags render as `; value`, keyed flags as `; key=value`. Values
/// are emitted verbatim, no quoting or escaping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieFlag {
    Bare(String),
    Keyed(String, String),
}

impl CookieFlag {
    pub fn bare(v: impl Into<String>) -> Self {
        CookieFlag::Bare(v.into())
    }

    pub fn keyed(k: impl Into<String>, v: impl Into<String>) -> Self {
        CookieFlag::Keyed(k.into(), v.into())
    }
}

#[derive(Debug, Clone)]
pub struct Cookie {
    pub(crate) name: String,
    pub(crate) value: String,
    pub(crate) flags: Vec<CookieFlag>,
}

impl Cookie {
    pub(crate) fn new(name: String, value: String, flags: Vec<CookieFlag>) -> Self {
        Cookie { name, value, flags }
    }

    /// Render one `set-cookie` header value. Flags keep insertion order.
    pub(crate) fn render(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        for flag in &self.flags {
            match flag {
                CookieFlag::Bare(v) => {
                    out.push_str("; ");
                    out.push_str(v);
                }
                CookieFlag::Keyed(k, v) => {
                    out.push_str("; ");
                    out.push_str(k);
                    out.push('=');
                    out.push_str(v);
                }
            }
        }
        out
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}
