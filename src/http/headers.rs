//! Header fields of a request or response.
//!
//! Names compare ASCII case-insensitively; entries keep arrival order and a name may
//! repeat (RFC 9110 §5.3).

/// Ordered header list with case-insensitive names.
///
/// Handlers append with [`insert`](Self::insert) when a field may repeat (`Set-Cookie`,
/// `Vary`) and use [`set`](Self::set) when the new value replaces whatever an earlier
/// handler put there.
///
/// # Examples
///
/// ```
/// use switchyard::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Accept-Encoding", "br");
/// headers.insert("accept-encoding", "gzip;q=0.8");
/// assert_eq!(headers.joined("ACCEPT-ENCODING").as_deref(), Some("br, gzip;q=0.8"));
///
/// headers.set("Accept-Encoding", "identity");
/// assert_eq!(headers.get("accept-encoding"), Some("identity"));
/// assert_eq!(headers.len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sized for a head parsed with a known field count.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// Appends `name: value`, keeping any earlier fields with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Drops every field called `name`, then appends `name: value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.fields.push((name, value.into()));
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).next()
    }

    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        self.fields
            .iter()
            .filter(move |(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Every value of `name` folded into one comma-separated list, the form list-valued
    /// fields such as `Accept-Encoding` are read in. `None` when the field is absent.
    pub fn joined(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self.get_all(name).collect();
        (!values.is_empty()).then(|| values.join(", "))
    }

    /// Returns `true` if anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.fields.len();
        self.fields.retain(|(field, _)| !field.eq_ignore_ascii_case(name));
        self.fields.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of fields, counting repeats.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields in arrival order, as serialized on the wire.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_name_case() {
        let mut h = Headers::new();
        h.insert("Content-Type", "application/json");
        assert_eq!(h.get("content-type"), Some("application/json"));
        assert!(h.contains("CONTENT-TYPE"));
        assert!(!h.contains("content-length"));
    }

    #[test]
    fn set_cookie_lines_stay_separate() {
        let mut h = Headers::new();
        h.insert("Set-Cookie", "sid=1; HttpOnly");
        h.insert("Set-Cookie", "theme=dark");
        let lines: Vec<_> = h.iter().map(|(_, v)| v).collect();
        assert_eq!(lines, vec!["sid=1; HttpOnly", "theme=dark"]);
    }

    #[test]
    fn set_collapses_earlier_values() {
        let mut h = Headers::new();
        h.insert("Vary", "Accept-Encoding");
        h.insert("vary", "Origin");
        h.set("VARY", "Cookie");
        assert_eq!(h.get_all("vary").collect::<Vec<_>>(), vec!["Cookie"]);
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn joined_folds_repeated_fields() {
        let mut h = Headers::new();
        assert_eq!(h.joined("accept-encoding"), None);
        h.insert("Accept-Encoding", "gzip");
        h.insert("accept-encoding", "deflate;q=0.5");
        assert_eq!(h.joined("accept-encoding").as_deref(), Some("gzip, deflate;q=0.5"));
    }

    #[test]
    fn remove_reports_whether_anything_went() {
        let mut h = Headers::new();
        h.insert("Content-Encoding", "gzip");
        assert!(h.remove("content-encoding"));
        assert!(h.is_empty());
        assert!(!h.remove("content-encoding"));
    }
}
