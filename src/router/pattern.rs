//! Route pattern compiler.
//!
//! A path template is tokenized into literal runs and named captures, then compiled into
//! an anchored regular expression:
//!
//! | Template            | Matcher   | Compiled expression                      |
//! |---------------------|-----------|------------------------------------------|
//! | `/users`            | literal   | *(exact comparison with `users`)*        |
//! | `/users/:id`        | pattern   | `(?s)^users/(?P<id>[^/]+?)$`             |
//! | `/files/:{name}.txt`| pattern   | `(?s)^files/(?P<name>[^/]+?)\.txt$`      |
//!
//! Templates are compared against the request path with its leading slash removed, so the
//! leading slash of a template is dropped at compile time. A placeholder is `:` followed by
//! a name (`[A-Za-z_][A-Za-z0-9_]*`) or by a braced name (`:{name}`); any other `:` is a
//! literal character.

use std::fmt::Write as _;

use regex::Regex;
use regex_syntax::ast::parse::Parser;
use regex_syntax::ast::{Ast, Flag, Flags, FlagsItemKind, GroupKind};

use crate::error::ConfigurationError;

/// The path half of a route registration: a template string or a raw expression.
///
/// Raw expressions are used as given. They are not anchored, and their named groups
/// become path parameters.
#[derive(Debug, Clone)]
pub enum PathSpec {
    Template(String),
    Regex(Regex),
}

impl From<&str> for PathSpec {
    fn from(template: &str) -> Self {
        Self::Template(template.to_owned())
    }
}

impl From<String> for PathSpec {
    fn from(template: String) -> Self {
        Self::Template(template)
    }
}

impl From<Regex> for PathSpec {
    fn from(regex: Regex) -> Self {
        Self::Regex(regex)
    }
}

/// Per-route registration options.
///
/// # Examples
///
/// ```
/// use switchyard::router::RouteOptions;
///
/// let opts = RouteOptions::new().param("id", "^[0-9]+$");
/// ```
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    params: Vec<(String, String)>,
}

impl RouteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires the captured value of `name` to match `validator`.
    ///
    /// The validator is applied to the captured value on its own; anchor it (`^…$`) to
    /// constrain the whole value.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, validator: impl Into<String>) -> Self {
        self.params.push((name.into(), validator.into()));
        self
    }
}

// One lexical piece of a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token {
    Literal(String),
    Capture(String),
}

/// A named capture and the validator its value must satisfy, if any.
#[derive(Debug, Clone)]
pub(crate) struct ParamSpec {
    name: String,
    validator: Option<Regex>,
}

/// A compiled expression matcher.
#[derive(Debug, Clone)]
pub(crate) struct CompiledPattern {
    tokens: Vec<Token>,
    regex: Regex,
    params: Vec<ParamSpec>,
}

impl CompiledPattern {
    #[cfg(test)]
    pub(crate) fn regex(&self) -> &Regex {
        &self.regex
    }

    // Runs the expression, then every validator; any failure disqualifies the route.
    fn captures(&self, candidate: &str) -> Option<Vec<(String, String)>> {
        let caps = self.regex.captures(candidate)?;
        let mut out = Vec::with_capacity(self.params.len());

        for param in &self.params {
            match caps.name(&param.name) {
                Some(value) => {
                    if let Some(validator) = &param.validator {
                        if !validator.is_match(value.as_str()) {
                            return None;
                        }
                    }
                    out.push((param.name.clone(), value.as_str().to_owned()));
                }
                None if param.validator.is_some() => return None,
                None => {}
            }
        }

        Some(out)
    }
}

/// A compiled route matcher. Immutable once built.
#[derive(Debug, Clone)]
pub(crate) enum Matcher {
    /// Exact comparison with the slash-stripped candidate path.
    Literal(String),
    /// Expression with named captures and optional per-capture validators.
    Pattern(CompiledPattern),
}

impl Matcher {
    /// Tests `candidate` (leading slash already removed).
    ///
    /// Returns the captured parameters on a qualifying match; literal matches capture
    /// nothing.
    pub(crate) fn matches(&self, candidate: &str) -> Option<Vec<(String, String)>> {
        match self {
            Matcher::Literal(literal) => (literal == candidate).then(Vec::new),
            Matcher::Pattern(pattern) => pattern.captures(candidate),
        }
    }

    /// Human-readable form used in logs.
    pub(crate) fn describe(&self) -> String {
        match self {
            Matcher::Literal(literal) => format!("/{literal}"),
            Matcher::Pattern(pattern) if pattern.tokens.is_empty() => {
                pattern.regex.as_str().to_owned()
            }
            Matcher::Pattern(pattern) => {
                let mut out = String::from("/");
                for token in &pattern.tokens {
                    match token {
                        Token::Literal(s) => out.push_str(s),
                        Token::Capture(name) => {
                            let _ = write!(out, ":{{{name}}}");
                        }
                    }
                }
                out
            }
        }
    }
}

/// Compiles a path spec plus its options into a [`Matcher`].
///
/// Compilation is deterministic and has no side effects.
///
/// # Errors
///
/// Returns a [`ConfigurationError`] if a validator does not compile, carries a
/// case-insensitive flag, or names a parameter the path does not declare, or if the
/// template repeats a placeholder name.
pub(crate) fn compile(spec: &PathSpec, options: &RouteOptions) -> Result<Matcher, ConfigurationError> {
    let (tokens, regex) = match spec {
        PathSpec::Template(template) => {
            let tokens = tokenize(template);

            if !tokens.iter().any(|t| matches!(t, Token::Capture(_))) {
                if let Some((name, _)) = options.params.first() {
                    return Err(ConfigurationError::UnknownParameter { name: name.clone() });
                }
                return Ok(Matcher::Literal(normalize(template).to_owned()));
            }

            let regex = build_expression(template, &tokens)?;
            (tokens, regex)
        }
        PathSpec::Regex(regex) => (Vec::new(), regex.clone()),
    };

    let mut params: Vec<ParamSpec> = regex
        .capture_names()
        .flatten()
        .map(|name| ParamSpec {
            name: name.to_owned(),
            validator: None,
        })
        .collect();

    for (name, source) in &options.params {
        let slot = params
            .iter_mut()
            .find(|p| &p.name == name)
            .ok_or_else(|| ConfigurationError::UnknownParameter { name: name.clone() })?;

        if is_case_insensitive(source) {
            return Err(ConfigurationError::CaseInsensitiveValidator { name: name.clone() });
        }

        let validator =
            Regex::new(source).map_err(|source| ConfigurationError::InvalidValidator {
                name: name.clone(),
                source,
            })?;
        slot.validator = Some(validator);
    }

    Ok(Matcher::Pattern(CompiledPattern {
        tokens,
        regex,
        params,
    }))
}

/// Number of leading path segments a mount template consumes.
///
/// Counted once, at registration: separators in the slash-stripped template plus one. An
/// empty template (mount at `/`) consumes nothing.
pub(crate) fn segment_count(spec: &PathSpec) -> usize {
    match spec {
        PathSpec::Template(template) => {
            let template = normalize(template);
            if template.is_empty() {
                0
            } else {
                template.matches('/').count() + 1
            }
        }
        PathSpec::Regex(regex) => regex.as_str().matches('/').count() + 1,
    }
}

fn normalize(template: &str) -> &str {
    template.strip_prefix('/').unwrap_or(template)
}

// Splits a template into literal runs and placeholder names.
pub(crate) fn tokenize(template: &str) -> Vec<Token> {
    let template = normalize(template);
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = template.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c != ':' {
            literal.push(c);
            continue;
        }

        let rest = &template[i + 1..];
        let name = if let Some(braced) = rest.strip_prefix('{') {
            braced
                .find('}')
                .map(|end| &braced[..end])
                .filter(|name| is_param_name(name))
                .map(|name| (name, name.len() + 2))
        } else {
            let len = rest
                .char_indices()
                .find(|(_, ch)| !(ch.is_ascii_alphanumeric() || *ch == '_'))
                .map(|(idx, _)| idx)
                .unwrap_or(rest.len());
            Some(&rest[..len])
                .filter(|name| is_param_name(name))
                .map(|name| (name, name.len()))
        };

        match name {
            Some((name, consumed)) => {
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                tokens.push(Token::Capture(name.to_owned()));
                for _ in 0..consumed {
                    chars.next();
                }
            }
            None => literal.push(c),
        }
    }

    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    tokens
}

fn is_param_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn build_expression(template: &str, tokens: &[Token]) -> Result<Regex, ConfigurationError> {
    let mut seen: Vec<&str> = Vec::new();
    let mut expr = String::from("(?s)^");

    for token in tokens {
        match token {
            Token::Literal(s) => expr.push_str(&regex::escape(s)),
            Token::Capture(name) => {
                if seen.contains(&name.as_str()) {
                    return Err(ConfigurationError::DuplicateParameter {
                        name: name.clone(),
                        template: template.to_owned(),
                    });
                }
                seen.push(name);
                let _ = write!(expr, "(?P<{name}>[^/]+?)");
            }
        }
    }
    expr.push('$');

    Regex::new(&expr).map_err(|source| ConfigurationError::InvalidTemplate {
        template: template.to_owned(),
        source,
    })
}

// True when any inline flag group turns `i` on, e.g. `(?i)` or `(?mi:...)`. Sources that
// do not parse are left to `Regex::new` to report.
fn is_case_insensitive(source: &str) -> bool {
    Parser::new()
        .parse(source)
        .is_ok_and(|ast| enables_case_insensitive(&ast))
}

fn enables_case_insensitive(ast: &Ast) -> bool {
    match ast {
        Ast::Flags(set) => sets_case_insensitive(&set.flags),
        Ast::Group(group) => {
            matches!(&group.kind, GroupKind::NonCapturing(flags) if sets_case_insensitive(flags))
                || enables_case_insensitive(&group.ast)
        }
        Ast::Repetition(rep) => enables_case_insensitive(&rep.ast),
        Ast::Alternation(alt) => alt.asts.iter().any(enables_case_insensitive),
        Ast::Concat(concat) => concat.asts.iter().any(enables_case_insensitive),
        _ => false,
    }
}

fn sets_case_insensitive(flags: &Flags) -> bool {
    let mut negated = false;
    for item in &flags.items {
        match &item.kind {
            FlagsItemKind::Negation => negated = true,
            FlagsItemKind::Flag(Flag::CaseInsensitive) if !negated => return true,
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(t: &str) -> Matcher {
        compile(&PathSpec::from(t), &RouteOptions::new()).unwrap()
    }

    // ── tokenize ──────────────────────────────────────────────────────────────

    #[test]
    fn tokenize_plain_and_braced_placeholders() {
        assert_eq!(
            tokenize("/users/:id/files/:{name}.txt"),
            vec![
                Token::Literal("users/".into()),
                Token::Capture("id".into()),
                Token::Literal("/files/".into()),
                Token::Capture("name".into()),
                Token::Literal(".txt".into()),
            ]
        );
    }

    #[test]
    fn tokenize_colon_without_name_is_literal() {
        assert_eq!(
            tokenize("/host:8080/a:"),
            vec![Token::Literal("host:8080/a:".into())]
        );
    }

    // ── compile ───────────────────────────────────────────────────────────────

    #[test]
    fn template_without_placeholders_is_literal() {
        assert!(matches!(template("/users"), Matcher::Literal(s) if s == "users"));
        assert!(matches!(template("/"), Matcher::Literal(s) if s.is_empty()));
    }

    #[test]
    fn template_with_placeholder_is_pattern() {
        match template("/user/:id") {
            Matcher::Pattern(p) => assert_eq!(p.regex().as_str(), "(?s)^user/(?P<id>[^/]+?)$"),
            other => panic!("expected pattern, got {other:?}"),
        }
    }

    #[test]
    fn literal_characters_are_escaped() {
        let m = template("/v1.0/:id");
        assert!(m.matches("v1.0/7").is_some());
        assert!(m.matches("v1x0/7").is_none());
    }

    #[test]
    fn compilation_is_deterministic() {
        assert_eq!(template("/a/:b").describe(), template("/a/:b").describe());
    }

    #[test]
    fn case_insensitive_validator_is_rejected() {
        let err = compile(
            &PathSpec::from("/user/:id"),
            &RouteOptions::new().param("id", "(?i)^abc$"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::CaseInsensitiveValidator { name } if name == "id"));
    }

    #[test]
    fn escaped_paren_is_not_a_flag_group() {
        assert!(!is_case_insensitive(r"^\(?i$"));
        assert!(is_case_insensitive("^(?mi:x)$"));
        assert!(!is_case_insensitive("^(?m-i:x)$"));
    }

    #[test]
    fn flag_text_inside_a_class_is_literal() {
        assert!(!is_case_insensitive("^[(?i)]+$"));
        assert!(is_case_insensitive("^(a|(?i:b))+$"));

        let m = compile(
            &PathSpec::from("/tag/:t"),
            &RouteOptions::new().param("t", "^[(?i)]+$"),
        )
        .unwrap();
        assert!(m.matches("tag/(i)").is_some());
        assert!(m.matches("tag/abc").is_none());
    }

    #[test]
    fn invalid_validator_is_rejected() {
        let err = compile(
            &PathSpec::from("/user/:id"),
            &RouteOptions::new().param("id", "[0-9"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValidator { .. }));
    }

    #[test]
    fn validator_for_undeclared_parameter_is_rejected() {
        let err = compile(
            &PathSpec::from("/user/:id"),
            &RouteOptions::new().param("uid", "^[0-9]+$"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownParameter { name } if name == "uid"));
    }

    #[test]
    fn duplicate_placeholder_is_rejected() {
        let err = compile(&PathSpec::from("/:id/:id"), &RouteOptions::new()).unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateParameter { .. }));
    }

    // ── matches ───────────────────────────────────────────────────────────────

    #[test]
    fn literal_requires_exact_equality() {
        let m = template("/users");
        assert!(m.matches("users").is_some());
        assert!(m.matches("users/").is_none());
        assert!(m.matches("posts").is_none());
    }

    #[test]
    fn pattern_extracts_named_values() {
        let params = template("/user/:id").matches("user/42").unwrap();
        assert_eq!(params, vec![("id".to_owned(), "42".to_owned())]);
    }

    #[test]
    fn placeholder_does_not_cross_slashes() {
        let m = template("/user/:id");
        assert!(m.matches("user/42/extra").is_none());
        assert!(m.matches("user/").is_none());
    }

    #[test]
    fn validator_failure_disqualifies_route() {
        let m = compile(
            &PathSpec::from("/user/:id"),
            &RouteOptions::new().param("id", "^[0-9]+$"),
        )
        .unwrap();
        assert!(m.matches("user/x").is_none());
        assert!(m.matches("user/12").is_some());
    }

    #[test]
    fn raw_expression_groups_become_params() {
        let spec = PathSpec::from(Regex::new(r"^post/(?P<slug>[a-z-]+)$").unwrap());
        let m = compile(&spec, &RouteOptions::new()).unwrap();
        let params = m.matches("post/hello-world").unwrap();
        assert_eq!(params, vec![("slug".to_owned(), "hello-world".to_owned())]);
    }

    // ── segment_count ─────────────────────────────────────────────────────────

    #[test]
    fn segment_count_counts_separators() {
        assert_eq!(segment_count(&PathSpec::from("/api")), 1);
        assert_eq!(segment_count(&PathSpec::from("/api/:version")), 2);
        assert_eq!(segment_count(&PathSpec::from("/")), 0);
        assert_eq!(
            segment_count(&PathSpec::from(Regex::new(r"^v[0-9]+/admin$").unwrap())),
            2
        );
    }
}
