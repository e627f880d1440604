//! Declarative request schemas.
//!
//! A [`Schema`] checks an untrusted JSON object and reports every violated
//! rule at once, so a client can fix all problems in a single round trip.
//! Handlers then deserialize the validated value into closed `serde` types.

use crate::error::FieldError;
use crate::sanitize::is_reserved_key;
use regex::Regex;
use serde_json::{Map, Number, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringFormat {
    Email,
    Uuid,
    Url,
    /// RFC 3339 timestamp, e.g. `2026-01-02T03:04:05Z`.
    DateTime,
}

#[derive(Debug, Clone)]
enum Pattern {
    Valid(Regex),
    /// A rule that failed to compile rejects every value.
    Invalid(String),
}

#[derive(Debug, Clone)]
enum FieldKind {
    String {
        min_len: Option<usize>,
        max_len: Option<usize>,
        pattern: Option<Pattern>,
        format: Option<StringFormat>,
    },
    Integer {
        min: Option<i64>,
        max: Option<i64>,
    },
    Number {
        min: Option<f64>,
        max: Option<f64>,
    },
    Boolean,
    Enum(Vec<String>),
    Array {
        min_items: Option<usize>,
        max_items: Option<usize>,
        items: Option<Box<Field>>,
    },
    Object(Option<Box<Schema>>),
}

/// Rules for a single field. Fields are optional unless `required()` is called.
#[derive(Debug, Clone)]
pub struct Field {
    kind: FieldKind,
    required: bool,
}

impl Field {
    fn of(kind: FieldKind) -> Self {
        Self {
            kind,
            required: false,
        }
    }

    pub fn string() -> Self {
        Self::of(FieldKind::String {
            min_len: None,
            max_len: None,
            pattern: None,
            format: None,
        })
    }

    pub fn email() -> Self {
        Self::string().format(StringFormat::Email)
    }

    pub fn uuid() -> Self {
        Self::string().format(StringFormat::Uuid)
    }

    pub fn datetime() -> Self {
        Self::string().format(StringFormat::DateTime)
    }

    pub fn integer() -> Self {
        Self::of(FieldKind::Integer {
            min: None,
            max: None,
        })
    }

    pub fn number() -> Self {
        Self::of(FieldKind::Number {
            min: None,
            max: None,
        })
    }

    pub fn boolean() -> Self {
        Self::of(FieldKind::Boolean)
    }

    pub fn one_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::of(FieldKind::Enum(values.into_iter().map(Into::into).collect()))
    }

    pub fn array(items: Option<Field>) -> Self {
        Self::of(FieldKind::Array {
            min_items: None,
            max_items: None,
            items: items.map(Box::new),
        })
    }

    /// An object, optionally validated against a nested schema.
    pub fn object(schema: Option<Schema>) -> Self {
        Self::of(FieldKind::Object(schema.map(Box::new)))
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Minimum characters for strings, minimum items for arrays.
    pub fn min_len(mut self, n: usize) -> Self {
        match &mut self.kind {
            FieldKind::String { min_len, .. } => *min_len = Some(n),
            FieldKind::Array { min_items, .. } => *min_items = Some(n),
            _ => {}
        }
        self
    }

    /// Maximum characters for strings, maximum items for arrays.
    pub fn max_len(mut self, n: usize) -> Self {
        match &mut self.kind {
            FieldKind::String { max_len, .. } => *max_len = Some(n),
            FieldKind::Array { max_items, .. } => *max_items = Some(n),
            _ => {}
        }
        self
    }

    pub fn pattern(mut self, re: &str) -> Self {
        if let FieldKind::String { pattern, .. } = &mut self.kind {
            *pattern = Some(match Regex::new(re) {
                Ok(compiled) => Pattern::Valid(compiled),
                Err(e) => {
                    tracing::error!(pattern = re, "Invalid schema pattern: {e}");
                    Pattern::Invalid(re.to_string())
                }
            });
        }
        self
    }

    pub fn format(mut self, f: StringFormat) -> Self {
        if let FieldKind::String { format, .. } = &mut self.kind {
            *format = Some(f);
        }
        self
    }

    pub fn min(mut self, n: i64) -> Self {
        match &mut self.kind {
            FieldKind::Integer { min, .. } => *min = Some(n),
            FieldKind::Number { min, .. } => *min = Some(n as f64),
            _ => {}
        }
        self
    }

    pub fn max(mut self, n: i64) -> Self {
        match &mut self.kind {
            FieldKind::Integer { max, .. } => *max = Some(n),
            FieldKind::Number { max, .. } => *max = Some(n as f64),
            _ => {}
        }
        self
    }

    fn check(&self, path: &str, value: &Value, errors: &mut Vec<FieldError>) {
        let mut fail = |message: String| errors.push(FieldError::new(path, message));
        match &self.kind {
            FieldKind::String {
                min_len,
                max_len,
                pattern,
                format,
            } => {
                let Some(s) = value.as_str() else {
                    return fail("must be a string".into());
                };
                let len = s.chars().count();
                if let Some(min) = min_len
                    && len < *min
                {
                    fail(format!("must be at least {min} characters"));
                }
                if let Some(max) = max_len
                    && len > *max
                {
                    fail(format!("must be at most {max} characters"));
                }
                match pattern {
                    Some(Pattern::Valid(re)) if !re.is_match(s) => {
                        fail("has an invalid format".into())
                    }
                    Some(Pattern::Invalid(_)) => fail("has an invalid format".into()),
                    _ => {}
                }
                match format {
                    Some(StringFormat::Email) if !is_email(s) => {
                        fail("must be a valid email address".into())
                    }
                    Some(StringFormat::Uuid) if uuid::Uuid::parse_str(s).is_err() => {
                        fail("must be a valid UUID".into())
                    }
                    Some(StringFormat::Url) if url::Url::parse(s).is_err() => {
                        fail("must be a valid URL".into())
                    }
                    Some(StringFormat::DateTime)
                        if chrono::DateTime::parse_from_rfc3339(s).is_err() =>
                    {
                        fail("must be an RFC 3339 timestamp".into())
                    }
                    _ => {}
                }
            }
            FieldKind::Integer { min, max } => {
                let Some(n) = value.as_i64() else {
                    return fail("must be an integer".into());
                };
                if let Some(min) = min
                    && n < *min
                {
                    fail(format!("must be greater than or equal to {min}"));
                }
                if let Some(max) = max
                    && n > *max
                {
                    fail(format!("must be less than or equal to {max}"));
                }
            }
            FieldKind::Number { min, max } => {
                let Some(n) = value.as_f64() else {
                    return fail("must be a number".into());
                };
                if let Some(min) = min
                    && n < *min
                {
                    fail(format!("must be greater than or equal to {min}"));
                }
                if let Some(max) = max
                    && n > *max
                {
                    fail(format!("must be less than or equal to {max}"));
                }
            }
            FieldKind::Boolean => {
                if !value.is_boolean() {
                    fail("must be a boolean".into());
                }
            }
            FieldKind::Enum(allowed) => {
                if !value.as_str().is_some_and(|s| allowed.iter().any(|a| a == s)) {
                    fail(format!("must be one of: {}", allowed.join(", ")));
                }
            }
            FieldKind::Array {
                min_items,
                max_items,
                items,
            } => {
                let Some(list) = value.as_array() else {
                    return fail("must be an array".into());
                };
                if let Some(min) = min_items
                    && list.len() < *min
                {
                    fail(format!("must contain at least {min} items"));
                }
                if let Some(max) = max_items
                    && list.len() > *max
                {
                    fail(format!("must contain at most {max} items"));
                }
                if let Some(item_rule) = items {
                    for (i, item) in list.iter().enumerate() {
                        item_rule.check(&format!("{path}[{i}]"), item, errors);
                    }
                }
            }
            FieldKind::Object(schema) => {
                let Some(map) = value.as_object() else {
                    return fail("must be an object".into());
                };
                if let Some(schema) = schema {
                    schema.check_object(path, map, errors);
                }
            }
        }
    }

    fn coerce(&self, raw: &str) -> Value {
        match &self.kind {
            FieldKind::Integer { .. } => raw
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(raw.to_string())),
            FieldKind::Number { .. } => raw
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(raw.to_string())),
            FieldKind::Boolean => match raw {
                "true" | "1" => Value::Bool(true),
                "false" | "0" => Value::Bool(false),
                _ => Value::String(raw.to_string()),
            },
            FieldKind::Array {
                items: Some(item), ..
            } => Value::Array(vec![item.coerce(raw)]),
            FieldKind::Array { items: None, .. } => {
                Value::Array(vec![Value::String(raw.to_string())])
            }
            _ => Value::String(raw.to_string()),
        }
    }
}

fn is_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !s.chars().any(char::is_whitespace)
}

/// An object schema: named fields plus a policy for unknown keys.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<(String, Field)>,
    allow_unknown: bool,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, rule: Field) -> Self {
        self.fields.push((name.into(), rule));
        self
    }

    /// Accept keys the schema does not declare instead of rejecting them.
    pub fn allow_unknown(mut self) -> Self {
        self.allow_unknown = true;
        self
    }

    /// Validate `value`, collecting every violation.
    pub fn validate(&self, value: &Value) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();
        match value.as_object() {
            Some(map) => self.check_object("", map, &mut errors),
            None => errors.push(FieldError::new("$", "must be a JSON object")),
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn check_object(&self, prefix: &str, map: &Map<String, Value>, errors: &mut Vec<FieldError>) {
        let join = |name: &str| {
            if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}.{name}")
            }
        };

        for (name, rule) in &self.fields {
            match map.get(name) {
                None | Some(Value::Null) => {
                    if rule.required {
                        errors.push(FieldError::new(join(name), "is required"));
                    }
                }
                Some(value) => rule.check(&join(name), value, errors),
            }
        }

        for key in map.keys() {
            let declared = self.fields.iter().any(|(name, _)| name == key);
            if !declared && (!self.allow_unknown || is_reserved_key(key)) {
                errors.push(FieldError::new(join(key), "is not allowed"));
            }
        }
    }

    /// Convert query-string pairs into typed JSON following the declared
    /// field kinds. Values that do not parse stay strings so validation
    /// reports them. Repeated keys accumulate only for array fields.
    pub fn coerce_query(&self, pairs: &[(String, String)]) -> Value {
        let mut out = Map::new();
        for (key, raw) in pairs {
            let rule = self.fields.iter().find(|(name, _)| name == key).map(|(_, r)| r);
            let coerced = match rule {
                Some(rule) => rule.coerce(raw),
                None => Value::String(raw.clone()),
            };
            if let Value::Array(more) = &coerced
                && let Some(Value::Array(existing)) = out.get_mut(key)
            {
                existing.extend(more.iter().cloned());
                continue;
            }
            out.insert(key.clone(), coerced);
        }
        Value::Object(out)
    }
}
