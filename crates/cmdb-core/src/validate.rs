//! Schema validator: checks an attribute map against a CI type definition.
//!
//! Validation is a pure function. Data problems are returned as a list of
//! per-field errors so callers can report all of them at once; an empty list
//! means the attributes conform to the schema.

use std::collections::{HashMap, HashSet};

use regex::Regex;

use crate::error::ValidationError;
use crate::format;
use crate::types::{AttributeDefinition, AttributeType, AttributeValidation, CiTypeDefinition};
use crate::value::{AttrValue, Attributes};

pub const MSG_REQUIRED: &str = "required field is missing";
pub const MSG_UNKNOWN: &str = "unknown attribute for this CI type";

/// Validate `attributes` against `schema`.
///
/// Errors are ordered: required attributes in declaration order, then
/// optional attributes, then unknown keys in key order.
pub fn validate(schema: &CiTypeDefinition, attributes: &Attributes) -> Vec<ValidationError> {
    SchemaValidator::new(schema).validate(attributes)
}

/// A CI type schema with its `pattern` rules compiled.
///
/// Build one per schema and reuse it for every attribute map checked
/// against that schema.
pub struct SchemaValidator<'a> {
    schema: &'a CiTypeDefinition,
    known: HashSet<&'a str>,
    patterns: HashMap<&'a str, Regex>,
}

impl<'a> SchemaValidator<'a> {
    /// A pattern that does not compile is kept out of the map and fails
    /// every value it applies to.
    pub fn new(schema: &'a CiTypeDefinition) -> Self {
        let defs = move || {
            schema
                .required_attributes
                .iter()
                .chain(schema.optional_attributes.iter())
        };
        let known = defs().map(|d| d.name.as_str()).collect();
        let patterns = defs()
            .filter_map(|d| {
                let pattern = d.validation.as_ref()?.pattern.as_deref()?;
                Regex::new(pattern).ok().map(|re| (d.name.as_str(), re))
            })
            .collect();
        Self {
            schema,
            known,
            patterns,
        }
    }

    pub fn schema(&self) -> &CiTypeDefinition {
        self.schema
    }

    pub fn is_valid(&self, attributes: &Attributes) -> bool {
        self.validate(attributes).is_empty()
    }

    pub fn validate(&self, attributes: &Attributes) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for def in &self.schema.required_attributes {
            match attributes.get(&def.name) {
                None | Some(AttrValue::Null) => {
                    errors.push(ValidationError::new(&def.name, MSG_REQUIRED));
                }
                Some(value) => self.validate_attribute(def, value, &mut errors),
            }
        }

        for def in &self.schema.optional_attributes {
            if let Some(value) = attributes.get(&def.name).filter(|v| !v.is_null()) {
                self.validate_attribute(def, value, &mut errors);
            }
        }

        for key in attributes.keys() {
            if !self.known.contains(key.as_str()) {
                errors.push(ValidationError::new(key, MSG_UNKNOWN));
            }
        }

        errors
    }

    fn validate_attribute(
        &self,
        def: &AttributeDefinition,
        value: &AttrValue,
        errors: &mut Vec<ValidationError>,
    ) {
        let rules = def.validation.as_ref();

        match (def.attr_type, value) {
            (AttributeType::String, AttrValue::String(s)) => {
                if let Some(rules) = rules {
                    let pattern = self.patterns.get(def.name.as_str());
                    string_rules(&def.name, s, rules, pattern, errors);
                }
            }
            (AttributeType::Integer, AttrValue::Integer(_) | AttrValue::Float(_)) => {
                if let (Some(rules), Some(n)) = (rules, value.as_coerced_int()) {
                    integer_rules(&def.name, n, rules, errors);
                }
            }
            (AttributeType::Boolean, AttrValue::Bool(_)) => {}
            (AttributeType::Array, AttrValue::Array(items)) => {
                if let Some(rules) = rules {
                    array_rules(&def.name, items, rules, errors);
                }
            }
            (AttributeType::Object, AttrValue::Object(map)) => {
                if let Some(rules) = rules {
                    size_rules(&def.name, map.len(), "properties", "object", rules, errors);
                }
            }
            (expected, _) => errors.push(ValidationError::new(&def.name, type_message(expected))),
        }
    }
}

/// Check a CI type's attribute lists for structural problems: duplicate names
/// within a list, names present in both lists, and patterns that do not compile.
pub fn validate_schema(
    required: &[AttributeDefinition],
    optional: &[AttributeDefinition],
) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let mut required_names = HashSet::new();
    for def in required {
        if !required_names.insert(def.name.as_str()) {
            errors.push(ValidationError::new(
                &def.name,
                format!("duplicate required attribute name: {}", def.name),
            ));
        }
    }

    let mut optional_names = HashSet::new();
    for def in optional {
        if !optional_names.insert(def.name.as_str()) {
            errors.push(ValidationError::new(
                &def.name,
                format!("duplicate optional attribute name: {}", def.name),
            ));
        }
        if required_names.contains(def.name.as_str()) {
            errors.push(ValidationError::new(
                &def.name,
                format!("attribute '{}' exists in both required and optional", def.name),
            ));
        }
    }

    for def in required.iter().chain(optional.iter()) {
        if def.name.trim().is_empty() {
            errors.push(ValidationError::new("name", "attribute name must not be empty"));
        }
        if let Some(pattern) = def.validation.as_ref().and_then(|v| v.pattern.as_deref()) {
            if let Err(e) = Regex::new(pattern) {
                errors.push(ValidationError::new(&def.name, format!("invalid pattern: {e}")));
            }
        }
    }

    errors
}

fn type_message(expected: AttributeType) -> &'static str {
    match expected {
        AttributeType::String => "must be a string",
        AttributeType::Integer => "must be an integer",
        AttributeType::Boolean => "must be a boolean",
        AttributeType::Array => "must be an array",
        AttributeType::Object => "must be an object",
    }
}

fn string_rules(
    field: &str,
    value: &str,
    rules: &AttributeValidation,
    compiled: Option<&Regex>,
    errors: &mut Vec<ValidationError>,
) {
    let len = value.chars().count();
    if let Some(min) = rules.min_length {
        if len < min {
            errors.push(ValidationError::new(field, format!("minimum length is {min}")));
        }
    }
    if let Some(max) = rules.max_length {
        if len > max {
            errors.push(ValidationError::new(field, format!("maximum length is {max}")));
        }
    }

    if let Some(pattern) = rules.pattern.as_deref() {
        let matched = compiled.is_some_and(|re| re.is_match(value));
        if !matched {
            errors.push(ValidationError::new(field, format!("must match pattern: {pattern}")));
        }
    }

    if let Some(fmt) = rules.format {
        if let Some(msg) = format::check(fmt, value) {
            errors.push(ValidationError::new(field, msg));
        }
    }

    if !rules.allowed.is_empty() && !rules.allowed.iter().any(|a| a == value) {
        errors.push(ValidationError::new(field, enum_message(&rules.allowed)));
    }
}

fn integer_rules(field: &str, value: i64, rules: &AttributeValidation, errors: &mut Vec<ValidationError>) {
    if let Some(min) = rules.min {
        if value < min {
            errors.push(ValidationError::new(field, format!("minimum value is {min}")));
        }
    }
    if let Some(max) = rules.max {
        if value > max {
            errors.push(ValidationError::new(field, format!("maximum value is {max}")));
        }
    }
}

fn array_rules(field: &str, items: &[AttrValue], rules: &AttributeValidation, errors: &mut Vec<ValidationError>) {
    size_rules(field, items.len(), "items", "array", rules, errors);

    if rules.allowed.is_empty() {
        return;
    }
    for (i, item) in items.iter().enumerate() {
        if let Some(s) = item.as_str() {
            if !rules.allowed.iter().any(|a| a == s) {
                errors.push(ValidationError::new(
                    format!("{field}[{i}]"),
                    enum_message(&rules.allowed),
                ));
            }
        }
    }
}

fn size_rules(
    field: &str,
    size: usize,
    unit: &str,
    kind: &str,
    rules: &AttributeValidation,
    errors: &mut Vec<ValidationError>,
) {
    if let Some(min) = rules.min_length {
        if size < min {
            errors.push(ValidationError::new(
                field,
                format!("{kind} must have at least {min} {unit}"),
            ));
        }
    }
    if let Some(max) = rules.max_length {
        if size > max {
            errors.push(ValidationError::new(
                field,
                format!("{kind} must have at most {max} {unit}"),
            ));
        }
    }
}

fn enum_message(allowed: &[String]) -> String {
    format!("value must be one of: [{}]", allowed.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttributeFormat, CiTypeId, UserId};
    use chrono::Utc;

    fn schema(required: Vec<AttributeDefinition>, optional: Vec<AttributeDefinition>) -> CiTypeDefinition {
        CiTypeDefinition {
            id: CiTypeId::new(),
            name: "Server".into(),
            description: None,
            required_attributes: required,
            optional_attributes: optional,
            created_by: UserId::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn attrs(json: serde_json::Value) -> Attributes {
        serde_json::from_value(json).unwrap()
    }

    fn server_schema() -> CiTypeDefinition {
        schema(
            vec![
                AttributeDefinition::new("hostname", AttributeType::String).with_validation(
                    AttributeValidation {
                        min_length: Some(1),
                        max_length: Some(255),
                        ..Default::default()
                    },
                ),
                AttributeDefinition::new("ip_address", AttributeType::String).with_validation(
                    AttributeValidation {
                        format: Some(AttributeFormat::Ipv4),
                        ..Default::default()
                    },
                ),
            ],
            vec![
                AttributeDefinition::new("cpu_count", AttributeType::Integer).with_validation(
                    AttributeValidation {
                        min: Some(1),
                        max: Some(256),
                        ..Default::default()
                    },
                ),
                AttributeDefinition::new("managed", AttributeType::Boolean),
            ],
        )
    }

    #[test]
    fn valid_server_passes() {
        let errors = validate(
            &server_schema(),
            &attrs(serde_json::json!({"hostname": "web-1", "ip_address": "10.0.0.5"})),
        );
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn missing_required_reports_single_error() {
        let errors = validate(
            &server_schema(),
            &attrs(serde_json::json!({"ip_address": "10.0.0.5"})),
        );
        assert_eq!(errors, vec![ValidationError::new("hostname", MSG_REQUIRED)]);
    }

    #[test]
    fn null_required_is_missing() {
        let errors = validate(
            &server_schema(),
            &attrs(serde_json::json!({"hostname": null, "ip_address": "10.0.0.5"})),
        );
        assert_eq!(errors, vec![ValidationError::new("hostname", MSG_REQUIRED)]);
    }

    #[test]
    fn bad_ip_reports_format_error() {
        let errors = validate(
            &server_schema(),
            &attrs(serde_json::json!({"hostname": "web-1", "ip_address": "not-an-ip"})),
        );
        assert_eq!(
            errors,
            vec![ValidationError::new("ip_address", "must be a valid IPv4 address")]
        );
    }

    #[test]
    fn type_mismatch_short_circuits() {
        let s = schema(
            vec![AttributeDefinition::new("name", AttributeType::String).with_validation(
                AttributeValidation {
                    min_length: Some(10),
                    format: Some(AttributeFormat::Email),
                    ..Default::default()
                },
            )],
            vec![],
        );
        let errors = validate(&s, &attrs(serde_json::json!({"name": 5})));
        assert_eq!(errors, vec![ValidationError::new("name", "must be a string")]);
    }

    #[test]
    fn integer_accepts_floats_after_truncation() {
        let s = server_schema();
        let ok = validate(
            &s,
            &attrs(serde_json::json!({"hostname": "h", "ip_address": "1.2.3.4", "cpu_count": 256.9})),
        );
        assert!(ok.is_empty());

        let low = validate(
            &s,
            &attrs(serde_json::json!({"hostname": "h", "ip_address": "1.2.3.4", "cpu_count": 0.5})),
        );
        assert_eq!(low, vec![ValidationError::new("cpu_count", "minimum value is 1")]);

        let wrong = validate(
            &s,
            &attrs(serde_json::json!({"hostname": "h", "ip_address": "1.2.3.4", "cpu_count": "4"})),
        );
        assert_eq!(wrong, vec![ValidationError::new("cpu_count", "must be an integer")]);
    }

    #[test]
    fn optional_null_is_skipped_and_unknown_rejected() {
        let errors = validate(
            &server_schema(),
            &attrs(serde_json::json!({
                "hostname": "h",
                "ip_address": "1.2.3.4",
                "managed": null,
                "zz_extra": 1,
                "aa_extra": 2
            })),
        );
        assert_eq!(
            errors,
            vec![
                ValidationError::new("aa_extra", MSG_UNKNOWN),
                ValidationError::new("zz_extra", MSG_UNKNOWN),
            ]
        );
    }

    #[test]
    fn string_length_bounds() {
        let errors = validate(
            &server_schema(),
            &attrs(serde_json::json!({"hostname": "", "ip_address": "1.2.3.4"})),
        );
        assert_eq!(errors, vec![ValidationError::new("hostname", "minimum length is 1")]);

        let long = "x".repeat(256);
        let errors = validate(
            &server_schema(),
            &attrs(serde_json::json!({"hostname": long, "ip_address": "1.2.3.4"})),
        );
        assert_eq!(errors, vec![ValidationError::new("hostname", "maximum length is 255")]);
    }

    #[test]
    fn pattern_is_a_real_regex_match() {
        let s = schema(
            vec![AttributeDefinition::new("code", AttributeType::String).with_validation(
                AttributeValidation {
                    pattern: Some("^[A-Z]{3}-\\d+$".into()),
                    ..Default::default()
                },
            )],
            vec![],
        );
        assert!(validate(&s, &attrs(serde_json::json!({"code": "ABC-12"}))).is_empty());
        assert_eq!(
            validate(&s, &attrs(serde_json::json!({"code": "abc"}))),
            vec![ValidationError::new("code", "must match pattern: ^[A-Z]{3}-\\d+$")]
        );
    }

    #[test]
    fn validator_reuses_compiled_patterns_across_maps() {
        let s = schema(
            vec![AttributeDefinition::new("code", AttributeType::String).with_validation(
                AttributeValidation {
                    pattern: Some("^[a-z]+-\\d{2}$".into()),
                    ..Default::default()
                },
            )],
            vec![AttributeDefinition::new("broken", AttributeType::String).with_validation(
                AttributeValidation {
                    pattern: Some("(".into()),
                    ..Default::default()
                },
            )],
        );
        let validator = SchemaValidator::new(&s);
        assert_eq!(validator.patterns.len(), 1);

        assert!(validator.is_valid(&attrs(serde_json::json!({"code": "web-01"}))));
        assert!(validator.is_valid(&attrs(serde_json::json!({"code": "db-42"}))));
        assert!(!validator.is_valid(&attrs(serde_json::json!({"code": "web-1"}))));
        assert_eq!(
            validator.validate(&attrs(serde_json::json!({"code": "db-42", "broken": "x"}))),
            vec![ValidationError::new("broken", "must match pattern: (")]
        );
    }

    #[test]
    fn enum_applies_to_strings_and_array_elements() {
        let rules = AttributeValidation {
            allowed: vec!["prod".into(), "dev".into()],
            ..Default::default()
        };
        let s = schema(
            vec![AttributeDefinition::new("env", AttributeType::String).with_validation(rules.clone())],
            vec![AttributeDefinition::new("envs", AttributeType::Array).with_validation(
                AttributeValidation {
                    max_length: Some(2),
                    ..rules
                },
            )],
        );
        let errors = validate(
            &s,
            &attrs(serde_json::json!({"env": "qa", "envs": ["prod", "qa", 3]})),
        );
        assert_eq!(
            errors,
            vec![
                ValidationError::new("env", "value must be one of: [prod, dev]"),
                ValidationError::new("envs", "array must have at most 2 items"),
                ValidationError::new("envs[1]", "value must be one of: [prod, dev]"),
            ]
        );
    }

    #[test]
    fn object_property_bounds() {
        let s = schema(
            vec![AttributeDefinition::new("labels", AttributeType::Object).with_validation(
                AttributeValidation {
                    min_length: Some(1),
                    ..Default::default()
                },
            )],
            vec![],
        );
        assert_eq!(
            validate(&s, &attrs(serde_json::json!({"labels": {}}))),
            vec![ValidationError::new("labels", "object must have at least 1 properties")]
        );
        assert_eq!(
            validate(&s, &attrs(serde_json::json!({"labels": []}))),
            vec![ValidationError::new("labels", "must be an object")]
        );
    }

    #[test]
    fn validation_is_idempotent() {
        let s = server_schema();
        let a = attrs(serde_json::json!({"ip_address": "x", "other": true}));
        assert_eq!(validate(&s, &a), validate(&s, &a));
    }

    #[test]
    fn schema_checks_catch_duplicates_and_bad_patterns() {
        let dup = vec![
            AttributeDefinition::new("a", AttributeType::String),
            AttributeDefinition::new("a", AttributeType::String),
        ];
        let errors = validate_schema(&dup, &[]);
        assert_eq!(errors[0].message, "duplicate required attribute name: a");

        let both = validate_schema(
            &[AttributeDefinition::new("a", AttributeType::String)],
            &[AttributeDefinition::new("a", AttributeType::Integer)],
        );
        assert_eq!(both[0].message, "attribute 'a' exists in both required and optional");

        let bad = validate_schema(
            &[AttributeDefinition::new("p", AttributeType::String).with_validation(
                AttributeValidation {
                    pattern: Some("(".into()),
                    ..Default::default()
                },
            )],
            &[],
        );
        assert_eq!(bad.len(), 1);
        assert!(bad[0].message.starts_with("invalid pattern:"));
    }
}
